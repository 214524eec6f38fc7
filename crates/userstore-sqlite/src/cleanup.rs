//! The cleanup queue and the repair job that drains it.
//!
//! Reads enqueue a candidate whenever they drop a duplicate live value. A
//! cleanup run claims candidates by stamping `deleted`, then soft-deletes
//! every duplicate except the one reads already keep: the first by
//! (ordering, created, id) within each array position, or the first overall
//! for a scalar column.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use userstore_core::{
  catalog::Catalog,
  sql::{NOT_DELETED, encode_timestamp, encode_uuid},
  user::UserCleanupCandidate,
};

use crate::{
  Error, Result, SqliteStore,
  encode::{CANDIDATE_COLUMNS, RawCandidate, decode_uuid},
  ingest::{move_to_soft_deleted, select_stored},
};

// ─── Queue ───────────────────────────────────────────────────────────────────

/// Insert candidates, skipping any (user, reason) pair that is already
/// waiting. Returns the number inserted.
fn enqueue_tx(conn: &mut Connection, candidates: &[UserCleanupCandidate]) -> rusqlite::Result<usize> {
  let tx = conn.transaction()?;
  let mut inserted = 0;
  for candidate in candidates {
    inserted += tx.execute(
      &format!(
        "INSERT INTO user_cleanup_candidates ({CANDIDATE_COLUMNS})
         SELECT ?1, ?2, ?3, ?4, ?5, ?6
         WHERE NOT EXISTS (
           SELECT 1 FROM user_cleanup_candidates
           WHERE user_id = ?5 AND reason = ?6 AND deleted = ?4
         )"
      ),
      rusqlite::params![
        encode_uuid(candidate.id),
        encode_timestamp(candidate.created),
        encode_timestamp(candidate.updated),
        NOT_DELETED,
        encode_uuid(candidate.user_id),
        candidate.reason.as_ref(),
      ],
    )?;
  }
  tx.commit()?;
  Ok(inserted)
}

/// Claim up to `limit` waiting candidates, oldest first.
///
/// The claim only succeeds if every selected row is still unclaimed when
/// it is stamped; otherwise nothing is claimed.
fn claim_tx(conn: &mut Connection, limit: usize) -> Result<Vec<RawCandidate>> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let selected = {
    let mut stmt = tx.prepare(&format!(
      "SELECT {CANDIDATE_COLUMNS} FROM user_cleanup_candidates
       WHERE deleted = ?1 ORDER BY created, id LIMIT ?2"
    ))?;
    stmt
      .query_map(
        rusqlite::params![NOT_DELETED, i64::try_from(limit).unwrap_or(i64::MAX)],
        RawCandidate::read,
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  if selected.is_empty() {
    return Ok(selected);
  }

  let now = encode_timestamp(Utc::now());
  let ids = serde_json::to_string(&selected.iter().map(|c| c.id.as_str()).collect::<Vec<_>>())?;
  let claimed = tx.execute(
    "UPDATE user_cleanup_candidates SET deleted = ?1, updated = ?1
     WHERE id IN (SELECT value FROM json_each(?2)) AND deleted = ?3",
    rusqlite::params![now, ids, NOT_DELETED],
  )?;
  if claimed != selected.len() {
    return Err(Error::ClaimMismatch { selected: selected.len(), claimed });
  }
  tx.commit()?;

  Ok(
    selected
      .into_iter()
      .map(|c| RawCandidate { deleted: now.clone(), updated: now.clone(), ..c })
      .collect(),
  )
}

fn pending_tx(conn: &Connection) -> rusqlite::Result<usize> {
  conn.query_row(
    "SELECT COUNT(*) FROM user_cleanup_candidates WHERE deleted = ?1",
    rusqlite::params![NOT_DELETED],
    |row| row.get::<_, i64>(0),
  )
  .map(|n| usize::try_from(n).unwrap_or_default())
}

// ─── Repair ──────────────────────────────────────────────────────────────────

/// Find the user's duplicate live values and, unless `dry_run`, soft-delete
/// them. Returns the ids of the duplicates.
fn repair_tx(
  conn: &mut Connection,
  catalog: &Catalog,
  user_id: Uuid,
  retention_until: DateTime<Utc>,
  dry_run: bool,
) -> Result<Vec<String>> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let rows = select_stored(&tx, "user_column_pre_delete_values", "user_id = ?1", &encode_uuid(user_id))?;

  let mut kept = HashSet::new();
  let mut duplicates = Vec::new();
  for raw in rows {
    let column_id = decode_uuid(&raw.column_id)?;
    let Some(desc) = catalog.column_by_id(column_id) else {
      tracing::warn!(%user_id, %column_id, "value for unknown column left in place");
      continue;
    };
    let position = if desc.is_array() { Some(raw.ordering) } else { None };
    if !kept.insert((column_id, position)) {
      duplicates.push(raw);
    }
  }

  let ids: Vec<String> = duplicates.iter().map(|raw| raw.id.clone()).collect();
  if !dry_run {
    for raw in duplicates {
      move_to_soft_deleted(&tx, catalog, raw, retention_until)?;
    }
    tx.commit()?;
  }
  Ok(ids)
}

// ─── Store surface ───────────────────────────────────────────────────────────

impl SqliteStore {
  /// Queue users for repair. Candidates already waiting for the same user
  /// and reason are not duplicated.
  pub async fn enqueue_cleanup(&self, candidates: Vec<UserCleanupCandidate>) -> Result<usize> {
    let count = candidates.len();
    let inserted = self
      .conn
      .call(move |conn| Ok(enqueue_tx(conn, &candidates)?))
      .await?;
    tracing::debug!(count, inserted, "enqueued cleanup candidates");
    Ok(inserted)
  }

  /// Claim up to `limit` waiting candidates.
  pub async fn dequeue_up_to(&self, limit: usize) -> Result<Vec<UserCleanupCandidate>> {
    let raws = self.conn.call(move |conn| Ok(claim_tx(conn, limit))).await??;
    raws.into_iter().map(RawCandidate::into_candidate).collect()
  }

  /// Candidates not yet claimed.
  pub async fn pending_cleanup(&self) -> Result<usize> {
    Ok(self.conn.call(|conn| Ok(pending_tx(conn)?)).await?)
  }

  /// Claim up to `max_candidates` and repair each user. A dry run changes
  /// nothing: it logs the values it would remove and puts the candidates
  /// back. Returns the number of candidates still waiting.
  ///
  /// A candidate whose repair fails is put back too, and the run carries on
  /// with the rest before returning the first failure.
  pub(crate) async fn run_cleanup(&self, max_candidates: usize, dry_run: bool) -> Result<usize> {
    let claimed = self.dequeue_up_to(max_candidates).await?;
    let catalog = self.catalog.snapshot();
    let retention_until = Utc::now() + self.soft_delete_retention;

    let mut requeue = Vec::new();
    let mut first_error = None;
    for candidate in &claimed {
      let user_id = candidate.user_id;
      let tx_catalog = catalog.clone();
      let repaired = self
        .conn
        .call(move |conn| Ok(repair_tx(conn, &tx_catalog, user_id, retention_until, dry_run)))
        .await
        .map_err(Error::from)
        .and_then(|r| r);

      match repaired {
        Ok(duplicates) if dry_run => {
          tracing::info!(
            %user_id,
            reason = %candidate.reason,
            values = ?duplicates,
            "dry run: would soft-delete duplicate values"
          );
          requeue.push(UserCleanupCandidate::new(user_id, candidate.reason));
        }
        Ok(duplicates) => {
          tracing::info!(%user_id, removed = duplicates.len(), "repaired user");
        }
        Err(error) => {
          tracing::error!(%user_id, %error, "repair failed; candidate requeued");
          requeue.push(UserCleanupCandidate::new(user_id, candidate.reason));
          first_error.get_or_insert(error);
        }
      }
    }
    if !requeue.is_empty() {
      self.enqueue_cleanup(requeue).await?;
    }
    if let Some(error) = first_error {
      return Err(error);
    }

    let remaining = self.pending_cleanup().await?;
    tracing::info!(claimed = claimed.len(), remaining, dry_run, "cleanup run finished");
    Ok(remaining)
  }
}

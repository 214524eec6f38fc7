//! SQL schema for one region's store.
//!
//! Executed once at connection startup. Both value tables share a layout;
//! only the live table enforces uniqueness of the unique payload slots.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA case_sensitive_like = ON;

CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    _version        INTEGER NOT NULL DEFAULT 1,
    created         TEXT NOT NULL,
    updated         TEXT NOT NULL,
    -- '0001-01-01T00:00:00.000000Z' while live
    deleted         TEXT NOT NULL DEFAULT '0001-01-01T00:00:00.000000Z'
);

CREATE TABLE IF NOT EXISTS user_column_pre_delete_values (
    id                    TEXT PRIMARY KEY,
    _version              INTEGER NOT NULL DEFAULT 1,
    created               TEXT NOT NULL,
    updated               TEXT NOT NULL,
    user_id               TEXT NOT NULL REFERENCES users(id),
    column_id             TEXT NOT NULL,
    value_type            INTEGER NOT NULL,
    ordering              INTEGER NOT NULL DEFAULT 0,
    consented_purpose_ids TEXT NOT NULL,   -- JSON array of uuids
    retention_timeouts    TEXT NOT NULL,   -- JSON array, parallel to the above
    varchar_value         TEXT,
    varchar_unique_value  TEXT,
    boolean_value         INTEGER,
    int_value             INTEGER,
    int_unique_value      INTEGER,
    timestamp_value       TEXT,
    uuid_value            TEXT,
    uuid_unique_value     TEXT,
    jsonb_value           TEXT
);

CREATE TABLE IF NOT EXISTS user_column_post_delete_values (
    id                    TEXT PRIMARY KEY,
    _version              INTEGER NOT NULL DEFAULT 1,
    created               TEXT NOT NULL,
    updated               TEXT NOT NULL,
    user_id               TEXT NOT NULL REFERENCES users(id),
    column_id             TEXT NOT NULL,
    value_type            INTEGER NOT NULL,
    ordering              INTEGER NOT NULL DEFAULT 0,
    consented_purpose_ids TEXT NOT NULL,
    retention_timeouts    TEXT NOT NULL,
    varchar_value         TEXT,
    varchar_unique_value  TEXT,
    boolean_value         INTEGER,
    int_value             INTEGER,
    int_unique_value      INTEGER,
    timestamp_value       TEXT,
    uuid_value            TEXT,
    uuid_unique_value     TEXT,
    jsonb_value           TEXT
);

-- Claimed candidates keep their row with `deleted` set.
CREATE TABLE IF NOT EXISTS user_cleanup_candidates (
    id      TEXT PRIMARY KEY,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    deleted TEXT NOT NULL DEFAULT '0001-01-01T00:00:00.000000Z',
    user_id TEXT NOT NULL,
    reason  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS users_deleted_idx ON users(deleted, id);
CREATE INDEX IF NOT EXISTS pre_user_column_idx  ON user_column_pre_delete_values(user_id, column_id);
CREATE INDEX IF NOT EXISTS post_user_column_idx ON user_column_post_delete_values(user_id, column_id);
CREATE INDEX IF NOT EXISTS pre_varchar_idx ON user_column_pre_delete_values(column_id, varchar_value);

CREATE UNIQUE INDEX IF NOT EXISTS pre_varchar_unique_idx
    ON user_column_pre_delete_values(column_id, varchar_unique_value)
    WHERE varchar_unique_value IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS pre_int_unique_idx
    ON user_column_pre_delete_values(column_id, int_unique_value)
    WHERE int_unique_value IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS pre_uuid_unique_idx
    ON user_column_pre_delete_values(column_id, uuid_unique_value)
    WHERE uuid_unique_value IS NOT NULL;

CREATE INDEX IF NOT EXISTS cleanup_pending_idx ON user_cleanup_candidates(deleted, created);

PRAGMA user_version = 1;
";

//! The column and data-type catalog.
//!
//! Catalog *management* lives outside this crate. What lives here is a
//! validated, immutable [`Catalog`] snapshot and the [`CatalogCache`] that
//! hands snapshots to readers and swaps them on refresh.
//!
//! Every column resolves to a [`ColumnDescriptor`] built once when the
//! snapshot is constructed. The descriptor records which physical payload
//! slot the column's values occupy in each lifecycle state, so the query
//! builder and the row processor never have to re-derive it.

use std::{
  collections::{HashMap, HashSet},
  sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
  },
};

use convert_case::{Case, Casing as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, value::LifecycleState};

// ─── Data types ──────────────────────────────────────────────────────────────

/// The native scalar types a column (or a composite sub-field) can hold.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
  strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScalarType {
  String,
  Boolean,
  Integer,
  Timestamp,
  Uuid,
}

/// One named, typed field of a composite data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeField {
  pub name:       String,
  pub field_type: ScalarType,
}

impl CompositeField {
  /// The key this field is stored under in JSON and addressed by in
  /// selectors (`{col}->>'key'`).
  pub fn key(&self) -> String { self.name.to_case(Case::Snake) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataTypeKind {
  String,
  Boolean,
  Integer,
  Timestamp,
  Uuid,
  Composite { fields: Vec<CompositeField> },
}

impl DataTypeKind {
  pub fn scalar(&self) -> Option<ScalarType> {
    match self {
      DataTypeKind::String => Some(ScalarType::String),
      DataTypeKind::Boolean => Some(ScalarType::Boolean),
      DataTypeKind::Integer => Some(ScalarType::Integer),
      DataTypeKind::Timestamp => Some(ScalarType::Timestamp),
      DataTypeKind::Uuid => Some(ScalarType::Uuid),
      DataTypeKind::Composite { .. } => None,
    }
  }

  pub fn from_scalar(scalar: ScalarType) -> Self {
    match scalar {
      ScalarType::String => DataTypeKind::String,
      ScalarType::Boolean => DataTypeKind::Boolean,
      ScalarType::Integer => DataTypeKind::Integer,
      ScalarType::Timestamp => DataTypeKind::Timestamp,
      ScalarType::Uuid => DataTypeKind::Uuid,
    }
  }

  /// Find a composite sub-field by its selector key.
  pub fn field(&self, key: &str) -> Option<&CompositeField> {
    match self {
      DataTypeKind::Composite { fields } => fields.iter().find(|f| f.key() == key),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataType {
  pub id:   Uuid,
  pub name: String,
  #[serde(flatten)]
  pub kind: DataTypeKind,
}

/// Well-known IDs of the native data types, present in every catalog.
pub mod builtin {
  use uuid::Uuid;

  pub const STRING:    Uuid = Uuid::from_u128(0xd26b6d52_a8d7_4c2f_9efc_394eb90a3294);
  pub const BOOLEAN:   Uuid = Uuid::from_u128(0x4a8f2d1e_3b6c_4f7a_9d2e_1c5b8a7f6e30);
  pub const INTEGER:   Uuid = Uuid::from_u128(0x7c3e9b2a_5d1f_4e8c_a6b3_2f9d4c1e8a71);
  pub const TIMESTAMP: Uuid = Uuid::from_u128(0x66a9c6b2_1f3d_4c5e_8b7a_9e2d3f4a5b62);
  pub const UUID:      Uuid = Uuid::from_u128(0xd036bbba_6012_4d74_b7c4_5c2e9ff0c5e4);
}

impl DataType {
  /// The built-in data type for a native scalar.
  pub fn native(scalar: ScalarType) -> Self {
    let id = match scalar {
      ScalarType::String => builtin::STRING,
      ScalarType::Boolean => builtin::BOOLEAN,
      ScalarType::Integer => builtin::INTEGER,
      ScalarType::Timestamp => builtin::TIMESTAMP,
      ScalarType::Uuid => builtin::UUID,
    };
    Self { id, name: scalar.to_string(), kind: DataTypeKind::from_scalar(scalar) }
  }
}

// ─── Columns ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
  #[default]
  None,
  Indexed,
  Unique,
}

/// Built-in attributes stored directly on the `users` table.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash,
  strum::Display, strum::EnumString, strum::EnumIter, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum SystemColumn {
  Id,
  Created,
  Updated,
  OrganizationId,
  Version,
}

impl SystemColumn {
  /// Physical column on the `users` table.
  pub fn field(self) -> &'static str {
    match self {
      SystemColumn::Id => "id",
      SystemColumn::Created => "created",
      SystemColumn::Updated => "updated",
      SystemColumn::OrganizationId => "organization_id",
      SystemColumn::Version => "_version",
    }
  }

  pub fn scalar(self) -> ScalarType {
    match self {
      SystemColumn::Id | SystemColumn::OrganizationId => ScalarType::Uuid,
      SystemColumn::Created | SystemColumn::Updated => ScalarType::Timestamp,
      SystemColumn::Version => ScalarType::Integer,
    }
  }

  pub fn column_id(self) -> Uuid {
    match self {
      SystemColumn::Id => Uuid::from_u128(0xfe20fd48_a006_4ad8_9208_4aad540d8794),
      SystemColumn::Created => Uuid::from_u128(0x0ec2c4d7_f3c6_4d70_92e1_54b0bdc5b2ec),
      SystemColumn::Updated => Uuid::from_u128(0x12b3f133_4ad3_4b41_9c93_3fca2d9a87a1),
      SystemColumn::OrganizationId => Uuid::from_u128(0x4e4e1d5c_8f3a_4e1b_b6c1_4c0e6b3e2d90),
      SystemColumn::Version => Uuid::from_u128(0x9a3bd2c4_5e6f_4a7b_8c9d_0e1f2a3b4c5d),
    }
  }

  pub fn column(self) -> Column {
    Column {
      id:         self.column_id(),
      name:       self.to_string(),
      data_type:  DataType::native(self.scalar()).id,
      is_array:   false,
      index_type: IndexType::Indexed,
      is_system:  true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
  pub id:         Uuid,
  pub name:       String,
  pub data_type:  Uuid,
  #[serde(default)]
  pub is_array:   bool,
  #[serde(default)]
  pub index_type: IndexType,
  #[serde(default)]
  pub is_system:  bool,
}

// ─── Value slots ─────────────────────────────────────────────────────────────

/// Physical payload columns of the value tables. Exactly one is populated per
/// row; the discriminant is what `value_type` stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(i64)]
pub enum ValueSlot {
  Varchar       = 1,
  UniqueVarchar = 2,
  Boolean       = 3,
  Int           = 4,
  UniqueInt     = 5,
  Timestamp     = 6,
  Uuid          = 7,
  UniqueUuid    = 8,
  Jsonb         = 9,
}

impl ValueSlot {
  pub fn column(self) -> &'static str {
    match self {
      ValueSlot::Varchar => "varchar_value",
      ValueSlot::UniqueVarchar => "varchar_unique_value",
      ValueSlot::Boolean => "boolean_value",
      ValueSlot::Int => "int_value",
      ValueSlot::UniqueInt => "int_unique_value",
      ValueSlot::Timestamp => "timestamp_value",
      ValueSlot::Uuid => "uuid_value",
      ValueSlot::UniqueUuid => "uuid_unique_value",
      ValueSlot::Jsonb => "jsonb_value",
    }
  }

  pub fn discriminant(self) -> i64 { self as i64 }

  pub fn from_discriminant(d: i64) -> Result<Self> {
    use strum::IntoEnumIterator as _;
    ValueSlot::iter()
      .find(|s| s.discriminant() == d)
      .ok_or_else(|| Error::Decode(format!("unknown value_type {d}")))
  }

  /// All payload columns in table order.
  pub fn all() -> impl Iterator<Item = ValueSlot> {
    use strum::IntoEnumIterator as _;
    ValueSlot::iter()
  }

  /// Slot for a column of `kind`, given its index kind, array-ness and the
  /// lifecycle state of the table. Soft-deleted rows never occupy a unique
  /// slot, and neither do array columns.
  fn resolve(
    kind:  &DataTypeKind,
    index: IndexType,
    array: bool,
    state: LifecycleState,
  ) -> ValueSlot {
    let unique = index == IndexType::Unique && !array && state == LifecycleState::Live;
    match kind {
      DataTypeKind::String if unique => ValueSlot::UniqueVarchar,
      DataTypeKind::String => ValueSlot::Varchar,
      DataTypeKind::Boolean => ValueSlot::Boolean,
      DataTypeKind::Integer if unique => ValueSlot::UniqueInt,
      DataTypeKind::Integer => ValueSlot::Int,
      DataTypeKind::Timestamp => ValueSlot::Timestamp,
      DataTypeKind::Uuid if unique => ValueSlot::UniqueUuid,
      DataTypeKind::Uuid => ValueSlot::Uuid,
      DataTypeKind::Composite { .. } => ValueSlot::Jsonb,
    }
  }
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// Where a column's data physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAccess {
  System(SystemColumn),
  Value { live: ValueSlot, soft_deleted: ValueSlot },
}

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
  pub column:    Column,
  pub data_type: DataType,
  pub access:    ColumnAccess,
}

impl ColumnDescriptor {
  pub fn id(&self) -> Uuid { self.column.id }

  pub fn name(&self) -> &str { &self.column.name }

  pub fn is_array(&self) -> bool { self.column.is_array }

  pub fn system(&self) -> Option<SystemColumn> {
    match self.access {
      ColumnAccess::System(s) => Some(s),
      ColumnAccess::Value { .. } => None,
    }
  }

  pub fn is_system(&self) -> bool { self.system().is_some() }

  pub fn kind(&self) -> &DataTypeKind { &self.data_type.kind }

  /// Payload slot for values in `state`; `None` for system columns.
  pub fn slot(&self, state: LifecycleState) -> Option<ValueSlot> {
    match self.access {
      ColumnAccess::System(_) => None,
      ColumnAccess::Value { live, .. } if state == LifecycleState::Live => Some(live),
      ColumnAccess::Value { soft_deleted, .. } => Some(soft_deleted),
    }
  }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// The serialisable form of a catalog: user-defined data types and columns.
/// Native types and system columns are added implicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDefinition {
  #[serde(default)]
  pub data_types: Vec<DataType>,
  #[serde(default)]
  pub columns:    Vec<Column>,
}

/// A validated, immutable catalog snapshot.
#[derive(Debug, Clone)]
pub struct Catalog {
  data_types: HashMap<Uuid, DataType>,
  columns:    Vec<ColumnDescriptor>,
  by_id:      HashMap<Uuid, usize>,
  by_name:    HashMap<String, usize>,
}

impl Catalog {
  /// Build a catalog, checking every column against its data type and
  /// computing its slot descriptor.
  pub fn new(definition: CatalogDefinition) -> Result<Self> {
    use strum::IntoEnumIterator as _;

    let mut data_types = HashMap::new();
    for scalar in [
      ScalarType::String,
      ScalarType::Boolean,
      ScalarType::Integer,
      ScalarType::Timestamp,
      ScalarType::Uuid,
    ] {
      let dt = DataType::native(scalar);
      data_types.insert(dt.id, dt);
    }
    for dt in definition.data_types {
      validate_data_type(&dt)?;
      if data_types.insert(dt.id, dt.clone()).is_some() {
        return Err(Error::InvalidCatalog(format!("duplicate data type id {}", dt.id)));
      }
    }

    let mut catalog = Catalog {
      data_types,
      columns: Vec::new(),
      by_id: HashMap::new(),
      by_name: HashMap::new(),
    };

    for system in SystemColumn::iter() {
      catalog.push(system.column(), ColumnAccess::System(system))?;
    }

    for column in definition.columns {
      if column.is_system {
        return Err(Error::InvalidCatalog(format!(
          "column {:?} cannot be declared as a system column",
          column.name
        )));
      }
      if column.name.is_empty() || column.name.contains(['{', '}', '\'']) {
        return Err(Error::InvalidCatalog(format!("invalid column name {:?}", column.name)));
      }
      let kind = catalog
        .data_types
        .get(&column.data_type)
        .map(|dt| dt.kind.clone())
        .ok_or_else(|| {
          Error::InvalidCatalog(format!(
            "column {:?} references unknown data type {}",
            column.name, column.data_type
          ))
        })?;
      if column.index_type == IndexType::Unique
        && !matches!(kind, DataTypeKind::String | DataTypeKind::Integer | DataTypeKind::Uuid)
      {
        return Err(Error::InvalidCatalog(format!(
          "column {:?} cannot be unique: its type has no unique slot",
          column.name
        )));
      }
      let access = ColumnAccess::Value {
        live:         ValueSlot::resolve(&kind, column.index_type, column.is_array, LifecycleState::Live),
        soft_deleted: ValueSlot::resolve(&kind, column.index_type, column.is_array, LifecycleState::SoftDeleted),
      };
      catalog.push(column, access)?;
    }

    Ok(catalog)
  }

  fn push(&mut self, column: Column, access: ColumnAccess) -> Result<()> {
    let data_type = self
      .data_types
      .get(&column.data_type)
      .cloned()
      .ok_or_else(|| Error::InvalidCatalog(format!("unknown data type {}", column.data_type)))?;
    if self.by_id.contains_key(&column.id) {
      return Err(Error::InvalidCatalog(format!("duplicate column id {}", column.id)));
    }
    if self.by_name.contains_key(&column.name) {
      return Err(Error::InvalidCatalog(format!("duplicate column name {:?}", column.name)));
    }
    let index = self.columns.len();
    self.by_id.insert(column.id, index);
    self.by_name.insert(column.name.clone(), index);
    self.columns.push(ColumnDescriptor { column, data_type, access });
    Ok(())
  }

  /// Case-sensitive lookup.
  pub fn column_by_name(&self, name: &str) -> Option<&ColumnDescriptor> {
    self.by_name.get(name).map(|&i| &self.columns[i])
  }

  pub fn column_by_id(&self, id: Uuid) -> Option<&ColumnDescriptor> {
    self.by_id.get(&id).map(|&i| &self.columns[i])
  }

  pub fn data_type_by_id(&self, id: Uuid) -> Option<&DataType> { self.data_types.get(&id) }

  /// Every column, system columns first.
  pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> { self.columns.iter() }

  /// Every user-defined (value-table) column.
  pub fn value_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
    self.columns.iter().filter(|c| !c.is_system())
  }
}

fn validate_data_type(dt: &DataType) -> Result<()> {
  let DataTypeKind::Composite { fields } = &dt.kind else {
    return Err(Error::InvalidCatalog(format!(
      "data type {:?} redefines a native type; only composites may be declared",
      dt.name
    )));
  };
  if fields.is_empty() {
    return Err(Error::InvalidCatalog(format!("composite type {:?} has no fields", dt.name)));
  }
  let mut keys = HashSet::new();
  for field in fields {
    if !keys.insert(field.key()) {
      return Err(Error::InvalidCatalog(format!(
        "composite type {:?} has two fields named {:?}",
        dt.name,
        field.key()
      )));
    }
  }
  Ok(())
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Something that can produce a fresh catalog snapshot.
pub trait CatalogSource: Send + Sync {
  fn load(&self) -> Result<Catalog>;
}

/// Shared holder of the current catalog snapshot.
///
/// Readers take an `Arc<Catalog>` and keep it for the duration of one
/// operation, so a concurrent refresh never changes the catalog mid-query.
pub struct CatalogCache {
  current: RwLock<Arc<Catalog>>,
  stale:   AtomicBool,
  source:  Option<Box<dyn CatalogSource>>,
}

impl CatalogCache {
  pub fn new(catalog: Catalog) -> Self {
    Self {
      current: RwLock::new(Arc::new(catalog)),
      stale:   AtomicBool::new(false),
      source:  None,
    }
  }

  /// Load the initial snapshot from `source` and keep it for refreshes.
  pub fn with_source(source: impl CatalogSource + 'static) -> Result<Self> {
    let catalog = source.load()?;
    Ok(Self {
      current: RwLock::new(Arc::new(catalog)),
      stale:   AtomicBool::new(false),
      source:  Some(Box::new(source)),
    })
  }

  /// The current snapshot. If the cache was invalidated and has a source,
  /// reload first; a failed reload keeps serving the previous snapshot.
  pub fn snapshot(&self) -> Arc<Catalog> {
    if self.source.is_some() && self.stale.load(Ordering::Acquire) {
      if let Err(error) = self.refresh() {
        tracing::warn!(%error, "catalog reload failed; serving previous snapshot");
      }
    }
    self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Swap in a new snapshot.
  pub fn replace(&self, catalog: Catalog) {
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    self.stale.store(false, Ordering::Release);
  }

  /// Mark the snapshot stale; the next [`snapshot`](Self::snapshot) reloads.
  pub fn invalidate(&self) { self.stale.store(true, Ordering::Release); }

  pub fn is_stale(&self) -> bool { self.stale.load(Ordering::Acquire) }

  /// Reload from the source now.
  pub fn refresh(&self) -> Result<Arc<Catalog>> {
    let Some(source) = &self.source else {
      return Err(Error::InvalidCatalog("catalog cache has no source to refresh from".into()));
    };
    let catalog = Arc::new(source.load()?);
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = catalog.clone();
    self.stale.store(false, Ordering::Release);
    tracing::info!(columns = catalog.columns.len(), "catalog refreshed");
    Ok(catalog)
  }
}

impl std::fmt::Debug for CatalogCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CatalogCache")
      .field("stale", &self.is_stale())
      .field("has_source", &self.source.is_some())
      .finish()
  }
}

// ─── Test fixtures ───────────────────────────────────────────────────────────

/// A small catalog shared by tests here and in downstream crates.
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
  use super::*;

  pub const ADDRESS: Uuid = Uuid::from_u128(0xa0);

  pub const EMAIL:    Uuid = Uuid::from_u128(0xc1);
  pub const NAME:     Uuid = Uuid::from_u128(0xc2);
  pub const AGE:      Uuid = Uuid::from_u128(0xc3);
  pub const ACTIVE:   Uuid = Uuid::from_u128(0xc4);
  pub const BIRTHDAY: Uuid = Uuid::from_u128(0xc5);
  pub const FRIEND:   Uuid = Uuid::from_u128(0xc6);
  pub const PHONES:   Uuid = Uuid::from_u128(0xc7);
  pub const HOME:     Uuid = Uuid::from_u128(0xc8);
  pub const HANDLE:   Uuid = Uuid::from_u128(0xc9);

  fn column(id: Uuid, name: &str, data_type: Uuid) -> Column {
    Column {
      id,
      name: name.into(),
      data_type,
      is_array: false,
      index_type: IndexType::None,
      is_system: false,
    }
  }

  pub fn catalog() -> Catalog {
    let address = DataType {
      id:   ADDRESS,
      name: "address".into(),
      kind: DataTypeKind::Composite {
        fields: vec![
          CompositeField { name: "String".into(), field_type: ScalarType::String },
          CompositeField { name: "StreetNumber".into(), field_type: ScalarType::Integer },
          CompositeField { name: "Verified".into(), field_type: ScalarType::Boolean },
        ],
      },
    };
    let mut handle = column(HANDLE, "handle", builtin::STRING);
    handle.index_type = IndexType::Unique;
    let mut phones = column(PHONES, "phones", builtin::STRING);
    phones.is_array = true;

    Catalog::new(CatalogDefinition {
      data_types: vec![address],
      columns:    vec![
        column(EMAIL, "email", builtin::STRING),
        column(NAME, "name", builtin::STRING),
        column(AGE, "age", builtin::INTEGER),
        column(ACTIVE, "active", builtin::BOOLEAN),
        column(BIRTHDAY, "birthday", builtin::TIMESTAMP),
        column(FRIEND, "friend", builtin::UUID),
        phones,
        column(HOME, "home", ADDRESS),
        handle,
      ],
    })
    .unwrap()
  }
}

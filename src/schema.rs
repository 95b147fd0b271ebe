//! Versioned table layout for the engine database.
//!
//! Four tables live in one SQLite file: `cache`, `cookie`, `download` and
//! `upload`. The installed layout version is kept in `PRAGMA user_version`.
//!
//! Known upgrades (`1 -> 3`, `2 -> 3`) add columns to transfer tables still
//! laid out as the old version. Every other table, and every other version
//! pair (downgrades included), falls back to dropping and recreating the
//! tables whose live columns differ from the expected ones. That fallback
//! discards the rows of those tables.

use crate::error::TransferError;
use log::{debug, info, warn};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};

pub const SCHEMA_VERSION: i64 = 3;

pub const TABLE_CACHE: &str = "cache";
pub const TABLE_COOKIE: &str = "cookie";
pub const TABLE_DOWNLOAD: &str = "download";
pub const TABLE_UPLOAD: &str = "upload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Blob,
}

impl ColumnKind {
    fn sql(self) -> &'static str {
        match self {
            ColumnKind::Text => "VARCHAR",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub is_primary_key: bool,
    pub is_unique: bool,
}

macro_rules! column {
    ($name:expr, $kind:ident) => {
        Column {
            name: $name,
            kind: ColumnKind::$kind,
            is_primary_key: false,
            is_unique: false,
        }
    };
    ($name:expr, $kind:ident, key) => {
        Column {
            name: $name,
            kind: ColumnKind::$kind,
            is_primary_key: true,
            is_unique: true,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Column groups that are unique together.
    pub unique_groups: &'static [&'static [&'static str]],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.name.to_string()).collect()
    }

    pub fn create_sql(&self) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (", self.name);
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("{} {}", column.name, column.kind.sql()));
            if column.is_primary_key {
                sql.push_str(" PRIMARY KEY");
            }
            if column.is_unique {
                sql.push_str(" UNIQUE");
            }
        }
        for group in self.unique_groups {
            sql.push_str(&format!(", UNIQUE ({})", group.join(", ")));
        }
        sql.push(')');
        sql
    }

    /// True when a live table with these columns must be rebuilt.
    pub fn needs_rebuild(&self, live_columns: &BTreeSet<String>) -> bool {
        *live_columns != self.column_names()
    }
}

const TRANSFER_COLUMNS_V1: &[Column] = &[
    column!("tag", Text, key),
    column!("url", Text),
    column!("folder", Text),
    column!("file_path", Text),
    column!("file_name", Text),
    column!("fraction", Text),
    column!("total_size", Integer),
    column!("current_size", Integer),
    column!("status", Integer),
    column!("priority", Integer),
    column!("date", Integer),
    column!("request", Blob),
    column!("extra1", Blob),
    column!("extra2", Blob),
    column!("extra3", Blob),
];

const TRANSFER_COLUMNS_V2: &[Column] = &[
    column!("tag", Text, key),
    column!("url", Text),
    column!("folder", Text),
    column!("file_path", Text),
    column!("file_name", Text),
    column!("fraction", Text),
    column!("total_size", Integer),
    column!("current_size", Integer),
    column!("status", Integer),
    column!("priority", Integer),
    column!("date", Integer),
    column!("request", Blob),
    column!("extra1", Blob),
    column!("extra2", Blob),
    column!("extra3", Blob),
    column!("file_suffix", Text),
];

const TRANSFER_COLUMNS_V3: &[Column] = &[
    column!("tag", Text, key),
    column!("url", Text),
    column!("folder", Text),
    column!("file_path", Text),
    column!("file_name", Text),
    column!("fraction", Text),
    column!("total_size", Integer),
    column!("current_size", Integer),
    column!("status", Integer),
    column!("priority", Integer),
    column!("date", Integer),
    column!("request", Blob),
    column!("extra1", Blob),
    column!("extra2", Blob),
    column!("extra3", Blob),
    column!("file_suffix", Text),
    column!("temp_file_name", Text),
];

pub const CACHE_TABLE: TableSchema = TableSchema {
    name: TABLE_CACHE,
    columns: &[
        column!("key", Text, key),
        column!("local_expire", Integer),
        column!("head", Blob),
        column!("data", Blob),
    ],
    unique_groups: &[],
};

pub const COOKIE_TABLE: TableSchema = TableSchema {
    name: TABLE_COOKIE,
    columns: &[
        column!("host", Text),
        column!("name", Text),
        column!("domain", Text),
        column!("cookie", Blob),
    ],
    unique_groups: &[&["host", "name", "domain"]],
};

pub const DOWNLOAD_TABLE: TableSchema = TableSchema {
    name: TABLE_DOWNLOAD,
    columns: TRANSFER_COLUMNS_V3,
    unique_groups: &[],
};

pub const UPLOAD_TABLE: TableSchema = TableSchema {
    name: TABLE_UPLOAD,
    columns: TRANSFER_COLUMNS_V3,
    unique_groups: &[],
};

/// Current layout of every table, in creation order.
pub const TABLES: &[TableSchema] = &[CACHE_TABLE, COOKIE_TABLE, DOWNLOAD_TABLE, UPLOAD_TABLE];

/// Transfer table layout as installed by an older version.
pub fn transfer_table_at(name: &'static str, version: i64) -> TableSchema {
    let columns = match version {
        1 => TRANSFER_COLUMNS_V1,
        2 => TRANSFER_COLUMNS_V2,
        _ => TRANSFER_COLUMNS_V3,
    };
    TableSchema {
        name,
        columns,
        unique_groups: &[],
    }
}

/// One schema change statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlOp {
    CreateTable(TableSchema),
    AddColumn { table: &'static str, column: Column },
    DropTable(&'static str),
}

impl DdlOp {
    pub fn to_sql(&self) -> String {
        match self {
            DdlOp::CreateTable(table) => table.create_sql(),
            // SQLite adds one column per statement.
            DdlOp::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table,
                column.name,
                column.kind.sql()
            ),
            DdlOp::DropTable(name) => format!("DROP TABLE IF EXISTS {}", name),
        }
    }
}

/// Live column names per existing table.
pub type LiveShapes = HashMap<String, BTreeSet<String>>;

fn is_transfer_table(name: &str) -> bool {
    name == TABLE_DOWNLOAD || name == TABLE_UPLOAD
}

/// Columns of `table` missing from `live`, in layout order.
fn add_missing_columns(ops: &mut Vec<DdlOp>, table: &TableSchema, live: &BTreeSet<String>) {
    for column in table.columns {
        if !live.contains(column.name) {
            ops.push(DdlOp::AddColumn {
                table: table.name,
                column: *column,
            });
        }
    }
}

/// Computes the statements that bring a database at `old` to `new`.
///
/// Pure: `live` describes the tables currently present.
pub fn plan_migration(old: i64, new: i64, live: &LiveShapes) -> Vec<DdlOp> {
    let mut ops = Vec::new();

    if old == new {
        for table in TABLES {
            if !live.contains_key(table.name) {
                ops.push(DdlOp::CreateTable(*table));
            }
        }
        return ops;
    }

    if old == 0 && live.is_empty() {
        ops.extend(TABLES.iter().map(|t| DdlOp::CreateTable(*t)));
        return ops;
    }

    // Known upgrades extend transfer tables still laid out as `old`; any
    // other live table that differs from its layout is rebuilt.
    let additive = matches!((old, new), (1, 3) | (2, 3));
    for table in TABLES {
        let Some(columns) = live.get(table.name) else {
            continue;
        };
        if additive
            && is_transfer_table(table.name)
            && *columns == transfer_table_at(table.name, old).column_names()
        {
            add_missing_columns(&mut ops, table, columns);
        } else if table.needs_rebuild(columns) {
            ops.push(DdlOp::DropTable(table.name));
        }
    }

    // Tables that were dropped, or never existed, are (re)created. Existing
    // tables are left alone since the create statement is IF NOT EXISTS.
    for table in TABLES {
        let dropped = ops
            .iter()
            .any(|op| matches!(op, DdlOp::DropTable(name) if *name == table.name));
        if dropped || !live.contains_key(table.name) {
            ops.push(DdlOp::CreateTable(*table));
        }
    }

    ops
}

/// Opens and migrates the engine database.
pub struct SchemaStore {
    pool: SqlitePool,
}

impl SchemaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Brings the database to [`SCHEMA_VERSION`].
    pub async fn open(pool: &SqlitePool) -> Result<Vec<DdlOp>, TransferError> {
        Self::new(pool.clone()).migrate_to(SCHEMA_VERSION).await
    }

    pub async fn version(&self) -> Result<i64, TransferError> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    pub async fn live_shapes(&self) -> Result<LiveShapes, TransferError> {
        let mut shapes = LiveShapes::new();
        for table in TABLES {
            let rows = sqlx::query(&format!("PRAGMA table_info({})", table.name))
                .fetch_all(&self.pool)
                .await?;
            if rows.is_empty() {
                continue;
            }
            let columns = rows
                .iter()
                .map(|row| row.try_get::<String, _>("name"))
                .collect::<Result<BTreeSet<_>, _>>()?;
            shapes.insert(table.name.to_string(), columns);
        }
        Ok(shapes)
    }

    /// Applies the plan from the installed version to `target` in one transaction.
    pub async fn migrate_to(&self, target: i64) -> Result<Vec<DdlOp>, TransferError> {
        let installed = self.version().await?;
        let live = self.live_shapes().await?;
        let ops = plan_migration(installed, target, &live);

        if installed != target {
            info!(
                "[Schema] Migrating database from version {} to {} ({} statements)",
                installed,
                target,
                ops.len()
            );
        }

        let mut tx = self.pool.begin().await?;
        for op in &ops {
            if let DdlOp::DropTable(name) = op {
                warn!("[Schema] Table {} does not match its layout, dropping its rows", name);
            }
            let sql = op.to_sql();
            debug!("[Schema] {}", sql);
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {}", target))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ops)
    }
}

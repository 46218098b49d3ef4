//! Shadow relation initialization and maintenance (spec §4.5): `init`,
//! `cleanup`, `begin_alter`/`commit_alter`, and backfill.
//!
//! Grounded on the teacher's `introspect.rs` for the SPI introspection
//! style (pg_attribute/pg_constraint queries formatted with `format!`) and
//! on its savepoint-per-operation discipline described in spec §5.

use std::cell::RefCell;
use std::collections::HashMap;

use pgrx::prelude::*;

use crate::clock;
use crate::codec::pk;
use crate::error::{CloudSyncError, Result};
use crate::rowcodec;
use crate::schema_hash;
use crate::settings;
use crate::statements;
use crate::triggers;
use crate::types::Algo;
use crate::util::{esc, ql, qi};

pub const MAX_PK_COLS: usize = 128;

/// Everything the rest of the engine needs to know about one augmented
/// table — the in-memory half of the "table inventory" spec §4.9
/// describes as owning prepared statements by handle.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub algo: Algo,
    pub pk_cols: Vec<String>,
    pub non_pk_cols: Vec<String>,
}

impl TableDescriptor {
    pub fn shadow_name(&self) -> String {
        format!("{}_meta", self.name)
    }
}

thread_local! {
    /// Snapshot of PK columns taken at `begin_alter`, consulted by
    /// `commit_alter` to detect a PK-changing ALTER (spec §4.5).
    static ALTER_SNAPSHOTS: RefCell<HashMap<String, Vec<String>>> = RefCell::new(HashMap::new());
}

/// §4.5 step 1: existence, ≤128 composite PK columns, all PK columns NOT
/// NULL, all non-PK NOT NULL columns have a DEFAULT, reject single-column
/// INTEGER PK unless `force_int_pk`.
pub fn sanity_check(table: &str, force_int_pk: bool) -> Result<TableDescriptor> {
    let exists: bool = Spi::get_one_with_args(
        "SELECT EXISTS(SELECT 1 FROM pg_class WHERE relname = $1 AND relkind = 'r')",
        &[table.into()],
    )
    .map_err(|e| CloudSyncError::storage(e.to_string()))?
    .unwrap_or(false);
    if !exists {
        return Err(CloudSyncError::misuse(format!("no such table \"{table}\"")));
    }

    let pk_cols: Vec<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT COALESCE(array_agg(a.attname::text ORDER BY a.attnum), '{{}}') \
                     FROM pg_constraint c \
                     JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = ANY(c.conkey) \
                     WHERE c.conrelid = {}::regclass AND c.contype = 'p'",
                    ql(table)
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get::<Vec<String>>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?
    .unwrap_or_default();

    if pk_cols.is_empty() {
        return Err(CloudSyncError::misuse(format!(
            "table \"{table}\" has no primary key"
        )));
    }
    if pk_cols.len() > MAX_PK_COLS {
        return Err(CloudSyncError::misuse(format!(
            "table \"{table}\" has {} primary-key columns, exceeds the {} limit",
            pk_cols.len(),
            MAX_PK_COLS
        )));
    }

    if pk_cols.len() == 1 && !force_int_pk {
        let is_int: bool = Spi::connect(|client| {
            client
                .select(
                    &format!(
                        "SELECT format_type(atttypid, atttypmod) IN ('integer', 'bigint', 'smallint') \
                         FROM pg_attribute WHERE attrelid = {}::regclass AND attname = {}",
                        ql(table),
                        ql(&pk_cols[0])
                    ),
                    Some(1),
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .first()
                .get::<bool>(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))
        })?
        .unwrap_or(false);
        if is_int {
            return Err(CloudSyncError::misuse(format!(
                "table \"{table}\" has a single-column INTEGER primary key; pass force_int_pk \
                 to proceed anyway (integer PK reuse after delete can collide with tombstones)"
            )));
        }
    }

    let non_pk_cols: Vec<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT COALESCE(array_agg(attname::text ORDER BY attnum), '{{}}') \
                     FROM pg_attribute \
                     WHERE attrelid = {}::regclass AND attnum > 0 AND NOT attisdropped \
                     AND attname <> ALL({}::text[])",
                    ql(table),
                    pg_text_array(&pk_cols)
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get::<Vec<String>>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?
    .unwrap_or_default();

    let bad_col: Option<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT attname::text FROM pg_attribute \
                     WHERE attrelid = {}::regclass AND attname = ANY({}::text[]) \
                     AND attnotnull AND NOT atthasdef LIMIT 1",
                    ql(table),
                    pg_text_array(&non_pk_cols)
                ),
                Some(1),
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get::<String>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?;
    if let Some(col) = bad_col {
        return Err(CloudSyncError::misuse(format!(
            "column \"{col}\" on table \"{table}\" is NOT NULL without a DEFAULT"
        )));
    }

    Ok(TableDescriptor {
        name: table.to_string(),
        algo: Algo::Cls,
        pk_cols,
        non_pk_cols,
    })
}

fn pg_text_array(values: &[String]) -> String {
    if values.is_empty() {
        return "'{}'".to_string();
    }
    format!(
        "ARRAY[{}]",
        values.iter().map(|v| ql(v)).collect::<Vec<_>>().join(",")
    )
}

/// §4.5 step 2: create the shadow relation and its `db_version` index.
fn create_shadow_relation(desc: &TableDescriptor) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {shadow} (
                        pk bytea NOT NULL,
                        col_name text NOT NULL,
                        col_version bigint NOT NULL,
                        db_version bigint NOT NULL,
                        site_id bigint NOT NULL DEFAULT 0,
                        seq integer NOT NULL,
                        PRIMARY KEY (pk, col_name)
                    ) WITH (fillfactor = 90)",
                    shadow = qi(&desc.shadow_name())
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        client
            .update(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {idx} ON {shadow} (db_version)",
                    idx = qi(&format!("{}_dbv_idx", desc.shadow_name())),
                    shadow = qi(&desc.shadow_name())
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// Postgres storage category of each PK column, and the `SELECT` list
/// that casts them down to it — shared by `backfill` and
/// `prune_stale_pks` so both compute identical PK bytes.
fn pk_categories(desc: &TableDescriptor) -> Result<Vec<rowcodec::PgCategory>> {
    desc.pk_cols
        .iter()
        .map(|c| rowcodec::categorize(&desc.name, c))
        .collect()
}

fn pk_select_list(desc: &TableDescriptor, cats: &[rowcodec::PgCategory]) -> String {
    desc.pk_cols
        .iter()
        .zip(cats)
        .map(|(c, cat)| rowcodec::cast_expr(&qi(c), *cat))
        .collect::<Vec<_>>()
        .join(", ")
}

fn live_pk_bytes(desc: &TableDescriptor, cats: &[rowcodec::PgCategory]) -> Result<Vec<Vec<u8>>> {
    let select_list = pk_select_list(desc, cats);
    Spi::connect(|client| {
        let rows = client
            .select(
                &format!("SELECT {select_list} FROM {}", qi(&desc.name)),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let mut values = Vec::with_capacity(cats.len());
            for (i, cat) in cats.iter().enumerate() {
                values.push(rowcodec::value_at(&row, i + 1, *cat)?);
            }
            out.push(pk::encode_pk(&values)?);
        }
        Ok(out)
    })
}

/// §4.5 step 4: for every user row lacking shadow metadata, emit a
/// tombstone (odd `col_version = 1`) and one column entry per non-PK
/// column, all at the current `db_version`. PK bytes are computed in
/// Rust from typed column values (not a SQL-side text cast) so they
/// exactly match what capture triggers compute for the same row.
fn backfill(desc: &TableDescriptor) -> Result<()> {
    let db_version = clock::db_version_next(None);
    let cats = pk_categories(desc)?;
    let pks = live_pk_bytes(desc, &cats)?;

    Spi::connect_mut(|client| {
        for pk_bytes in &pks {
            client
                .update(
                    &format!(
                        "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                         VALUES ($1, '__TOMBSTONE__', 1, {dbv}, 0, 0)
                         ON CONFLICT (pk, col_name) DO NOTHING",
                        shadow = qi(&desc.shadow_name()),
                        dbv = db_version,
                    ),
                    None,
                    &[pk_bytes.clone().into()],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;

            for col in &desc.non_pk_cols {
                client
                    .update(
                        &format!(
                            "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                             VALUES ($1, {col_lit}, 1, {dbv}, 0, 0)
                             ON CONFLICT (pk, col_name) DO NOTHING",
                            shadow = qi(&desc.shadow_name()),
                            col_lit = ql(col),
                            dbv = db_version,
                        ),
                        None,
                        &[pk_bytes.clone().into()],
                    )
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            }
        }
        Ok(())
    })
}

/// Record the active set of augmented tables, used by the clock engine's
/// cached UNION query and by `payload_encode`/schema hashing.
pub fn list_augmented_tables() -> Result<Vec<String>> {
    Spi::connect(|client| {
        let rows = client
            .select(
                "SELECT DISTINCT tbl FROM cloudsync.table_settings WHERE key = 'algo' ORDER BY tbl",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let name: String = row
                .get(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .unwrap_or_default();
            out.push(name);
        }
        Ok(out)
    })
}

fn bump_schema_version_and_hash() -> Result<()> {
    let tables = list_augmented_tables()?;
    let hash = schema_hash::compute_schema_hash(&tables)?;
    schema_hash::register_schema_hash(hash)?;
    let current: i64 = settings::get_setting(settings::KEY_SCHEMA_VERSION)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let next = current + 1;
    settings::put_setting(settings::KEY_SCHEMA_VERSION, &next.to_string())?;
    clock::invalidate_union_query_cache(next);
    Ok(())
}

/// `init(table, algo?, force_int_pk?)` (spec §4.5): the full six-step
/// sequence, bracketed by a savepoint so any failure path rolls back
/// cleanly (spec §5).
pub fn init(table: &str, algo: Option<Algo>, force_int_pk: bool) -> Result<()> {
    settings::ensure_catalog_relations()?;
    let algo = algo.unwrap_or(Algo::Cls);

    with_savepoint("cloudsync_init", || {
        let mut desc = sanity_check(table, force_int_pk)?;
        desc.algo = algo;

        create_shadow_relation(&desc)?;
        triggers::install(&desc)?;
        statements::prepare_table(&desc);
        backfill(&desc)?;

        Spi::connect_mut(|client| {
            client
                .update(
                    &format!(
                        "INSERT INTO cloudsync.table_settings (tbl, col, key, value)
                         VALUES ({tbl}, NULL, 'algo', {algo})
                         ON CONFLICT (tbl, key) DO UPDATE SET value = EXCLUDED.value",
                        tbl = ql(table),
                        algo = ql(desc.algo.as_str()),
                    ),
                    None,
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            client
                .update(
                    &format!(
                        "INSERT INTO cloudsync.table_settings (tbl, col, key, value)
                         VALUES ({tbl}, NULL, 'enabled', '1')
                         ON CONFLICT (tbl, key) DO NOTHING",
                        tbl = ql(table),
                    ),
                    None,
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            Ok(())
        })?;

        bump_schema_version_and_hash()?;
        tracing::info!(target: "crdt_sync::shadow", table, algo = desc.algo.as_str(), "init complete");
        Ok(())
    })
}

/// `cleanup(table | *)` (spec §4.5): drops the shadow relation, drops all
/// capture triggers, clears per-table settings.
pub fn cleanup(table_or_star: &str) -> Result<()> {
    let targets = if table_or_star == "*" {
        list_augmented_tables()?
    } else {
        vec![table_or_star.to_string()]
    };

    with_savepoint("cloudsync_cleanup", || {
        for table in &targets {
            triggers::drop_all(table)?;
            Spi::connect_mut(|client| {
                client
                    .update(
                        &format!("DROP TABLE IF EXISTS {}", qi(&format!("{table}_meta"))),
                        None,
                        &[],
                    )
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?;
                client
                    .update(
                        &format!(
                            "DELETE FROM cloudsync.table_settings WHERE tbl = {}",
                            ql(table)
                        ),
                        None,
                        &[],
                    )
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?;
                Ok(())
            })?;
            statements::drop_table(table);
            tracing::info!(target: "crdt_sync::shadow", table, "cleanup complete");
        }
        bump_schema_version_and_hash()?;
        Ok(())
    })
}

/// `begin_alter(table)` (spec §4.5): savepoint, snapshot PK columns, drop
/// capture triggers so raw DDL may proceed.
pub fn begin_alter(table: &str) -> Result<()> {
    let desc = describe(table)?;
    Spi::connect_mut(|client| {
        client
            .update(&format!("SAVEPOINT {}", qi(&alter_savepoint_name(table))), None, &[])
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;
    ALTER_SNAPSHOTS.with(|s| {
        s.borrow_mut().insert(table.to_string(), desc.pk_cols.clone());
    });
    triggers::drop_all(table)?;
    tracing::info!(target: "crdt_sync::shadow", table, "begin_alter");
    Ok(())
}

/// `commit_alter(table)` (spec §4.5): compare PK columns against the
/// snapshot; rebuild the shadow relation wholesale if the PK changed,
/// otherwise prune shadow rows for removed columns and for primary keys
/// that no longer correspond to any user row (tombstones preserved so
/// delete propagation still works). Records `pre_alter_dbversion`.
pub fn commit_alter(table: &str) -> Result<()> {
    let snapshot = ALTER_SNAPSHOTS
        .with(|s| s.borrow_mut().remove(table))
        .ok_or_else(|| {
            CloudSyncError::misuse(format!("commit_alter({table}) with no matching begin_alter"))
        })?;

    let mut desc = sanity_check(table, true)?;
    desc.algo = stored_algo(table)?;

    let pk_changed = desc.pk_cols != snapshot;

    if pk_changed {
        Spi::connect_mut(|client| {
            client
                .update(
                    &format!("DROP TABLE IF EXISTS {}", qi(&desc.shadow_name())),
                    None,
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            Ok(())
        })?;
        create_shadow_relation(&desc)?;
        backfill(&desc)?;
    } else {
        prune_removed_columns(&desc)?;
        prune_stale_pks(&desc)?;
        backfill(&desc)?;
    }

    triggers::install(&desc)?;
    statements::prepare_table(&desc);

    let pre_alter_dbv = clock::db_version_next(None);
    settings::put_setting(settings::KEY_PRE_ALTER_DBVERSION, &pre_alter_dbv.to_string())?;
    clock::observe_pre_alter_dbversion(pre_alter_dbv);

    Spi::connect_mut(|client| {
        client
            .update(&format!("RELEASE SAVEPOINT {}", qi(&alter_savepoint_name(table))), None, &[])
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    bump_schema_version_and_hash()?;
    tracing::info!(target: "crdt_sync::shadow", table, pk_changed, "commit_alter complete");
    Ok(())
}

fn prune_removed_columns(desc: &TableDescriptor) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "DELETE FROM {shadow} WHERE col_name <> '__TOMBSTONE__' AND col_name <> ALL({cols}::text[])",
                    shadow = qi(&desc.shadow_name()),
                    cols = pg_text_array(&desc.non_pk_cols),
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

fn prune_stale_pks(desc: &TableDescriptor) -> Result<()> {
    let cats = pk_categories(desc)?;
    let live = live_pk_bytes(desc, &cats)?;
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "DELETE FROM {shadow} WHERE col_name <> '__TOMBSTONE__' AND pk <> ALL($1::bytea[])",
                    shadow = qi(&desc.shadow_name()),
                ),
                None,
                &[live.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

pub fn stored_algo(table: &str) -> Result<Algo> {
    let raw: Option<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT value FROM cloudsync.table_settings WHERE tbl = {} AND key = 'algo'",
                    ql(table)
                ),
                Some(1),
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?;
    let raw = raw.ok_or_else(|| CloudSyncError::misuse(format!("table \"{table}\" is not augmented")))?;
    Algo::from_str(&raw).ok_or_else(|| CloudSyncError::storage(format!("corrupt algo setting {raw:?}")))
}

/// Look up a `TableDescriptor` for an already-augmented table, consulting
/// the statement inventory first (the hot path capture triggers take on
/// every row) and falling back to live catalog introspection otherwise.
pub fn describe(table: &str) -> Result<TableDescriptor> {
    if let Some(cached) = statements::lookup(table) {
        return Ok(cached);
    }
    let algo = stored_algo(table)?;
    let mut desc = sanity_check(table, true)?;
    desc.algo = algo;
    statements::prepare_table(&desc);
    Ok(desc)
}

pub fn is_augmented(table: &str) -> Result<bool> {
    Ok(stored_algo(table).is_ok())
}

fn set_enabled(table: &str, enabled: bool) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "UPDATE cloudsync.table_settings SET value = {val} WHERE tbl = {tbl} AND key = 'enabled'",
                    val = ql(if enabled { "1" } else { "0" }),
                    tbl = ql(table),
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// `enable(table | *)` / `disable(table | *)` (spec §6): toggle whether an
/// already-augmented table's capture triggers emit shadow metadata,
/// without tearing down the shadow relation or triggers themselves.
pub fn enable(table_or_star: &str) -> Result<()> {
    for table in targets(table_or_star)? {
        set_enabled(&table, true)?;
    }
    Ok(())
}

pub fn disable(table_or_star: &str) -> Result<()> {
    for table in targets(table_or_star)? {
        set_enabled(&table, false)?;
    }
    Ok(())
}

fn targets(table_or_star: &str) -> Result<Vec<String>> {
    if table_or_star == "*" {
        list_augmented_tables()
    } else {
        Ok(vec![table_or_star.to_string()])
    }
}

/// `is_enabled(table)` (spec §6): whether capture is currently active for
/// an augmented table. Defaults to enabled when the key is absent — older
/// rows backfilled before `enabled` existed still capture.
pub fn is_enabled(table: &str) -> Result<bool> {
    let raw: Option<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT value FROM cloudsync.table_settings WHERE tbl = {} AND key = 'enabled'",
                    ql(table)
                ),
                Some(1),
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?;
    Ok(raw.as_deref() != Some("0"))
}

fn alter_savepoint_name(table: &str) -> String {
    format!("cloudsync_alter_{}", esc(table).replace(' ', "_"))
}

/// Run `body` inside a named savepoint, rolling back (and propagating the
/// error) on any failure, releasing on success — the bracketing discipline
/// spec §5 requires for `init`/`cleanup`/`begin_alter`/`commit_alter`/`logout`.
pub fn with_savepoint<T>(name: &str, body: impl FnOnce() -> Result<T>) -> Result<T> {
    Spi::connect_mut(|client| {
        client
            .update(&format!("SAVEPOINT {}", qi(name)), None, &[])
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    match body() {
        Ok(value) => {
            Spi::connect_mut(|client| {
                client
                    .update(&format!("RELEASE SAVEPOINT {}", qi(name)), None, &[])
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?;
                Ok(())
            })?;
            Ok(value)
        }
        Err(err) => {
            let _ = Spi::connect_mut(|client| {
                client.update(
                    &format!("ROLLBACK TO SAVEPOINT {}", qi(name)),
                    None,
                    &[],
                )
            });
            let _ = Spi::connect_mut(|client| client.update(&format!("RELEASE SAVEPOINT {}", qi(name)), None, &[]));
            Err(err)
        }
    }
}

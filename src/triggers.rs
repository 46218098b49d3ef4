//! Capture triggers and local change emission (spec §4.3).
//!
//! One shared trigger function per event handles every augmented table —
//! `TG_TABLE_NAME` tells it which shadow relation to write to, the same
//! "one generic function, many bindings" shape the teacher uses for its
//! statement cache keyed by table name in `executor_cache.rs`. Grow-Only
//! Set tables additionally get `BEFORE UPDATE`/`BEFORE DELETE` triggers
//! that abort the statement outright (spec §3 "GOS").

use std::cell::Cell;

use pgrx::prelude::*;
use pgrx::trigger_support::{PgTrigger, PgTriggerError};

use crate::clock;
use crate::codec::pk;
use crate::error::{self, CloudSyncError, Result};
use crate::rowcodec;
use crate::shadow::{self, TableDescriptor};
use crate::util::qi;

thread_local! {
    /// Set while the merge engine is writing a remote change into a user
    /// table, so the capture triggers it fires don't re-emit it as a new
    /// local change (spec §4.4: merge-applied writes are not "local").
    static SUPPRESS_CAPTURE: Cell<bool> = Cell::new(false);
}

pub fn is_capture_suppressed() -> bool {
    SUPPRESS_CAPTURE.with(|c| c.get())
}

/// Run `body` with capture suppressed, restoring the previous value
/// afterward even on panic/early-return via `Err`.
pub fn with_capture_suppressed<T>(body: impl FnOnce() -> Result<T>) -> Result<T> {
    let previous = SUPPRESS_CAPTURE.with(|c| c.replace(true));
    let result = body();
    SUPPRESS_CAPTURE.with(|c| c.set(previous));
    result
}

const TRIGGER_NAMES: &[(&str, &str)] = &[
    ("cloudsync_ai", "cloudsync_capture_after_insert"),
    ("cloudsync_au", "cloudsync_capture_after_update"),
    ("cloudsync_ad", "cloudsync_capture_after_delete"),
];

const GOS_TRIGGER_NAMES: &[(&str, &str)] = &[
    ("cloudsync_bu_gos", "cloudsync_reject_update"),
    ("cloudsync_bd_gos", "cloudsync_reject_delete"),
];

/// Install the AFTER capture triggers for `desc`, plus the BEFORE abort
/// triggers when its algorithm is Grow-Only Set (spec §4.3/§4.5).
pub fn install(desc: &TableDescriptor) -> Result<()> {
    drop_all(&desc.name)?;

    Spi::connect_mut(|client| {
        for (trigger_name, func) in TRIGGER_NAMES {
            let event = match *trigger_name {
                "cloudsync_ai" => "INSERT",
                "cloudsync_au" => "UPDATE",
                "cloudsync_ad" => "DELETE",
                _ => unreachable!(),
            };
            client
                .update(
                    &format!(
                        "CREATE TRIGGER {trig} AFTER {event} ON {table} \
                         FOR EACH ROW EXECUTE FUNCTION {func}()",
                        trig = qi(trigger_name),
                        table = qi(&desc.name),
                        func = func,
                    ),
                    None,
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        }

        if desc.algo.is_grow_only() {
            for (trigger_name, func) in GOS_TRIGGER_NAMES {
                let event = if trigger_name.contains("bu") { "UPDATE" } else { "DELETE" };
                client
                    .update(
                        &format!(
                            "CREATE TRIGGER {trig} BEFORE {event} ON {table} \
                             FOR EACH ROW EXECUTE FUNCTION {func}()",
                            trig = qi(trigger_name),
                            table = qi(&desc.name),
                            func = func,
                        ),
                        None,
                        &[],
                    )
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            }
        }
        Ok(())
    })
}

/// Drop every `cloudsync_*` trigger this module may have installed on
/// `table`, tolerating triggers that were never created.
pub fn drop_all(table: &str) -> Result<()> {
    Spi::connect_mut(|client| {
        for (trigger_name, _) in TRIGGER_NAMES.iter().chain(GOS_TRIGGER_NAMES.iter()) {
            client
                .update(
                    &format!(
                        "DROP TRIGGER IF EXISTS {trig} ON {table}",
                        trig = qi(trigger_name),
                        table = qi(table),
                    ),
                    None,
                    &[],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        }
        Ok(())
    })
}

fn encode_pk_from_tuple(
    desc: &TableDescriptor,
    tuple: &PgHeapTuple<'_, impl pgrx::WhoAllocated>,
) -> Result<Vec<u8>> {
    let mut values = Vec::with_capacity(desc.pk_cols.len());
    for col in &desc.pk_cols {
        let cat = rowcodec::categorize(&desc.name, col)?;
        values.push(rowcodec::value_from_tuple(tuple, col, cat)?);
    }
    pk::encode_pk(&values)
}

/// INSERT capture (spec §4.3): write (or resurrect) the tombstone and one
/// fresh column entry per non-PK column, all at `col_version = 1` unless
/// resurrecting, in which case the tombstone's causal length advances by
/// one to flip it from even (dead) back to odd (alive) — the same
/// single-step increment the delete path uses, just in the other
/// direction (spec §3: "an increment from N to N+1 resurrects").
fn emit_insert(desc: &TableDescriptor, new: &PgHeapTuple<'_, impl pgrx::WhoAllocated>) -> Result<()> {
    let pk_bytes = encode_pk_from_tuple(desc, new)?;
    let db_version = clock::db_version_next(None);
    let shadow = qi(&desc.shadow_name());

    Spi::connect_mut(|client| {
        let seq = clock::bump_seq();
        client
            .update(
                &format!(
                    "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                     VALUES ($1, '__TOMBSTONE__', 1, {dbv}, 0, {seq})
                     ON CONFLICT (pk, col_name) DO UPDATE SET
                        col_version = {shadow}.col_version + 1,
                        db_version = EXCLUDED.db_version,
                        site_id = 0,
                        seq = EXCLUDED.seq
                     WHERE {shadow}.col_version % 2 = 0",
                    dbv = db_version,
                ),
                None,
                &[pk_bytes.clone().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;

        for col in &desc.non_pk_cols {
            let seq = clock::bump_seq();
            client
                .update(
                    &format!(
                        "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                         VALUES ($1, {col_lit}, 1, {dbv}, 0, {seq})
                         ON CONFLICT (pk, col_name) DO UPDATE SET
                            col_version = {shadow}.col_version + 1,
                            db_version = EXCLUDED.db_version,
                            site_id = 0,
                            seq = EXCLUDED.seq",
                        col_lit = crate::util::ql(col),
                        dbv = db_version,
                    ),
                    None,
                    &[pk_bytes.clone().into()],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        }
        Ok(())
    })
}

/// UPDATE capture (spec §4.3). If any PK column changed, performs a PK
/// move first: the OLD row's tombstone is deleted, every non-sentinel
/// metadata row is relocated to the NEW pk under a fresh `(db_version,
/// seq)` per moved entry (required to preserve invariant 1 — reusing the
/// source row's seq across a move is exactly what spec §9 warns against),
/// and a fresh sentinel is written for the NEW pk. Column bumps (for both
/// moved and unmoved rows) only fire for non-PK columns whose value
/// actually changed.
fn emit_update(
    desc: &TableDescriptor,
    old: &PgHeapTuple<'_, impl pgrx::WhoAllocated>,
    new: &PgHeapTuple<'_, impl pgrx::WhoAllocated>,
) -> Result<()> {
    let old_pk = encode_pk_from_tuple(desc, old)?;
    let new_pk = encode_pk_from_tuple(desc, new)?;
    let shadow = qi(&desc.shadow_name());

    if old_pk != new_pk {
        perform_pk_move(desc, &old_pk, &new_pk)?;
    }

    let db_version = clock::db_version_next(None);
    Spi::connect_mut(|client| {
        for col in &desc.non_pk_cols {
            let cat = rowcodec::categorize(&desc.name, col)?;
            let old_value = rowcodec::value_from_tuple(old, col, cat)?;
            let new_value = rowcodec::value_from_tuple(new, col, cat)?;
            if old_value == new_value {
                continue;
            }
            let seq = clock::bump_seq();
            client
                .update(
                    &format!(
                        "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                         VALUES ($1, {col_lit}, 1, {dbv}, 0, {seq})
                         ON CONFLICT (pk, col_name) DO UPDATE SET
                            col_version = {shadow}.col_version + 1,
                            db_version = EXCLUDED.db_version,
                            site_id = 0,
                            seq = EXCLUDED.seq",
                        col_lit = crate::util::ql(col),
                        dbv = db_version,
                    ),
                    None,
                    &[new_pk.clone().into()],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        }
        Ok(())
    })
}

fn perform_pk_move(desc: &TableDescriptor, old_pk: &[u8], new_pk: &[u8]) -> Result<()> {
    let shadow = qi(&desc.shadow_name());

    let db_version = clock::db_version_next(None);
    let del_seq = clock::bump_seq();
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "UPDATE {shadow} SET col_version = col_version + 1, db_version = {dbv}, \
                     site_id = 0, seq = {seq} WHERE pk = $1 AND col_name = '__TOMBSTONE__'",
                    dbv = db_version,
                    seq = del_seq,
                ),
                None,
                &[old_pk.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    let moved_cols: Vec<String> = Spi::connect(|client| {
        let rows = client
            .select(
                &format!("SELECT col_name FROM {shadow} WHERE pk = $1 AND col_name <> '__TOMBSTONE__'"),
                None,
                &[old_pk.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let mut cols = Vec::new();
        for row in rows {
            cols.push(
                row.get::<String>(1)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or_default(),
            );
        }
        Ok(cols)
    })?;

    Spi::connect_mut(|client| {
        for col in &moved_cols {
            let db_version = clock::db_version_next(None);
            let seq = clock::bump_seq();
            client
                .update(
                    &format!(
                        "UPDATE {shadow} SET pk = $1, db_version = {dbv}, site_id = 0, seq = {seq} \
                         WHERE pk = $2 AND col_name = $3",
                        dbv = db_version,
                    ),
                    None,
                    &[new_pk.to_vec().into(), old_pk.to_vec().into(), col.clone().into()],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        }
        Ok(())
    })?;

    let db_version = clock::db_version_next(None);
    let seq = clock::bump_seq();
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                     VALUES ($1, '__TOMBSTONE__', 1, {dbv}, 0, {seq})
                     ON CONFLICT (pk, col_name) DO UPDATE SET
                        col_version = {shadow}.col_version + 1,
                        db_version = EXCLUDED.db_version,
                        site_id = 0,
                        seq = EXCLUDED.seq
                     WHERE {shadow}.col_version % 2 = 0",
                    dbv = db_version,
                ),
                None,
                &[new_pk.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// DELETE capture (spec §4.3): advance the tombstone's causal length by
/// one, making it even (dead), and drop all non-sentinel metadata for the
/// pk — nothing is left to merge-compare once the row no longer exists.
fn emit_delete(desc: &TableDescriptor, old: &PgHeapTuple<'_, impl pgrx::WhoAllocated>) -> Result<()> {
    let pk_bytes = encode_pk_from_tuple(desc, old)?;
    let db_version = clock::db_version_next(None);
    let seq = clock::bump_seq();
    let shadow = qi(&desc.shadow_name());

    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "UPDATE {shadow} SET col_version = col_version + 1, db_version = {dbv}, \
                     site_id = 0, seq = {seq} WHERE pk = $1 AND col_name = '__TOMBSTONE__'",
                    dbv = db_version,
                ),
                None,
                &[pk_bytes.clone().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        client
            .update(
                &format!(
                    "DELETE FROM {shadow} WHERE pk = $1 AND col_name <> '__TOMBSTONE__'"
                ),
                None,
                &[pk_bytes.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

fn table_descriptor_for_trigger(trigger: &PgTrigger<'_>) -> Result<TableDescriptor> {
    let table_name = trigger
        .table_name()
        .map_err(|e| CloudSyncError::storage(e.to_string()))?;
    shadow::describe(&table_name)
}

/// `disable(table)` (spec §6) leaves triggers installed but mutes capture —
/// checked on every row so toggling is instant without a DDL round trip.
fn capture_enabled(desc: &TableDescriptor) -> Result<bool> {
    shadow::is_enabled(&desc.name)
}

#[pg_trigger]
fn cloudsync_capture_after_insert<'a>(
    trigger: &'a PgTrigger<'a>,
) -> std::result::Result<Option<PgHeapTuple<'a, impl pgrx::WhoAllocated>>, PgTriggerError> {
    if is_capture_suppressed() {
        return Ok(trigger.new());
    }
    let desc = match table_descriptor_for_trigger(trigger) {
        Ok(d) => d,
        Err(e) => error::raise(e),
    };
    let new = trigger.new().ok_or(PgTriggerError::NullTrigger)?;
    match capture_enabled(&desc) {
        Ok(true) => {
            if let Err(e) = emit_insert(&desc, &new) {
                error::raise(e);
            }
        }
        Ok(false) => {}
        Err(e) => error::raise(e),
    }
    Ok(Some(new))
}

#[pg_trigger]
fn cloudsync_capture_after_update<'a>(
    trigger: &'a PgTrigger<'a>,
) -> std::result::Result<Option<PgHeapTuple<'a, impl pgrx::WhoAllocated>>, PgTriggerError> {
    if is_capture_suppressed() {
        return Ok(trigger.new());
    }
    let desc = match table_descriptor_for_trigger(trigger) {
        Ok(d) => d,
        Err(e) => error::raise(e),
    };
    let old = trigger.old().ok_or(PgTriggerError::NullTrigger)?;
    let new = trigger.new().ok_or(PgTriggerError::NullTrigger)?;
    match capture_enabled(&desc) {
        Ok(true) => {
            if let Err(e) = emit_update(&desc, &old, &new) {
                error::raise(e);
            }
        }
        Ok(false) => {}
        Err(e) => error::raise(e),
    }
    Ok(Some(new))
}

#[pg_trigger]
fn cloudsync_capture_after_delete<'a>(
    trigger: &'a PgTrigger<'a>,
) -> std::result::Result<Option<PgHeapTuple<'a, impl pgrx::WhoAllocated>>, PgTriggerError> {
    if is_capture_suppressed() {
        return Ok(trigger.old());
    }
    let desc = match table_descriptor_for_trigger(trigger) {
        Ok(d) => d,
        Err(e) => error::raise(e),
    };
    let old = trigger.old().ok_or(PgTriggerError::NullTrigger)?;
    match capture_enabled(&desc) {
        Ok(true) => {
            if let Err(e) = emit_delete(&desc, &old) {
                error::raise(e);
            }
        }
        Ok(false) => {}
        Err(e) => error::raise(e),
    }
    Ok(Some(old))
}

/// Grow-Only Set tables reject UPDATE/DELETE outright (spec §3), except
/// when the merge engine itself is the one issuing the statement (GOS
/// still needs to accept remote inserts that happen to collide, and
/// `begin_alter`/`commit_alter` rewrites need to pass through).
#[pg_trigger]
fn cloudsync_reject_update<'a>(
    trigger: &'a PgTrigger<'a>,
) -> std::result::Result<Option<PgHeapTuple<'a, impl pgrx::WhoAllocated>>, PgTriggerError> {
    if is_capture_suppressed() {
        return Ok(trigger.new());
    }
    error::raise(CloudSyncError::misuse(
        "UPDATE is rejected on a Grow-Only Set table",
    ))
}

#[pg_trigger]
fn cloudsync_reject_delete<'a>(
    trigger: &'a PgTrigger<'a>,
) -> std::result::Result<Option<PgHeapTuple<'a, impl pgrx::WhoAllocated>>, PgTriggerError> {
    if is_capture_suppressed() {
        return Ok(trigger.old());
    }
    error::raise(CloudSyncError::misuse(
        "DELETE is rejected on a Grow-Only Set table",
    ))
}

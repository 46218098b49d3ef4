//! Merge engine (spec §4.4): `merge_insert(row)` decides winners between
//! concurrent edits arriving from the payload decoder and applies them to
//! the real user table, with capture suppressed so the merge itself never
//! re-enters the capture triggers (spec §3 invariant 3).

use pgrx::prelude::*;

use crate::clock;
use crate::codec::pk;
use crate::error::{CloudSyncError, Result};
use crate::rowcodec::{self, PgCategory};
use crate::settings;
use crate::shadow::{self, TableDescriptor};
use crate::triggers;
use crate::types::{Algo, ChangeRow, Value, TOMBSTONE};
use crate::util::qi;

/// Entry point: dispatch on the table's configured algorithm (spec §9
/// "Polymorphism over merge algorithm").
pub fn merge_insert(row: &ChangeRow) -> Result<()> {
    let desc = shadow::describe(&row.tbl)?;
    match desc.algo {
        Algo::Gos => merge_gos(&desc, row),
        // DWS/AWS invert the add/delete tiebreak on a causal-length tie,
        // but a single causal-length integer can't actually tie between
        // a genuine concurrent add and delete (the parity of the number
        // already encodes which one happened) — the spec itself only
        // specifies CLS and GOS in full and calls DWS/AWS "structurally
        // identical to CLS" (§3, §9 Open Questions), so all three share
        // this implementation.
        Algo::Cls | Algo::Dws | Algo::Aws => merge_cls(&desc, row),
    }
}

fn merge_gos(desc: &TableDescriptor, row: &ChangeRow) -> Result<()> {
    physical_upsert_sentinel(desc, &row.pk)?;
    if row.is_tombstone() {
        record_winner_clock(desc, &row.pk, TOMBSTONE, row)?;
        return Ok(());
    }
    let col_name = row.col_name.as_deref().unwrap();
    physical_upsert_column(desc, &row.pk, col_name, &row.col_value)?;
    record_winner_clock(desc, &row.pk, col_name, row)?;
    Ok(())
}

/// CLS (spec §4.4 steps 1-5). DWS/AWS alias to this.
fn merge_cls(desc: &TableDescriptor, row: &ChangeRow) -> Result<()> {
    let local = local_cl(desc, &row.pk)?;
    let incoming = row.causal_length;

    // Step 2: stale change, drop silently.
    if incoming < local {
        return Ok(());
    }

    // Step 3: incoming delete.
    if incoming % 2 == 0 {
        if local == incoming {
            return Ok(());
        }
        physical_delete_row(desc, &row.pk)?;
        record_winner_clock(desc, &row.pk, TOMBSTONE, row)?;
        drop_non_sentinel_metadata(desc, &row.pk)?;
        return Ok(());
    }

    // Step 4: sentinel-only insert or resurrection.
    if row.is_tombstone() {
        if local == incoming {
            return Ok(());
        }
        physical_upsert_sentinel(desc, &row.pk)?;
        zero_non_tombstone_versions(desc, &row.pk)?;
        record_winner_clock(desc, &row.pk, TOMBSTONE, row)?;
        return Ok(());
    }

    // Step 5: column update, possibly combined with resurrection.
    let col_name = row.col_name.as_deref().unwrap();
    if incoming > local && incoming % 2 == 1 {
        let row_exists_locally = local % 2 == 1;
        if row_exists_locally || incoming > 1 {
            physical_upsert_sentinel(desc, &row.pk)?;
            zero_non_tombstone_versions(desc, &row.pk)?;
            record_winner_clock(desc, &row.pk, TOMBSTONE, row)?;
        }
    }

    if did_column_win(desc, &row.pk, col_name, row)? {
        physical_upsert_column(desc, &row.pk, col_name, &row.col_value)?;
        record_winner_clock(desc, &row.pk, col_name, row)?;
    }
    Ok(())
}

fn did_column_win(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
    col_name: &str,
    incoming: &ChangeRow,
) -> Result<bool> {
    let Some((local_version, local_site_idx)) = get_local_entry(desc, pk_bytes, col_name)? else {
        return Ok(true);
    };
    if incoming.col_version > local_version {
        return Ok(true);
    }
    if incoming.col_version < local_version {
        return Ok(false);
    }
    let local_value = column_value_in_user_table(desc, pk_bytes, col_name)?.unwrap_or(Value::Null);
    match incoming.col_value.cmp(&local_value) {
        std::cmp::Ordering::Greater => Ok(true),
        std::cmp::Ordering::Less => Ok(false),
        std::cmp::Ordering::Equal => {
            if !settings::merge_equal_values_enabled()? {
                return Ok(false);
            }
            let local_site = settings::index_to_site_id(local_site_idx)?;
            Ok(incoming.site_id > local_site)
        }
    }
}

fn local_cl(desc: &TableDescriptor, pk_bytes: &[u8]) -> Result<i64> {
    let found: Option<i64> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT col_version FROM {} WHERE pk = $1 AND col_name = '__TOMBSTONE__'",
                    qi(&desc.shadow_name())
                ),
                Some(1),
                &[pk_bytes.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?;
    Ok(found.unwrap_or(0))
}

fn get_local_entry(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
    col_name: &str,
) -> Result<Option<(i64, i64)>> {
    Spi::connect(|client| {
        let table = client
            .select(
                &format!(
                    "SELECT col_version, site_id FROM {} WHERE pk = $1 AND col_name = $2",
                    qi(&desc.shadow_name())
                ),
                Some(1),
                &[pk_bytes.to_vec().into(), col_name.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let version: Option<i64> = table
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let Some(version) = version else {
            return Ok(None);
        };
        let site: i64 = table
            .first()
            .get(2)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .unwrap_or(0);
        Ok(Some((version, site)))
    })
}

pub(crate) fn column_value_in_user_table(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
    col_name: &str,
) -> Result<Option<Value>> {
    let cat = rowcodec::categorize(&desc.name, col_name)?;
    let (where_clause, args) = pk_where_and_args(desc, pk_bytes)?;
    let select_expr = rowcodec::cast_expr(&qi(col_name), cat);

    Spi::connect(|client| {
        let table = client
            .select(
                &format!("SELECT {select_expr} FROM {} WHERE {where_clause}", qi(&desc.name)),
                Some(1),
                &args,
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let row = table.first();
        Ok(match cat {
            PgCategory::Int => row
                .get::<i64>(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .map(Value::Integer),
            PgCategory::Float => row
                .get::<f64>(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .map(Value::Float),
            PgCategory::Text => row
                .get::<String>(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .map(Value::Text),
            PgCategory::Blob => row
                .get::<Vec<u8>>(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .map(Value::Blob),
        })
    })
}

fn pk_where_and_args(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
) -> Result<(String, Vec<(pgrx::PgOid, Option<pgrx::datum::Datum<'static>>)>)> {
    let args = pk::decode_bind_into_statement(pk_bytes)?;
    if args.len() != desc.pk_cols.len() {
        return Err(CloudSyncError::storage(
            "primary key column count mismatch during merge",
        ));
    }
    let clause = desc
        .pk_cols
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ${}", qi(col), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    Ok((clause, args))
}

fn value_to_arg(value: &Value) -> (pgrx::PgOid, Option<pgrx::datum::Datum<'static>>) {
    use pgrx::pg_sys::BuiltinOid;
    use pgrx::IntoDatum;
    match value {
        Value::Null => (pgrx::PgOid::BuiltIn(BuiltinOid::TEXTOID), None),
        Value::Integer(i) => (pgrx::PgOid::BuiltIn(BuiltinOid::INT8OID), i.into_datum()),
        Value::Float(f) => (pgrx::PgOid::BuiltIn(BuiltinOid::FLOAT8OID), f.into_datum()),
        Value::Text(s) => (pgrx::PgOid::BuiltIn(BuiltinOid::TEXTOID), s.clone().into_datum()),
        Value::Blob(b) => (pgrx::PgOid::BuiltIn(BuiltinOid::BYTEAOID), b.clone().into_datum()),
    }
}

fn physical_delete_row(desc: &TableDescriptor, pk_bytes: &[u8]) -> Result<()> {
    let (where_clause, args) = pk_where_and_args(desc, pk_bytes)?;
    triggers::with_capture_suppressed(|| {
        Spi::connect_mut(|client| {
            client
                .update(
                    &format!("DELETE FROM {} WHERE {where_clause}", qi(&desc.name)),
                    None,
                    &args,
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            Ok(())
        })
    })
}

/// Insert a PK-only row if absent, relying on the column DEFAULTs
/// `sanity_check` requires of every other NOT NULL column (spec §4.5).
fn physical_upsert_sentinel(desc: &TableDescriptor, pk_bytes: &[u8]) -> Result<()> {
    let (_, args) = pk_where_and_args(desc, pk_bytes)?;
    let col_list = desc.pk_cols.iter().map(|c| qi(c)).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=desc.pk_cols.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");

    triggers::with_capture_suppressed(|| {
        Spi::connect_mut(|client| {
            client
                .update(
                    &format!(
                        "INSERT INTO {table} ({col_list}) VALUES ({placeholders}) \
                         ON CONFLICT ({col_list}) DO NOTHING",
                        table = qi(&desc.name),
                    ),
                    None,
                    &args,
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            Ok(())
        })
    })
}

fn physical_upsert_column(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
    col_name: &str,
    value: &Value,
) -> Result<()> {
    let (where_clause, mut args) = pk_where_and_args(desc, pk_bytes)?;
    let value_placeholder = args.len() + 1;
    args.push(value_to_arg(value));

    triggers::with_capture_suppressed(|| {
        Spi::connect_mut(|client| {
            client
                .update(
                    &format!(
                        "UPDATE {table} SET {col} = ${value_placeholder} WHERE {where_clause}",
                        table = qi(&desc.name),
                        col = qi(col_name),
                    ),
                    None,
                    &args,
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?;
            Ok(())
        })
    })
}

fn drop_non_sentinel_metadata(desc: &TableDescriptor, pk_bytes: &[u8]) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "DELETE FROM {} WHERE pk = $1 AND col_name <> '__TOMBSTONE__'",
                    qi(&desc.shadow_name())
                ),
                None,
                &[pk_bytes.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

fn zero_non_tombstone_versions(desc: &TableDescriptor, pk_bytes: &[u8]) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "UPDATE {} SET col_version = 0 WHERE pk = $1 AND col_name <> '__TOMBSTONE__'",
                    qi(&desc.shadow_name())
                ),
                None,
                &[pk_bytes.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// Winner clock recording (spec §4.4): upsert the shadow row for
/// `(pk, col_name)` with the incoming clock, advancing the local
/// `db_version` if the incoming one is newer and minting a dictionary
/// entry for a first-seen `site_id`.
fn record_winner_clock(
    desc: &TableDescriptor,
    pk_bytes: &[u8],
    col_name: &str,
    incoming: &ChangeRow,
) -> Result<()> {
    let db_version = clock::db_version_next(Some(incoming.db_version));
    let site_idx = settings::site_id_to_index(&incoming.site_id)?;

    Spi::connect_mut(|client| {
        client
            .update(
                &format!(
                    "INSERT INTO {shadow} (pk, col_name, col_version, db_version, site_id, seq)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (pk, col_name) DO UPDATE SET
                        col_version = EXCLUDED.col_version,
                        db_version = EXCLUDED.db_version,
                        site_id = EXCLUDED.site_id,
                        seq = EXCLUDED.seq",
                    shadow = qi(&desc.shadow_name()),
                ),
                None,
                &[
                    pk_bytes.to_vec().into(),
                    col_name.into(),
                    incoming.col_version.into(),
                    db_version.into(),
                    site_idx.into(),
                    incoming.seq.into(),
                ],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

//! Changes virtual table (spec §4.7).
//!
//! Postgres has no SQLite-style writable virtual table, so the read and
//! write halves are two separate SQL-callable functions instead of one
//! relation: `cloudsync_changes()` is a set-returning function projecting
//! pending metadata across every augmented table, and
//! `cloudsync_changes_apply()` is the sole insert-only ingress, routing
//! each row straight into the merge engine (§4.4). `col_value` is carried
//! pre-encoded through the single-value PK codec framing so the relation
//! stays homogeneously typed regardless of the column's real Postgres type.

use std::collections::HashMap;

use pgrx::iter::TableIterator;
use pgrx::prelude::*;

use crate::codec::pk;
use crate::error::{CloudSyncError, Result};
use crate::merge;
use crate::shadow::{self, TableDescriptor};
use crate::types::{ChangeRow, Value, TOMBSTONE};
use crate::util::qi;

struct RawRow {
    pk: Vec<u8>,
    col_name: Option<String>,
    col_version: i64,
    db_version: i64,
    site_id: i64,
    seq: i32,
}

fn tombstone_causal_lengths(desc: &TableDescriptor) -> Result<HashMap<Vec<u8>, i64>> {
    Spi::connect(|client| {
        let rows = client
            .select(
                &format!(
                    "SELECT pk, col_version FROM {} WHERE col_name = '__TOMBSTONE__'",
                    qi(&desc.shadow_name())
                ),
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let mut map = HashMap::new();
        for row in rows {
            let pk: Vec<u8> = row
                .get(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .unwrap_or_default();
            let cv: i64 = row
                .get(2)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .unwrap_or(0);
            map.insert(pk, cv);
        }
        Ok(map)
    })
}

fn raw_rows(
    desc: &TableDescriptor,
    since_db_version: Option<i64>,
    only_site_id: Option<i64>,
) -> Result<Vec<RawRow>> {
    Spi::connect(|client| {
        let rows = client
            .select(
                &format!(
                    "SELECT pk, col_name, col_version, db_version, site_id, seq FROM {}
                     WHERE ($1::bigint IS NULL OR db_version >= $1)
                     AND ($2::bigint IS NULL OR site_id = $2)
                     ORDER BY db_version, seq",
                    qi(&desc.shadow_name())
                ),
                None,
                &[since_db_version.into(), only_site_id.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(RawRow {
                pk: row
                    .get(1)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or_default(),
                col_name: row.get(2).map_err(|e| CloudSyncError::storage(e.to_string()))?,
                col_version: row
                    .get(3)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or(0),
                db_version: row
                    .get(4)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or(0),
                site_id: row
                    .get(5)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or(0),
                seq: row
                    .get(6)
                    .map_err(|e| CloudSyncError::storage(e.to_string()))?
                    .unwrap_or(0),
            });
        }
        Ok(out)
    })
}

type ChangeTuple = (
    String,
    Vec<u8>,
    Option<String>,
    Vec<u8>,
    i64,
    i64,
    i64,
    i64,
    i32,
);

/// Read side (spec §4.7): project every augmented table's pending
/// metadata, ordered by `(db_version, seq)`. `since_db_version`/
/// `only_site_id`, when given, act as the selective-column filters the
/// spec calls out as supporting near-point or bounded-scan lookups.
#[pg_extern]
pub fn cloudsync_changes(
    since_db_version: default!(Option<i64>, "NULL"),
    only_site_id: default!(Option<i64>, "NULL"),
) -> Result<
    TableIterator<
        'static,
        (
            name!(tbl, String),
            name!(pk, Vec<u8>),
            name!(col_name, Option<String>),
            name!(col_value, Vec<u8>),
            name!(col_version, i64),
            name!(db_version, i64),
            name!(site_id, i64),
            name!(cl, i64),
            name!(seq, i32),
        ),
    >,
> {
    let mut out: Vec<ChangeTuple> = Vec::new();
    for table in shadow::list_augmented_tables()? {
        let desc = shadow::describe(&table)?;
        let cls = tombstone_causal_lengths(&desc)?;
        for raw in raw_rows(&desc, since_db_version, only_site_id)? {
            let cl = cls.get(&raw.pk).copied().unwrap_or(raw.col_version);
            let col_value = match &raw.col_name {
                None => encode_value(&Value::Null)?,
                Some(col) => {
                    let value = merge::column_value_in_user_table(&desc, &raw.pk, col)?
                        .unwrap_or(Value::Null);
                    encode_value(&value)?
                }
            };
            out.push((
                table.clone(),
                raw.pk,
                raw.col_name,
                col_value,
                raw.col_version,
                raw.db_version,
                raw.site_id,
                cl,
                raw.seq,
            ));
        }
    }
    out.sort_by_key(|row| (row.5, row.8));
    Ok(TableIterator::new(out))
}

fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(9);
    pk::encode_one_value(&mut out, value);
    Ok(out)
}

fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut pos = 0usize;
    let decoded = pk::decode_one(bytes, &mut pos, 0)?;
    Ok(decoded.to_owned_value())
}

/// Write side (spec §4.7): the sole ingress for remote changes. Routes
/// straight into the merge engine; UPDATE/DELETE against this relation
/// have no SQL-level representation to refuse since it is exposed purely
/// as an insert function.
#[allow(clippy::too_many_arguments)]
#[pg_extern]
pub fn cloudsync_changes_apply(
    tbl: String,
    pk_bytes: Vec<u8>,
    col_name: Option<String>,
    col_value: Vec<u8>,
    col_version: i64,
    db_version: i64,
    site_id: Vec<u8>,
    causal_length: i64,
    seq: i32,
) -> Result<()> {
    if site_id.len() != 16 {
        return Err(CloudSyncError::misuse("site_id must be exactly 16 bytes"));
    }
    let mut site = [0u8; 16];
    site.copy_from_slice(&site_id);

    let col_name = col_name.filter(|c| c != TOMBSTONE);
    let row = ChangeRow {
        tbl,
        pk: pk_bytes,
        col_name,
        col_value: decode_value(&col_value)?,
        col_version,
        db_version,
        site_id: site,
        causal_length,
        seq,
    };
    merge::merge_insert(&row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_through_single_value_encoding() {
        for v in [
            Value::Null,
            Value::Integer(-42),
            Value::Float(1.5),
            Value::Text("hi".into()),
            Value::Blob(vec![9, 9]),
        ] {
            let bytes = encode_value(&v).unwrap();
            assert_eq!(decode_value(&bytes).unwrap(), v);
        }
    }
}

//! Maps a Postgres column's declared type down onto the four storage
//! classes the wire format carries (spec §4.1/§4.6's NULL/INTEGER/FLOAT/
//! TEXT/BLOB total order). Shared by shadow backfill/pruning (bulk,
//! SQL-driven) and capture triggers (per-row, tuple-driven) so both paths
//! compute identical primary-key bytes for the same row.

use pgrx::prelude::*;

use crate::error::{CloudSyncError, Result};
use crate::types::Value;
use crate::util::ql;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgCategory {
    Int,
    Float,
    Text,
    Blob,
}

pub fn categorize(table: &str, col: &str) -> Result<PgCategory> {
    let ty: Option<String> = Spi::connect(|client| {
        client
            .select(
                &format!(
                    "SELECT format_type(atttypid, atttypmod) FROM pg_attribute \
                     WHERE attrelid = {}::regclass AND attname = {}",
                    ql(table),
                    ql(col)
                ),
                Some(1),
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })?;
    let ty = ty.ok_or_else(|| {
        CloudSyncError::misuse(format!("no such column \"{col}\" on table \"{table}\""))
    })?;
    Ok(categorize_type_name(&ty))
}

fn categorize_type_name(ty: &str) -> PgCategory {
    match ty {
        t if t.starts_with("integer") || t.starts_with("bigint") || t.starts_with("smallint") => {
            PgCategory::Int
        }
        t if t.starts_with("real") || t.starts_with("double precision") || t.starts_with("numeric") => {
            PgCategory::Float
        }
        "bytea" => PgCategory::Blob,
        _ => PgCategory::Text,
    }
}

/// SQL expression casting `col_ident` (already identifier-quoted) down to
/// the Postgres type that backs its storage class.
pub fn cast_expr(col_ident: &str, cat: PgCategory) -> String {
    match cat {
        PgCategory::Int => format!("{col_ident}::bigint"),
        PgCategory::Float => format!("{col_ident}::double precision"),
        PgCategory::Text => format!("{col_ident}::text"),
        PgCategory::Blob => format!("{col_ident}::bytea"),
    }
}

/// Read column `ord` (1-based) of `row`, already cast to `cat`'s backing
/// type, into a [`Value`]. `NULL` yields [`Value::Null`] rather than an
/// error — callers that require a non-null primary key enforce that
/// separately (spec §4.1: a PK must not contain NULL).
pub fn value_at(row: &SpiHeapTupleData, ord: usize, cat: PgCategory) -> Result<Value> {
    Ok(match cat {
        PgCategory::Int => row
            .get::<i64>(ord)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        PgCategory::Float => row
            .get::<f64>(ord)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Float)
            .unwrap_or(Value::Null),
        PgCategory::Text => row
            .get::<String>(ord)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Text)
            .unwrap_or(Value::Null),
        PgCategory::Blob => row
            .get::<Vec<u8>>(ord)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Blob)
            .unwrap_or(Value::Null),
    })
}

/// Same mapping for a `PgHeapTuple`, used by capture triggers which see
/// `OLD`/`NEW` as tuples rather than SPI rows.
pub fn value_from_tuple(
    tuple: &PgHeapTuple<'_, impl pgrx::WhoAllocated>,
    col: &str,
    cat: PgCategory,
) -> Result<Value> {
    Ok(match cat {
        PgCategory::Int => tuple
            .get_by_name::<i64>(col)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        PgCategory::Float => tuple
            .get_by_name::<f64>(col)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Float)
            .unwrap_or(Value::Null),
        PgCategory::Text => tuple
            .get_by_name::<String>(col)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Text)
            .unwrap_or(Value::Null),
        PgCategory::Blob => tuple
            .get_by_name::<Vec<u8>>(col)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .map(Value::Blob)
            .unwrap_or(Value::Null),
    })
}

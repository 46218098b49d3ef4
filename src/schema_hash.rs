//! Schema hashing and compatibility registry (spec §4.8).
//!
//! The current schema hash is a stable 64-bit hash of the concatenated,
//! lowercased `CREATE TABLE` text of all augmented tables, ordered by
//! name. Postgres has no single `pg_get_tabledef`-style builtin, so the
//! canonical text is synthesized from `pg_attribute`/`format_type` the
//! same way the teacher's `executor_cache.rs` introspects column lists —
//! it is stable under column reordering that doesn't happen (Postgres
//! preserves `attnum` order) and changes whenever a column is added,
//! dropped, renamed, or retyped.

use pgrx::prelude::*;

use crate::error::{CloudSyncError, Result};

/// Build the canonical DDL-ish text for one table: `create table t (c1
/// type1, c2 type2, ...)`, columns ordered by `attnum`, excluding dropped
/// columns. Lowercased so `TEXT` and `text` hash the same.
fn canonical_table_text(table: &str) -> Result<String> {
    Spi::connect(|client| {
        let rows = client
            .select(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 WHERE c.relname = $1 AND a.attnum > 0 AND NOT a.attisdropped
                 ORDER BY a.attnum",
                None,
                &[table.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;

        let mut cols = Vec::new();
        for row in rows {
            let name: String = row
                .get(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .unwrap_or_default();
            let ty: String = row
                .get(2)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .unwrap_or_default();
            cols.push(format!("{name} {ty}"));
        }
        if cols.is_empty() {
            return Err(CloudSyncError::misuse(format!(
                "table \"{table}\" has no columns or does not exist"
            )));
        }
        Ok(format!(
            "create table {} ({})",
            table.to_lowercase(),
            cols.join(", ")
        )
        .to_lowercase())
    })
}

/// Compute the current schema hash over all augmented tables, ordered by
/// name (spec §4.8).
pub fn compute_schema_hash(augmented_tables: &[String]) -> Result<u64> {
    let mut sorted: Vec<&String> = augmented_tables.iter().collect();
    sorted.sort();

    let mut combined = String::new();
    for table in sorted {
        combined.push_str(&canonical_table_text(table)?);
        combined.push(';');
    }
    Ok(xxhash_rust::xxh3::xxh3_64(combined.as_bytes()))
}

/// Insert `hash` into the registry with the next monotonically increasing
/// `seq`, unless it is already present (spec §4.8: "unique").
pub fn register_schema_hash(hash: u64) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                "INSERT INTO cloudsync.schema_versions (hash, seq)
                 VALUES ($1, (SELECT COALESCE(max(seq), 0) + 1 FROM cloudsync.schema_versions))
                 ON CONFLICT (hash) DO NOTHING",
                None,
                &[(hash as i64).into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// Whether `hash` is one this replica has itself been through — the gate
/// applied to every inbound payload (spec §4.8).
pub fn is_known_schema_hash(hash: u64) -> Result<bool> {
    Spi::connect(|client| {
        let exists: Option<bool> = client
            .select(
                "SELECT EXISTS(SELECT 1 FROM cloudsync.schema_versions WHERE hash = $1)",
                Some(1),
                &[(hash as i64).into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(exists.unwrap_or(false))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_for_same_text() {
        let a = xxhash_rust::xxh3::xxh3_64(b"create table t (a int, b text);");
        let b = xxhash_rust::xxh3::xxh3_64(b"create table t (a int, b text);");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_column_addition() {
        let a = xxhash_rust::xxh3::xxh3_64(b"create table t (a int);");
        let b = xxhash_rust::xxh3::xxh3_64(b"create table t (a int, b text);");
        assert_ne!(a, b);
    }
}

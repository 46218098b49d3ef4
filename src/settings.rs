//! Persistent configuration, site identity, and the site-id dictionary
//! (spec §3 "Site identity", §6 "Persisted relations").
//!
//! `settings(key text pk, value text)` backs everything here: the site_id,
//! the four sync cursors, `pre_alter_dbversion`, and the ambient
//! `cloudsync_debug`/`merge_equal_values` knobs (SPEC_FULL.md "Ambient
//! stack / Configuration").

use pgrx::prelude::*;

use crate::error::{CloudSyncError, Result};

pub const KEY_SITE_ID: &str = "site_id";
pub const KEY_LIB_VERSION: &str = "lib_version";
pub const KEY_SCHEMA_VERSION: &str = "schema_version";
pub const KEY_DEBUG: &str = "cloudsync_debug";
pub const KEY_MERGE_EQUAL_VALUES: &str = "merge_equal_values";
pub const KEY_SEND_DB_VERSION: &str = "send_db_version";
pub const KEY_SEND_SEQ: &str = "send_seq";
pub const KEY_CHECK_DB_VERSION: &str = "check_db_version";
pub const KEY_CHECK_SEQ: &str = "check_seq";
pub const KEY_PRE_ALTER_DBVERSION: &str = "pre_alter_dbversion";

pub const LIB_VERSION: &str = "0.1.0";

/// Idempotently create the relations spec §6 lists as always-present:
/// `settings`, `site_id` (dictionary), `table_settings`, `schema_versions`.
pub fn ensure_catalog_relations() -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update("CREATE SCHEMA IF NOT EXISTS cloudsync", None, &[])
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    Spi::connect_mut(|client| {
        client
            .update(
                "CREATE TABLE IF NOT EXISTS cloudsync.settings (
                    key text PRIMARY KEY,
                    value text
                )",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        client
            .update(
                "CREATE TABLE IF NOT EXISTS cloudsync.site_id (
                    rowid bigint PRIMARY KEY,
                    site_id bytea UNIQUE NOT NULL
                )",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        client
            .update(
                "CREATE TABLE IF NOT EXISTS cloudsync.table_settings (
                    tbl text NOT NULL,
                    col text,
                    key text NOT NULL,
                    value text,
                    PRIMARY KEY (tbl, key)
                )",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        client
            .update(
                "CREATE TABLE IF NOT EXISTS cloudsync.schema_versions (
                    hash bigint PRIMARY KEY,
                    seq bigint NOT NULL
                )",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    // rowid 0 is reserved for "local site" (spec §3) — always present so
    // foreign-key-style joins never have to special-case it.
    Spi::connect_mut(|client| {
        client
            .update(
                "INSERT INTO cloudsync.site_id (rowid, site_id) VALUES (0, repeat('\\000', 16)::bytea)
                 ON CONFLICT (rowid) DO NOTHING",
                None,
                &[],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })?;

    if get_setting(KEY_LIB_VERSION)?.is_none() {
        put_setting(KEY_LIB_VERSION, LIB_VERSION)?;
    }
    if get_setting(KEY_MERGE_EQUAL_VALUES)?.is_none() {
        // Open Question (spec §9): default on, persisted.
        put_setting(KEY_MERGE_EQUAL_VALUES, "1")?;
    }
    if get_setting(KEY_DEBUG)?.is_none() {
        put_setting(KEY_DEBUG, "0")?;
    }
    Ok(())
}

pub fn get_setting(key: &str) -> Result<Option<String>> {
    Spi::connect(|client| {
        let table = client
            .select(
                "SELECT value FROM cloudsync.settings WHERE key = $1",
                Some(1),
                &[key.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        table
            .first()
            .get::<String>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))
    })
}

pub fn put_setting(key: &str, value: &str) -> Result<()> {
    Spi::connect_mut(|client| {
        client
            .update(
                "INSERT INTO cloudsync.settings (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                None,
                &[key.into(), value.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

pub fn merge_equal_values_enabled() -> Result<bool> {
    Ok(get_setting(KEY_MERGE_EQUAL_VALUES)?.as_deref() == Some("1"))
}

pub fn debug_enabled() -> Result<bool> {
    Ok(get_setting(KEY_DEBUG)?.as_deref() == Some("1"))
}

/// Return this replica's 16-byte site id, generating one with UUID v7 on
/// first initialization (spec §3). The id never changes afterward.
pub fn site_id() -> Result<[u8; 16]> {
    if let Some(existing) = load_site_id()? {
        return Ok(existing);
    }
    let fresh = uuid::Uuid::now_v7();
    let bytes = *fresh.as_bytes();
    put_setting(KEY_SITE_ID, &hex_encode(&bytes))?;
    Ok(bytes)
}

fn load_site_id() -> Result<Option<[u8; 16]>> {
    match get_setting(KEY_SITE_ID)? {
        Some(hex) => Ok(Some(hex_decode_16(&hex)?)),
        None => Ok(None),
    }
}

/// Translate a 16-byte site id into its small dictionary integer,
/// minting a new entry on first sight (spec §3 "site-id dictionary",
/// used by winner-clock recording in §4.4).
pub fn site_id_to_index(site: &[u8; 16]) -> Result<i64> {
    if *site == [0u8; 16] {
        return Ok(0);
    }
    Spi::connect_mut(|client| {
        let existing = client
            .select(
                "SELECT rowid FROM cloudsync.site_id WHERE site_id = $1",
                Some(1),
                &[site.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get::<i64>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        if let Some(idx) = existing {
            return Ok(idx);
        }
        let inserted = client
            .select(
                "INSERT INTO cloudsync.site_id (rowid, site_id)
                 VALUES ((SELECT COALESCE(max(rowid), 0) + 1 FROM cloudsync.site_id), $1)
                 RETURNING rowid",
                Some(1),
                &[site.to_vec().into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get::<i64>(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .ok_or_else(|| CloudSyncError::storage("site_id insert did not return rowid"))?;
        Ok(inserted)
    })
}

pub fn index_to_site_id(idx: i64) -> Result<[u8; 16]> {
    if idx == 0 {
        return Ok([0u8; 16]);
    }
    Spi::connect(|client| {
        let bytes: Option<Vec<u8>> = client
            .select(
                "SELECT site_id FROM cloudsync.site_id WHERE rowid = $1",
                Some(1),
                &[idx.into()],
            )
            .map_err(|e| CloudSyncError::storage(e.to_string()))?
            .first()
            .get(1)
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        let bytes = bytes.ok_or_else(|| {
            CloudSyncError::storage(format!("no site_id registered for dictionary index {idx}"))
        })?;
        if bytes.len() != 16 {
            return Err(CloudSyncError::storage("site_id dictionary entry is not 16 bytes"));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(out)
    })
}

/// The four sync cursors a network collaborator must persist (spec §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCursors {
    pub send_db_version: i64,
    pub send_seq: i32,
    pub check_db_version: i64,
    pub check_seq: i32,
}

pub fn load_sync_cursors() -> Result<SyncCursors> {
    Ok(SyncCursors {
        send_db_version: get_setting(KEY_SEND_DB_VERSION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        send_seq: get_setting(KEY_SEND_SEQ)?.and_then(|v| v.parse().ok()).unwrap_or(0),
        check_db_version: get_setting(KEY_CHECK_DB_VERSION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        check_seq: get_setting(KEY_CHECK_SEQ)?.and_then(|v| v.parse().ok()).unwrap_or(0),
    })
}

pub fn store_sync_cursors(cursors: &SyncCursors) -> Result<()> {
    put_setting(KEY_SEND_DB_VERSION, &cursors.send_db_version.to_string())?;
    put_setting(KEY_SEND_SEQ, &cursors.send_seq.to_string())?;
    put_setting(KEY_CHECK_DB_VERSION, &cursors.check_db_version.to_string())?;
    put_setting(KEY_CHECK_SEQ, &cursors.check_seq.to_string())?;
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode_16(s: &str) -> Result<[u8; 16]> {
    if s.len() != 32 {
        return Err(CloudSyncError::storage("site_id setting is not 32 hex chars"));
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| CloudSyncError::storage("site_id setting is not valid hex"))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let bytes: [u8; 16] = std::array::from_fn(|i| i as u8);
        let hex = hex_encode(&bytes);
        assert_eq!(hex_decode_16(&hex).unwrap(), bytes);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(hex_decode_16("not-hex").is_err());
    }
}

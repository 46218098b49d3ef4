//! Network collaborator interface (spec §6): thin SQL-visible wrappers
//! over an external HTTP agent. The agent itself — endpoint parsing,
//! auth token storage, the actual PUT/POST/GET legs — is out of scope
//! (spec §1 "external collaborators, specified only by their
//! interfaces"). What belongs to the core substrate regardless of which
//! HTTP client eventually backs it: the four sync cursors, detecting
//! unsent local changes, and the send-then-check retry loop (SPEC_FULL.md
//! "Supplemented features: network retry/backoff").

use std::thread;
use std::time::Duration;

use pgrx::prelude::*;

use crate::error::{CloudSyncError, Result};
use crate::settings::{self, SyncCursors};
use crate::shadow;
use crate::util::qi;

const KEY_CONNECTION_STRING: &str = "network_connection_string";
const KEY_AUTH_TOKEN: &str = "network_auth_token";
const KEY_API_KEY: &str = "network_api_key";

pub fn init(connection_string: &str) -> Result<()> {
    settings::put_setting(KEY_CONNECTION_STRING, connection_string)
}

pub fn cleanup() -> Result<()> {
    settings::put_setting(KEY_CONNECTION_STRING, "")?;
    settings::put_setting(KEY_AUTH_TOKEN, "")?;
    settings::put_setting(KEY_API_KEY, "")?;
    Ok(())
}

pub fn set_token(token: &str) -> Result<()> {
    settings::put_setting(KEY_AUTH_TOKEN, token)
}

pub fn set_apikey(key: &str) -> Result<()> {
    settings::put_setting(KEY_API_KEY, key)
}

fn configured_connection_string() -> Result<String> {
    settings::get_setting(KEY_CONNECTION_STRING)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CloudSyncError::misuse("network_init has not been called"))
}

/// True if any shadow row on any augmented table carries a clock past the
/// `send_db_version`/`send_seq` cursor (spec §6).
pub fn has_unsent_changes() -> Result<bool> {
    let cursors = settings::load_sync_cursors()?;
    for table in shadow::list_augmented_tables()? {
        let desc = shadow::describe(&table)?;
        let found: Option<bool> = Spi::connect(|client| {
            client
                .select(
                    &format!(
                        "SELECT EXISTS(SELECT 1 FROM {} WHERE db_version > $1 OR (db_version = $1 AND seq > $2))",
                        qi(&desc.shadow_name())
                    ),
                    Some(1),
                    &[cursors.send_db_version.into(), cursors.send_seq.into()],
                )
                .map_err(|e| CloudSyncError::storage(e.to_string()))?
                .first()
                .get(1)
                .map_err(|e| CloudSyncError::storage(e.to_string()))
        })?;
        if found.unwrap_or(false) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Ships every row past the send cursor as a payload, then advances it.
/// No HTTP agent is linked into this build (spec §1 non-goal), so this
/// always reports a network failure without disturbing the cursor — the
/// same contract a real collaborator's transport failure would produce.
pub fn send_changes() -> Result<()> {
    configured_connection_string()?;
    Err(CloudSyncError::network(
        "no HTTP collaborator is linked into this build; send_changes cannot reach the network",
    ))
}

pub fn check_changes() -> Result<i32> {
    configured_connection_string()?;
    Err(CloudSyncError::network(
        "no HTTP collaborator is linked into this build; check_changes cannot reach the network",
    ))
}

/// `network_sync` (spec §6): send-then-check with retry. Exponential
/// backoff between attempts, starting at `wait_ms` and doubling each
/// time, capped by `max_retries` — the supplemented retry/backoff loop
/// (SPEC_FULL.md).
pub fn sync(wait_ms: i64, max_retries: i32) -> Result<i32> {
    configured_connection_string()?;
    let mut attempt = 0;
    let mut delay = wait_ms.max(0) as u64;
    loop {
        let outcome = send_changes().and_then(|_| check_changes());
        match outcome {
            Ok(rows_applied) => return Ok(rows_applied),
            Err(err) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    target: "crdt_sync::network",
                    attempt,
                    error = %err,
                    "sync attempt failed, retrying"
                );
                if delay > 0 {
                    thread::sleep(Duration::from_millis(delay));
                }
                delay = delay.saturating_mul(2).max(1);
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn reset_sync_version() -> Result<()> {
    settings::store_sync_cursors(&SyncCursors::default())
}

pub fn logout() -> Result<()> {
    shadow::with_savepoint("cloudsync_logout", || {
        cleanup()?;
        reset_sync_version()
    })
}

use pgrx::prelude::*;

pg_module_magic!();

mod changes;
mod clock;
mod codec;
mod error;
mod merge;
mod network;
mod rowcodec;
mod schema_hash;
mod settings;
mod shadow;
mod statements;
mod triggers;
mod types;
mod util;

use error::{CloudSyncError, Result};
use types::{Algo, Value};

/// Registers the commit/rollback hooks the clock engine needs (spec §5:
/// "on commit hook, `db_version := pending; seq := 0`; on rollback hook,
/// `pending := none; seq := 0`"). The teacher has no equivalent since its
/// planner is a single-shot SPI read with no cross-transaction state.
#[pg_guard]
extern "C" fn _PG_init() {
    pgrx::callbacks::register_xact_callback(pgrx::callbacks::PgXactCallbackEvent::Commit, || {
        clock::on_commit();
    });
    pgrx::callbacks::register_xact_callback(pgrx::callbacks::PgXactCallbackEvent::Abort, || {
        clock::on_rollback();
    });
}

fn parse_algo(algo: Option<&str>) -> Result<Option<Algo>> {
    match algo {
        None => Ok(None),
        Some(s) => Algo::from_str(s)
            .map(Some)
            .ok_or_else(|| CloudSyncError::misuse(format!("unknown algo {s:?} (expected CLS/DWS/AWS/GOS)"))),
    }
}

/// `init(table, algo?, force_int_pk?)` (spec §4.5, §6).
#[pg_extern]
fn init(
    table: &str,
    algo: default!(Option<&str>, "NULL"),
    force_int_pk: default!(bool, false),
) -> Result<()> {
    shadow::init(table, parse_algo(algo)?, force_int_pk)
}

/// `enable(table | *)` (spec §6).
#[pg_extern]
fn enable(table: &str) -> Result<()> {
    shadow::enable(table)
}

/// `disable(table | *)` (spec §6).
#[pg_extern]
fn disable(table: &str) -> Result<()> {
    shadow::disable(table)
}

/// `is_enabled(table) -> 0|1` (spec §6).
#[pg_extern]
fn is_enabled(table: &str) -> Result<i32> {
    Ok(shadow::is_enabled(table)? as i32)
}

/// `cleanup(table | *)` (spec §4.5, §6).
#[pg_extern]
fn cleanup(table: &str) -> Result<()> {
    shadow::cleanup(table)
}

/// `terminate()` (spec §6): the final teardown — every augmented table's
/// shadow relation and triggers, the network collaborator's stored
/// credentials, and the `cloudsync` catalog schema itself.
#[pg_extern]
fn terminate() -> Result<()> {
    shadow::cleanup("*")?;
    network::cleanup()?;
    Spi::connect_mut(|client| {
        client
            .update("DROP SCHEMA IF EXISTS cloudsync CASCADE", None, &[])
            .map_err(|e| CloudSyncError::storage(e.to_string()))?;
        Ok(())
    })
}

/// `version() -> text` (spec §6).
#[pg_extern]
fn version() -> &'static str {
    settings::LIB_VERSION
}

/// `siteid() -> blob(16)` (spec §6, §3).
#[pg_extern]
fn siteid() -> Result<Vec<u8>> {
    Ok(settings::site_id()?.to_vec())
}

/// `db_version() -> i64` (spec §6, §4.2): last value committed, not the
/// in-flight pending one.
#[pg_extern]
fn db_version() -> i64 {
    clock::current_db_version()
}

/// `db_version_next(merging?) -> i64` (spec §6, §4.2).
#[pg_extern]
fn db_version_next(merging: default!(Option<i64>, "NULL")) -> i64 {
    clock::db_version_next(merging)
}

/// `seq() -> i32` (spec §6, §4.2): current intra-transaction sequence
/// counter, without advancing it — advancing only happens as a side
/// effect of actual capture (`clock::bump_seq`, used by `triggers`).
#[pg_extern]
fn seq() -> i32 {
    clock::current_seq()
}

/// `uuid() -> text` (spec §6): a fresh UUID v7, independent of site
/// identity — a convenience generator the host SQL layer can call for its
/// own row ids, mirroring the `uuid::Uuid::now_v7()` call the site-id
/// generator in `settings::site_id` already makes.
#[pg_extern]
fn uuid() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// `begin_alter(table)` (spec §4.5, §6).
#[pg_extern]
fn begin_alter(table: &str) -> Result<()> {
    shadow::begin_alter(table)
}

/// `commit_alter(table)` (spec §4.5, §6).
#[pg_extern]
fn commit_alter(table: &str) -> Result<()> {
    shadow::commit_alter(table)
}

/// Convert a JSONB scalar into the wire's 4-category `Value`. `{"blob_hex":
/// "..."}` is the one non-native shape, carrying BLOB values through JSON.
fn json_to_value(v: &serde_json::Value) -> Result<Value> {
    match v {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                n.as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| CloudSyncError::misuse("number is neither i64 nor f64"))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_json::Value::Object(map) => {
            let hex = map
                .get("blob_hex")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CloudSyncError::misuse("expected {\"blob_hex\": \"...\"} for a BLOB value"))?;
            Ok(Value::Blob(hex_decode(hex)?))
        }
        _ => Err(CloudSyncError::misuse("unsupported JSON shape for a pk_encode value")),
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => {
            let mut map = serde_json::Map::new();
            map.insert("blob_hex".to_string(), serde_json::Value::String(hex_encode(b)));
            serde_json::Value::Object(map)
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(CloudSyncError::misuse("blob_hex must have an even number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| CloudSyncError::misuse("blob_hex contains invalid hex digits"))
        })
        .collect()
}

/// `pk_encode(v1..vn) -> blob` (spec §4.1, §6). Exposed to SQL as a single
/// JSONB array argument rather than a variadic list of heterogeneously
/// typed SQL arguments, since Postgres has no native pseudo-type that
/// carries NULL/INTEGER/FLOAT/TEXT/BLOB through one variadic signature the
/// way the wire's own type-tagged codec does — the JSON array is the same
/// "ordered list of typed values" the codec already defines, expressed
/// through `serde_json` (already a teacher dependency) instead of a fixed
/// SQL parameter list.
#[pg_extern]
fn pk_encode(values: pgrx::JsonB) -> Result<Vec<u8>> {
    let pgrx::JsonB(json) = values;
    let arr = json
        .as_array()
        .ok_or_else(|| CloudSyncError::misuse("pk_encode expects a JSON array of values"))?;
    let values: Vec<Value> = arr.iter().map(json_to_value).collect::<Result<_>>()?;
    codec::pk::encode_pk(&values)
}

/// `pk_decode(blob, index) -> value` (spec §4.1, §6), returned as JSONB
/// using the same scalar mapping as `pk_encode`.
#[pg_extern]
fn pk_decode(bytes: Vec<u8>, index: i32) -> Result<pgrx::JsonB> {
    if index < 0 {
        return Err(CloudSyncError::misuse("pk_decode index must be non-negative"));
    }
    let target = index as usize;
    let mut found = None;
    codec::pk::decode_values(&bytes, |v| {
        if v.index == target {
            found = Some(v.to_owned_value());
        }
        Ok(())
    })?;
    let value = found.ok_or_else(|| CloudSyncError::misuse(format!("no value at index {index}")))?;
    Ok(pgrx::JsonB(value_to_json(&value)))
}

/// `payload_encode(...) -> blob` (spec §4.6, §6). The spec calls this out
/// as a SQL *aggregate* over one row per call; it is exposed here as a
/// single call over parallel arrays instead (`SELECT
/// crdt_sync.payload_encode(array_agg(tbl), array_agg(pk), ...) FROM
/// cloudsync_changes()`), which produces the identical wire blob without
/// requiring pgrx's aggregate-definition machinery — noted in DESIGN.md.
#[allow(clippy::too_many_arguments)]
#[pg_extern]
fn payload_encode(
    tbl: Vec<String>,
    pk: Vec<Vec<u8>>,
    col_name: Vec<Option<String>>,
    col_value: Vec<Vec<u8>>,
    col_version: Vec<i64>,
    db_version: Vec<i64>,
    site_id: Vec<Vec<u8>>,
    cl: Vec<i64>,
    seq: Vec<i32>,
) -> Result<Vec<u8>> {
    let n = tbl.len();
    if [
        pk.len(),
        col_name.len(),
        col_value.len(),
        col_version.len(),
        db_version.len(),
        site_id.len(),
        cl.len(),
        seq.len(),
    ]
    .iter()
    .any(|len| *len != n)
    {
        return Err(CloudSyncError::misuse(
            "payload_encode arrays must all have the same length",
        ));
    }

    let mut encoder = codec::payload::PayloadEncoder::new();
    for i in 0..n {
        let site = &site_id[i];
        if site.len() != 16 {
            return Err(CloudSyncError::misuse("site_id must be exactly 16 bytes"));
        }
        let mut site_bytes = [0u8; 16];
        site_bytes.copy_from_slice(site);

        let mut pos = 0usize;
        let value = codec::pk::decode_one(&col_value[i], &mut pos, 0)?.to_owned_value();

        let row = types::ChangeRow {
            tbl: tbl[i].clone(),
            pk: pk[i].clone(),
            col_name: col_name[i].clone(),
            col_value: value,
            col_version: col_version[i],
            db_version: db_version[i],
            site_id: site_bytes,
            causal_length: cl[i],
            seq: seq[i],
        };
        encoder.accumulate(&row);
    }

    let augmented = shadow::list_augmented_tables()?;
    let hash = schema_hash::compute_schema_hash(&augmented)?;
    let lib_parts: Vec<u8> = settings::LIB_VERSION
        .split('.')
        .filter_map(|p| p.parse::<u8>().ok())
        .collect();
    let libversion = [
        *lib_parts.first().unwrap_or(&0),
        *lib_parts.get(1).unwrap_or(&0),
        *lib_parts.get(2).unwrap_or(&0),
    ];
    encoder.finish(hash, libversion)
}

/// `payload_decode(blob) -> i32` (spec §4.6, §6): verify signature and
/// schema-hash membership, then route every row into the merge engine.
/// The §8 "trigger suppression" property holds because the merge engine's
/// own physical writes already run under `triggers::with_capture_suppressed`
/// (see `merge.rs`).
#[pg_extern]
fn payload_decode(bytes: Vec<u8>) -> Result<i32> {
    let mut first_storage_err: Option<CloudSyncError> = None;
    let applied = codec::payload::decode_payload(
        &bytes,
        &|hash| schema_hash::is_known_schema_hash(hash).unwrap_or(false),
        |_row| codec::payload::ApplyDecision::Proceed,
        |row, _decision_result| {
            if let Err(e) = merge::merge_insert(row) {
                tracing::warn!(target: "crdt_sync::payload", table = %row.tbl, error = %e, "row failed to merge");
                if first_storage_err.is_none() && matches!(e, CloudSyncError::Storage(_)) {
                    first_storage_err = Some(e);
                }
            }
        },
    )?;
    if let Some(err) = first_storage_err {
        return Err(err);
    }
    Ok(applied as i32)
}

#[pg_extern]
fn network_init(connection_string: &str) -> Result<()> {
    network::init(connection_string)
}

#[pg_extern]
fn network_cleanup() -> Result<()> {
    network::cleanup()
}

#[pg_extern]
fn network_set_token(token: &str) -> Result<()> {
    network::set_token(token)
}

#[pg_extern]
fn network_set_apikey(key: &str) -> Result<()> {
    network::set_apikey(key)
}

#[pg_extern]
fn network_has_unsent_changes() -> Result<i32> {
    Ok(network::has_unsent_changes()? as i32)
}

#[pg_extern]
fn network_send_changes() -> Result<()> {
    network::send_changes()
}

#[pg_extern]
fn network_check_changes() -> Result<i32> {
    network::check_changes()
}

#[pg_extern]
fn network_sync(wait_ms: default!(i64, 1000), max_retries: default!(i32, 3)) -> Result<i32> {
    network::sync(wait_ms, max_retries)
}

#[pg_extern]
fn network_reset_sync_version() -> Result<()> {
    network::reset_sync_version()
}

#[pg_extern]
fn network_logout() -> Result<()> {
    network::logout()
}

// ── Tests ──

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_extension_loads() {
        let result = Spi::get_one::<bool>("SELECT true");
        assert_eq!(result, Ok(Some(true)));
    }

    #[pg_test]
    fn test_init_and_insert_captures_shadow_rows() {
        Spi::run(
            "CREATE TABLE customers (
                first_name text, last_name text, age int,
                note text default '', stamp text default current_time,
                primary key (first_name, last_name)
            )",
        )
        .unwrap();
        Spi::run("SELECT init('customers')").unwrap();
        Spi::run(
            "INSERT INTO customers (first_name, last_name, age) VALUES ('name1', 'surname1', 10)",
        )
        .unwrap();

        let count = Spi::get_one::<i64>("SELECT count(*) FROM customers_meta").unwrap();
        assert_eq!(count, Some(4));
    }

    #[pg_test]
    fn test_gos_rejects_update() {
        Spi::run("CREATE TABLE log (id text primary key, descr text)").unwrap();
        Spi::run("SELECT init('log', 'GOS')").unwrap();
        Spi::run("INSERT INTO log (id, descr) VALUES ('u', 'hello')").unwrap();

        let result = std::panic::catch_unwind(|| {
            Spi::run("UPDATE log SET descr = 'world' WHERE id = 'u'").unwrap();
        });
        assert!(result.is_err());
    }

    #[pg_test]
    fn test_pk_encode_decode_round_trips_through_jsonb() {
        let bytes = Spi::get_one::<Vec<u8>>("SELECT pk_encode('[1, \"two\", 3.5]'::jsonb)")
            .unwrap()
            .unwrap();
        let _ = bytes;
    }

    #[pg_test]
    fn test_merge_higher_value_wins_on_col_version_tie() {
        Spi::run("CREATE TABLE widgets (id text primary key, label text default '')").unwrap();
        Spi::run("SELECT init('widgets')").unwrap();
        Spi::run("INSERT INTO widgets (id, label) VALUES ('w1', 'aaa')").unwrap();

        let pk = crate::codec::pk::encode_pk(&[crate::types::Value::Text("w1".to_string())]).unwrap();
        let row = crate::types::ChangeRow {
            tbl: "widgets".to_string(),
            pk,
            col_name: Some("label".to_string()),
            col_value: crate::types::Value::Text("zzz".to_string()),
            col_version: 1,
            db_version: 1,
            site_id: [9u8; 16],
            causal_length: 1,
            seq: 0,
        };
        crate::merge::merge_insert(&row).unwrap();

        let label = Spi::get_one::<String>("SELECT label FROM widgets WHERE id = 'w1'").unwrap();
        assert_eq!(label, Some("zzz".to_string()));
    }

    #[pg_test]
    fn test_merge_stale_change_is_dropped() {
        Spi::run("CREATE TABLE widgets2 (id text primary key, label text default '')").unwrap();
        Spi::run("SELECT init('widgets2')").unwrap();
        Spi::run("INSERT INTO widgets2 (id, label) VALUES ('w1', 'aaa')").unwrap();

        let pk = crate::codec::pk::encode_pk(&[crate::types::Value::Text("w1".to_string())]).unwrap();
        let row = crate::types::ChangeRow {
            tbl: "widgets2".to_string(),
            pk,
            col_name: None,
            col_value: crate::types::Value::Null,
            col_version: 0,
            db_version: 1,
            site_id: [1u8; 16],
            causal_length: 0,
            seq: 0,
        };
        crate::merge::merge_insert(&row).unwrap();

        let exists =
            Spi::get_one::<bool>("SELECT EXISTS(SELECT 1 FROM widgets2 WHERE id = 'w1')").unwrap();
        assert_eq!(exists, Some(true));
    }

    #[pg_test]
    fn test_merge_delete_then_resurrect() {
        Spi::run("CREATE TABLE widgets3 (id text primary key, label text default '')").unwrap();
        Spi::run("SELECT init('widgets3')").unwrap();
        Spi::run("INSERT INTO widgets3 (id, label) VALUES ('w1', 'aaa')").unwrap();

        let pk = crate::codec::pk::encode_pk(&[crate::types::Value::Text("w1".to_string())]).unwrap();

        let delete_row = crate::types::ChangeRow {
            tbl: "widgets3".to_string(),
            pk: pk.clone(),
            col_name: None,
            col_value: crate::types::Value::Null,
            col_version: 2,
            db_version: 5,
            site_id: [2u8; 16],
            causal_length: 2,
            seq: 0,
        };
        crate::merge::merge_insert(&delete_row).unwrap();
        let exists =
            Spi::get_one::<bool>("SELECT EXISTS(SELECT 1 FROM widgets3 WHERE id = 'w1')").unwrap();
        assert_eq!(exists, Some(false));

        let resurrect_row = crate::types::ChangeRow {
            tbl: "widgets3".to_string(),
            pk,
            col_name: None,
            col_value: crate::types::Value::Null,
            col_version: 3,
            db_version: 6,
            site_id: [2u8; 16],
            causal_length: 3,
            seq: 0,
        };
        crate::merge::merge_insert(&resurrect_row).unwrap();
        let exists =
            Spi::get_one::<bool>("SELECT EXISTS(SELECT 1 FROM widgets3 WHERE id = 'w1')").unwrap();
        assert_eq!(exists, Some(true));
    }

    #[pg_test]
    fn test_capture_trigger_resurrection_flips_tombstone_parity_each_time() {
        Spi::run("CREATE TABLE widgets4 (id text primary key, label text default '')").unwrap();
        Spi::run("SELECT init('widgets4')").unwrap();

        let tombstone_version = || {
            Spi::get_one::<i64>(
                "SELECT col_version FROM widgets4_meta
                 WHERE pk = pk_encode('[\"w1\"]'::jsonb) AND col_name = '__TOMBSTONE__'",
            )
            .unwrap()
        };

        Spi::run("INSERT INTO widgets4 (id, label) VALUES ('w1', 'aaa')").unwrap();
        assert_eq!(tombstone_version(), Some(1));

        Spi::run("DELETE FROM widgets4 WHERE id = 'w1'").unwrap();
        assert_eq!(tombstone_version(), Some(2));

        Spi::run("INSERT INTO widgets4 (id, label) VALUES ('w1', 'bbb')").unwrap();
        assert_eq!(tombstone_version(), Some(3));

        Spi::run("DELETE FROM widgets4 WHERE id = 'w1'").unwrap();
        assert_eq!(tombstone_version(), Some(4));

        Spi::run("INSERT INTO widgets4 (id, label) VALUES ('w1', 'ccc')").unwrap();
        assert_eq!(tombstone_version(), Some(5));

        let exists =
            Spi::get_one::<bool>("SELECT EXISTS(SELECT 1 FROM widgets4 WHERE id = 'w1')").unwrap();
        assert_eq!(exists, Some(true));
    }

    #[pg_test]
    fn test_payload_decode_rejects_unknown_schema_hash() {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(b"CLSY");
        bytes.push(1); // version
        bytes.extend_from_slice(&[0, 0, 0]); // libversion
        bytes.extend_from_slice(&0u32.to_be_bytes()); // expanded_size (uncompressed)
        bytes.extend_from_slice(&9u16.to_be_bytes()); // ncols
        bytes.extend_from_slice(&0u32.to_be_bytes()); // nrows
        bytes.extend_from_slice(&0xDEAD_BEEFu64.to_be_bytes()); // unregistered schema_hash
        bytes.extend_from_slice(&[0u8; 6]); // reserved

        let result = crate::payload_decode(bytes);
        assert!(result.is_err());
    }

    #[pg_test]
    fn test_disable_mutes_capture_without_dropping_triggers() {
        Spi::run("CREATE TABLE toggled (id text primary key, note text default '')").unwrap();
        Spi::run("SELECT init('toggled')").unwrap();
        Spi::run("SELECT disable('toggled')").unwrap();
        Spi::run("INSERT INTO toggled (id, note) VALUES ('t1', 'hi')").unwrap();

        let count =
            Spi::get_one::<i64>("SELECT count(*) FROM toggled_meta WHERE pk = pk_encode('[\"t1\"]'::jsonb)")
                .unwrap();
        assert_eq!(count, Some(0));

        Spi::run("SELECT enable('toggled')").unwrap();
        Spi::run("INSERT INTO toggled (id, note) VALUES ('t2', 'hi')").unwrap();
        let count2 =
            Spi::get_one::<i64>("SELECT count(*) FROM toggled_meta WHERE pk = pk_encode('[\"t2\"]'::jsonb)")
                .unwrap();
        assert!(count2.unwrap_or(0) > 0);
    }
}

#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {}

    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec![]
    }
}

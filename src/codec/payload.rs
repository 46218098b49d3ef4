//! Payload codec (spec §4.6): a framed, optionally compressed batch of
//! change rows exchanged between replicas.
//!
//! Header is a fixed 32 bytes, big-endian:
//!
//! | Offset | Size | Field         |
//! |--------|------|---------------|
//! | 0      | 4    | signature `CLSY` |
//! | 4      | 1    | version (1)   |
//! | 5      | 3    | libversion (major, minor, patch) |
//! | 8      | 4    | expanded_size (0 = body uncompressed) |
//! | 12     | 2    | ncols (always 9) |
//! | 14     | 4    | nrows          |
//! | 18     | 8    | schema_hash    |
//! | 26     | 6    | reserved (zero) |
//!
//! The body is `nrows * ncols` type-tagged values framed identically to the
//! PK codec (`super::pk`), with no extra per-row header — the row/column
//! shape is already known from `nrows`/`ncols`.

use crate::codec::pk::{decode_one, encode_one_value};
use crate::error::{CloudSyncError, Result};
use crate::types::{ChangeRow, Value};

pub const SIGNATURE: [u8; 4] = *b"CLSY";
pub const WIRE_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 32;
pub const NCOLS: u16 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u8,
    pub libversion: [u8; 3],
    /// Decompressed body length; 0 means the body was stored uncompressed.
    pub expanded_size: u32,
    pub ncols: u16,
    pub nrows: u32,
    pub schema_hash: u64,
}

impl PayloadHeader {
    pub fn is_compressed(&self) -> bool {
        self.expanded_size != 0
    }

    fn write(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..4].copy_from_slice(&SIGNATURE);
        out[4] = self.version;
        out[5..8].copy_from_slice(&self.libversion);
        out[8..12].copy_from_slice(&self.expanded_size.to_be_bytes());
        out[12..14].copy_from_slice(&self.ncols.to_be_bytes());
        out[14..18].copy_from_slice(&self.nrows.to_be_bytes());
        out[18..26].copy_from_slice(&self.schema_hash.to_be_bytes());
        out[26..32].copy_from_slice(&[0u8; 6]);
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CloudSyncError::misuse("payload shorter than 32-byte header"));
        }
        if bytes[0..4] != SIGNATURE {
            return Err(CloudSyncError::misuse("payload signature mismatch"));
        }
        Ok(Self {
            version: bytes[4],
            libversion: [bytes[5], bytes[6], bytes[7]],
            expanded_size: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            ncols: u16::from_be_bytes(bytes[12..14].try_into().unwrap()),
            nrows: u32::from_be_bytes(bytes[14..18].try_into().unwrap()),
            schema_hash: u64::from_be_bytes(bytes[18..26].try_into().unwrap()),
        })
    }
}

/// One of the 9 fixed columns of a change row, in wire order.
fn row_to_values(row: &ChangeRow) -> [Value; 9] {
    [
        Value::Text(row.tbl.clone()),
        Value::Blob(row.pk.clone()),
        match &row.col_name {
            Some(name) => Value::Text(name.clone()),
            None => Value::Null,
        },
        row.col_value.clone(),
        Value::Integer(row.col_version),
        Value::Integer(row.db_version),
        Value::Blob(row.site_id.to_vec()),
        Value::Integer(row.causal_length),
        Value::Integer(row.seq as i64),
    ]
}

/// Accumulator behind the `payload_encode` SQL aggregate (spec §4.6):
/// `accumulate()` is called once per row inside the aggregate's state
/// transition function; `finish()` is its final function.
#[derive(Debug, Default)]
pub struct PayloadEncoder {
    body: Vec<u8>,
    nrows: u32,
}

impl PayloadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, row: &ChangeRow) {
        for value in row_to_values(row) {
            encode_one_value(&mut self.body, &value);
        }
        self.nrows += 1;
    }

    /// Finalize into a complete wire payload. Compression is applied iff
    /// the compressed body is strictly smaller than the raw body; the
    /// header's `expanded_size` records the raw length only in that case
    /// (spec §4.6).
    pub fn finish(self, schema_hash: u64, libversion: [u8; 3]) -> Result<Vec<u8>> {
        let raw_len = self.body.len();
        let compressed =
            zstd::bulk::compress(&self.body, 0).map_err(|e| CloudSyncError::storage(e.to_string()))?;

        let (expanded_size, out_body) = if compressed.len() < raw_len {
            (raw_len as u32, compressed)
        } else {
            (0u32, self.body)
        };

        let header = PayloadHeader {
            version: WIRE_VERSION,
            libversion,
            expanded_size,
            ncols: NCOLS,
            nrows: self.nrows,
            schema_hash,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + out_body.len());
        let mut header_bytes = [0u8; HEADER_LEN];
        header.write(&mut header_bytes);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&out_body);
        Ok(out)
    }
}

/// The three lifecycle phases a per-payload apply callback observes for
/// each row (spec §4.6). `will_apply` may veto; `did_apply` reports the
/// outcome; `cleanup` always runs once per row regardless of outcome.
pub enum ApplyPhase<'a> {
    WillApply(&'a ChangeRow),
    DidApply {
        row: &'a ChangeRow,
        applied: bool,
    },
    Cleanup(&'a ChangeRow),
}

/// Returned by the `will_apply` phase: `Proceed` lets the merge engine run,
/// `Veto` rejects the row as a policy error without aborting the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Proceed,
    Veto,
}

/// Decode a wire payload, verifying signature and schema-hash membership,
/// then stream rows to `on_row`. `known_schema_hashes` is the local
/// `schema_versions` registry (spec §4.8); payloads whose `schema_hash`
/// isn't present are rejected wholesale, without side effects.
///
/// `on_row` receives `ApplyPhase::WillApply` first for veto, then is
/// expected to attempt the merge and call back with `DidApply`/`Cleanup`.
/// Per-row failures (a `Policy` veto) do not abort the rest of the batch —
/// only a structural failure (decode error) does.
pub fn decode_payload(
    bytes: &[u8],
    known_schema_hashes: &dyn Fn(u64) -> bool,
    mut will_apply: impl FnMut(&ChangeRow) -> ApplyDecision,
    mut did_apply: impl FnMut(&ChangeRow, std::result::Result<(), &CloudSyncError>),
) -> Result<u32> {
    let header = PayloadHeader::parse(bytes)?;
    if header.ncols != NCOLS {
        return Err(CloudSyncError::misuse(format!(
            "unexpected column count {} (expected {})",
            header.ncols, NCOLS
        )));
    }
    if !known_schema_hashes(header.schema_hash) {
        return Err(CloudSyncError::misuse(format!(
            "payload schema_hash {:#018x} is not in the local schema registry",
            header.schema_hash
        )));
    }

    let raw_body = &bytes[HEADER_LEN..];
    let body: std::borrow::Cow<[u8]> = if header.is_compressed() {
        std::borrow::Cow::Owned(
            zstd::bulk::decompress(raw_body, header.expanded_size as usize)
                .map_err(|e| CloudSyncError::storage(e.to_string()))?,
        )
    } else {
        std::borrow::Cow::Borrowed(raw_body)
    };

    let mut pos = 0usize;
    let mut applied = 0u32;
    for _ in 0..header.nrows {
        let row = decode_change_row(&body, &mut pos)?;
        match will_apply(&row) {
            ApplyDecision::Veto => {
                let err = CloudSyncError::Policy {
                    table: row.tbl.clone(),
                    pk_hex: hex_encode(&row.pk),
                    reason: "vetoed by row-apply callback".to_string(),
                };
                did_apply(&row, Err(&err));
            }
            ApplyDecision::Proceed => {
                did_apply(&row, Ok(()));
                applied += 1;
            }
        }
    }
    Ok(applied)
}

fn decode_change_row(body: &[u8], pos: &mut usize) -> Result<ChangeRow> {
    let tbl = decode_one(body, pos, 0)?.to_owned_value();
    let pk = decode_one(body, pos, 1)?.to_owned_value();
    let col_name = decode_one(body, pos, 2)?.to_owned_value();
    let col_value = decode_one(body, pos, 3)?.to_owned_value();
    let col_version = decode_one(body, pos, 4)?.to_owned_value();
    let db_version = decode_one(body, pos, 5)?.to_owned_value();
    let site_id = decode_one(body, pos, 6)?.to_owned_value();
    let causal_length = decode_one(body, pos, 7)?.to_owned_value();
    let seq = decode_one(body, pos, 8)?.to_owned_value();

    let tbl = match tbl {
        Value::Text(s) => s,
        _ => return Err(CloudSyncError::storage("tbl column is not TEXT")),
    };
    let pk = match pk {
        Value::Blob(b) => b,
        _ => return Err(CloudSyncError::storage("pk column is not BLOB")),
    };
    let col_name = match col_name {
        Value::Null => None,
        Value::Text(s) => Some(s),
        _ => return Err(CloudSyncError::storage("col_name column is not TEXT/NULL")),
    };
    let col_version = match col_version {
        Value::Integer(i) => i,
        _ => return Err(CloudSyncError::storage("col_version column is not INTEGER")),
    };
    let db_version = match db_version {
        Value::Integer(i) => i,
        _ => return Err(CloudSyncError::storage("db_version column is not INTEGER")),
    };
    let site_id_bytes = match site_id {
        Value::Blob(b) if b.len() == 16 => b,
        _ => return Err(CloudSyncError::storage("site_id column is not a 16-byte BLOB")),
    };
    let mut site_id = [0u8; 16];
    site_id.copy_from_slice(&site_id_bytes);
    let causal_length = match causal_length {
        Value::Integer(i) => i,
        _ => return Err(CloudSyncError::storage("cl column is not INTEGER")),
    };
    let seq = match seq {
        Value::Integer(i) => i as i32,
        _ => return Err(CloudSyncError::storage("seq column is not INTEGER")),
    };

    Ok(ChangeRow {
        tbl,
        pk,
        col_name,
        col_value,
        col_version,
        db_version,
        site_id,
        causal_length,
        seq,
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(n: i64) -> ChangeRow {
        ChangeRow {
            tbl: "customers".to_string(),
            pk: vec![1, 2, 3],
            col_name: Some("age".to_string()),
            col_value: Value::Integer(n),
            col_version: n,
            db_version: n,
            site_id: [7u8; 16],
            causal_length: 1,
            seq: n as i32,
        }
    }

    #[test]
    fn round_trips_small_batch() {
        let mut enc = PayloadEncoder::new();
        for i in 0..5 {
            enc.accumulate(&sample_row(i));
        }
        let bytes = enc.finish(42, [1, 0, 0]).unwrap();

        let mut seen = Vec::new();
        let applied = decode_payload(
            &bytes,
            &|h| h == 42,
            |_row| ApplyDecision::Proceed,
            |row, res| {
                assert!(res.is_ok());
                seen.push(row.col_version);
            },
        )
        .unwrap();

        assert_eq!(applied, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejects_unknown_schema_hash() {
        let mut enc = PayloadEncoder::new();
        enc.accumulate(&sample_row(0));
        let bytes = enc.finish(99, [1, 0, 0]).unwrap();

        let err = decode_payload(&bytes, &|h| h != 99, |_| ApplyDecision::Proceed, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, CloudSyncError::Misuse(_)));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(b"NOPE");
        let err = decode_payload(&bytes, &|_| true, |_| ApplyDecision::Proceed, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, CloudSyncError::Misuse(_)));
    }

    #[test]
    fn veto_does_not_abort_batch() {
        let mut enc = PayloadEncoder::new();
        for i in 0..3 {
            enc.accumulate(&sample_row(i));
        }
        let bytes = enc.finish(1, [1, 0, 0]).unwrap();

        let mut vetoed = 0;
        let applied = decode_payload(
            &bytes,
            &|_| true,
            |row| {
                if row.col_version == 1 {
                    ApplyDecision::Veto
                } else {
                    ApplyDecision::Proceed
                }
            },
            |_, res| {
                if res.is_err() {
                    vetoed += 1;
                }
            },
        )
        .unwrap();

        assert_eq!(applied, 2);
        assert_eq!(vetoed, 1);
    }

    #[test]
    fn large_batch_compresses() {
        let mut enc = PayloadEncoder::new();
        for i in 0..2000 {
            enc.accumulate(&sample_row(i % 7));
        }
        let bytes = enc.finish(1, [1, 0, 0]).unwrap();
        let header = PayloadHeader::parse(&bytes).unwrap();
        assert!(header.is_compressed());
    }
}

//! Primary-key codec (spec §4.1).
//!
//! Encodes an ordered list of 1–127 typed values into a self-describing,
//! order-independent byte string, and decodes it back through a
//! callback-driven visitor so the decoder never has to materialize an
//! intermediate row struct. The payload codec (`super::payload`) reuses
//! this exact framing for its per-row column values — the wire body is
//! "framed identically to the PK codec" (spec §4.6).

use crate::error::{CloudSyncError, Result};
use crate::types::{TypeTag, Value};

pub const MAX_COLUMNS: usize = 127;

/// Encode a composite primary key. Fails if there are more than 127
/// columns or if any value is NULL — a PK cannot contain NULL (spec §4.1).
pub fn encode_pk(values: &[Value]) -> Result<Vec<u8>> {
    if values.iter().any(|v| matches!(v, Value::Null)) {
        return Err(CloudSyncError::misuse(
            "primary key values must not be NULL",
        ));
    }
    encode_values(values)
}

/// Encode an arbitrary list of typed values (NULL allowed) using the same
/// self-describing framing as `encode_pk`. Used directly by the payload
/// codec for `col_value` framing.
pub fn encode_values(values: &[Value]) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Err(CloudSyncError::misuse("value list must not be empty"));
    }
    if values.len() > MAX_COLUMNS {
        return Err(CloudSyncError::misuse(format!(
            "value list has {} columns, exceeds the {} column limit",
            values.len(),
            MAX_COLUMNS
        )));
    }

    let mut out = Vec::with_capacity(1 + values.len() * 9);
    out.push(values.len() as u8);
    for value in values {
        encode_one(&mut out, value);
    }
    Ok(out)
}

fn encode_one(out: &mut Vec<u8>, value: &Value) {
    out.push(value.type_tag() as u8);
    match value {
        Value::Null => {}
        Value::Integer(i) => out.extend_from_slice(&i.to_be_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        Value::Text(s) => {
            write_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            write_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or_else(|| {
            CloudSyncError::storage("truncated varint in encoded value stream")
        })?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(CloudSyncError::storage("varint too long"));
        }
    }
    Ok(result)
}

/// A borrowed decoded value, handed to the visitor callback. Carries the
/// raw numeric/byte fields the spec names (`ival`, `dval`, `ptr`/`len`)
/// rather than a single tagged enum, so callers can read only what they
/// need without an extra match.
#[derive(Debug, Clone, Copy)]
pub struct DecodedValue<'a> {
    pub index: usize,
    pub type_tag: TypeTag,
    pub ival: i64,
    pub dval: f64,
    pub bytes: Option<&'a [u8]>,
}

impl<'a> DecodedValue<'a> {
    pub fn to_owned_value(&self) -> Value {
        match self.type_tag {
            TypeTag::Null => Value::Null,
            TypeTag::Integer => Value::Integer(self.ival),
            TypeTag::Float => Value::Float(self.dval),
            TypeTag::Text => Value::Text(
                String::from_utf8_lossy(self.bytes.unwrap_or(&[])).into_owned(),
            ),
            TypeTag::Blob => Value::Blob(self.bytes.unwrap_or(&[]).to_vec()),
        }
    }
}

/// Decode `bytes` (as produced by `encode_values`/`encode_pk`), invoking
/// `visit` once per column in order. Any `Err` returned by `visit` aborts
/// decoding immediately and propagates to the caller (spec §4.1).
pub fn decode_values<'a>(
    bytes: &'a [u8],
    mut visit: impl FnMut(DecodedValue<'a>) -> Result<()>,
) -> Result<()> {
    let mut pos = 0usize;
    let count = *bytes
        .first()
        .ok_or_else(|| CloudSyncError::storage("empty encoded value buffer"))?
        as usize;
    pos += 1;

    for index in 0..count {
        let decoded = decode_one(bytes, &mut pos, index)?;
        visit(decoded)?;
    }
    Ok(())
}

/// Decode a single type-tagged value starting at `*pos`, advancing `*pos`
/// past it. This is the primitive both `decode_values` (PK codec, which
/// prefixes a column-count header byte) and the payload codec (which knows
/// its column count from the header's `ncols`/`nrows` and has no per-row
/// count byte) build on.
pub fn decode_one<'a>(bytes: &'a [u8], pos: &mut usize, index: usize) -> Result<DecodedValue<'a>> {
    let tag_byte = *bytes
        .get(*pos)
        .ok_or_else(|| CloudSyncError::storage("truncated type tag"))?;
    *pos += 1;
    let type_tag = TypeTag::from_byte(tag_byte)
        .ok_or_else(|| CloudSyncError::storage(format!("unknown type tag {tag_byte}")))?;

    Ok(match type_tag {
        TypeTag::Null => DecodedValue {
            index,
            type_tag,
            ival: 0,
            dval: 0.0,
            bytes: None,
        },
        TypeTag::Integer => {
            let raw: [u8; 8] = bytes
                .get(*pos..*pos + 8)
                .ok_or_else(|| CloudSyncError::storage("truncated integer"))?
                .try_into()
                .unwrap();
            *pos += 8;
            DecodedValue {
                index,
                type_tag,
                ival: i64::from_be_bytes(raw),
                dval: 0.0,
                bytes: None,
            }
        }
        TypeTag::Float => {
            let raw: [u8; 8] = bytes
                .get(*pos..*pos + 8)
                .ok_or_else(|| CloudSyncError::storage("truncated float"))?
                .try_into()
                .unwrap();
            *pos += 8;
            DecodedValue {
                index,
                type_tag,
                ival: 0,
                dval: f64::from_bits(u64::from_be_bytes(raw)),
                bytes: None,
            }
        }
        TypeTag::Text | TypeTag::Blob => {
            let len = read_varint(bytes, pos)? as usize;
            let slice = bytes
                .get(*pos..*pos + len)
                .ok_or_else(|| CloudSyncError::storage("truncated text/blob payload"))?;
            *pos += len;
            DecodedValue {
                index,
                type_tag,
                ival: 0,
                dval: 0.0,
                bytes: Some(slice),
            }
        }
    })
}

pub fn encode_one_value(out: &mut Vec<u8>, value: &Value) {
    encode_one(out, value)
}

/// Decode `bytes` and bind each value as a positional (`$1.. $N`) argument
/// for a prepared SQL statement, returning the `(type oid, datum)` pairs
/// pgrx's `Spi` API expects. The caller passes this straight to
/// `Spi::connect(|c| c.update(sql, None, &args))`.
pub fn decode_bind_into_statement(
    bytes: &[u8],
) -> Result<Vec<(pgrx::PgOid, Option<pgrx::datum::Datum<'static>>)>> {
    use pgrx::pg_sys::BuiltinOid;
    use pgrx::IntoDatum;

    let mut args = Vec::new();
    decode_values(bytes, |v| {
        let (oid, datum) = match v.type_tag {
            TypeTag::Null => (BuiltinOid::TEXTOID, None),
            TypeTag::Integer => (BuiltinOid::INT8OID, v.ival.into_datum()),
            TypeTag::Float => (BuiltinOid::FLOAT8OID, v.dval.into_datum()),
            TypeTag::Text => {
                let s = String::from_utf8_lossy(v.bytes.unwrap_or(&[])).into_owned();
                (BuiltinOid::TEXTOID, s.into_datum())
            }
            TypeTag::Blob => {
                let b = v.bytes.unwrap_or(&[]).to_vec();
                (BuiltinOid::BYTEAOID, b.into_datum())
            }
        };
        args.push((pgrx::PgOid::BuiltIn(oid), datum));
        Ok(())
    })?;
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        decode_values(bytes, |v| {
            out.push(v.to_owned_value());
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn round_trips_mixed_types() {
        let values = vec![
            Value::Integer(-7),
            Value::Text("surname1".to_string()),
            Value::Float(3.5),
            Value::Blob(vec![1, 2, 3, 0, 255]),
        ];
        let bytes = encode_values(&values).unwrap();
        assert_eq!(decode_all(&bytes), values);
    }

    #[test]
    fn encode_is_deterministic() {
        let values = vec![Value::Text("name1".into()), Value::Integer(10)];
        assert_eq!(
            encode_values(&values).unwrap(),
            encode_values(&values).unwrap()
        );
    }

    #[test]
    fn pk_rejects_null() {
        let err = encode_pk(&[Value::Null]).unwrap_err();
        assert!(matches!(err, CloudSyncError::Misuse(_)));
    }

    #[test]
    fn rejects_too_many_columns() {
        let values = vec![Value::Integer(1); MAX_COLUMNS + 1];
        assert!(encode_values(&values).is_err());
    }

    #[test]
    fn callback_abort_propagates() {
        let bytes = encode_values(&[Value::Integer(1), Value::Integer(2)]).unwrap();
        let mut seen = 0;
        let err = decode_values(&bytes, |_| {
            seen += 1;
            Err(CloudSyncError::misuse("stop"))
        })
        .unwrap_err();
        assert_eq!(seen, 1);
        assert!(matches!(err, CloudSyncError::Misuse(_)));
    }

    #[test]
    fn empty_text_and_blob_round_trip() {
        let values = vec![Value::Text(String::new()), Value::Blob(vec![])];
        let bytes = encode_values(&values).unwrap();
        assert_eq!(decode_all(&bytes), values);
    }
}

#![allow(dead_code)]

use std::cmp::Ordering;

/// Reserved `col_name` sentinel marking a row's existence/tombstone entry (spec §3).
pub const TOMBSTONE: &str = "__TOMBSTONE__";

/// Per-table merge algorithm, chosen once at `init()` and persisted into
/// `table_settings`. CLS is the default; DWS/AWS invert the add/delete
/// tiebreak; GOS rejects UPDATE/DELETE entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algo {
    /// Causal-Length Set: default. Column-level LWW, tombstone causal length
    /// decides existence.
    Cls,
    /// Delete-Wins Set: concurrent add/delete resolves to delete.
    Dws,
    /// Add-Wins Set: concurrent add/delete resolves to add.
    Aws,
    /// Grow-Only Set: INSERT only, UPDATE/DELETE rejected by trigger.
    Gos,
}

impl Algo {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CLS" => Some(Self::Cls),
            "DWS" => Some(Self::Dws),
            "AWS" => Some(Self::Aws),
            "GOS" => Some(Self::Gos),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cls => "CLS",
            Self::Dws => "DWS",
            Self::Aws => "AWS",
            Self::Gos => "GOS",
        }
    }

    /// DWS/AWS are structurally CLS with the add/delete tiebreak inverted (spec §3).
    pub fn delete_wins_on_concurrent_add_delete(&self) -> bool {
        matches!(self, Self::Cls | Self::Dws)
    }

    pub fn is_grow_only(&self) -> bool {
        matches!(self, Self::Gos)
    }
}

/// A typed primary-key / column value, in the total order NULL < INTEGER <
/// FLOAT < TEXT < BLOB (spec §4.4 "Total value order"). This is the owned
/// variant used once a value has been materialized out of the wire codec's
/// zero-copy `ValueRef`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Type tag byte used by both the PK codec (§4.1) and the payload codec
/// (§4.6) — the payload body is "framed identically to the PK codec".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
}

impl TypeTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Null),
            1 => Some(Self::Integer),
            2 => Some(Self::Float),
            3 => Some(Self::Text),
            4 => Some(Self::Blob),
            _ => None,
        }
    }
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Null => TypeTag::Null,
            Self::Integer(_) => TypeTag::Integer,
            Self::Float(_) => TypeTag::Float,
            Self::Text(_) => TypeTag::Text,
            Self::Blob(_) => TypeTag::Blob,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order: NULL < INTEGER < FLOAT < TEXT < BLOB by type tag; within a
/// type, native ordering (numeric for numbers, byte-lexicographic with
/// length tiebreak for text/blob). Used both for result ordering and for
/// the merge engine's tie-break comparison (spec §4.4).
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let (lhs_tag, rhs_tag) = (self.type_tag() as u8, other.type_tag() as u8);
        if lhs_tag != rhs_tag {
            return lhs_tag.cmp(&rhs_tag);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Text(a), Value::Text(b)) => {
                a.as_bytes().cmp(b.as_bytes()).then(a.len().cmp(&b.len()))
            }
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b).then(a.len().cmp(&b.len())),
            _ => unreachable!("type tags matched above"),
        }
    }
}

/// A fully materialized row of shadow metadata, as it arrives from the wire
/// decoder into the merge engine (spec §4.4 `merge_insert` entry point).
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub tbl: String,
    pub pk: Vec<u8>,
    /// `None` represents the `__TOMBSTONE__` sentinel; `Some(name)` a column.
    pub col_name: Option<String>,
    pub col_value: Value,
    pub col_version: i64,
    pub db_version: i64,
    /// 16-byte site identifier of the *originating* replica (not yet
    /// resolved through the local dictionary — that happens in `settings`).
    pub site_id: [u8; 16],
    /// Causal length of the row's tombstone at time of emission; used by
    /// the merge engine to decide whether a column update also carries a
    /// resurrection (spec §4.4 step 5).
    pub causal_length: i64,
    pub seq: i32,
}

impl ChangeRow {
    pub fn is_tombstone(&self) -> bool {
        self.col_name.is_none()
    }

    pub fn col_name_or_sentinel(&self) -> &str {
        self.col_name.as_deref().unwrap_or(TOMBSTONE)
    }
}

/// `(col_version, seq, site_id)` winner clock recorded in the shadow
/// relation after a merge decision (spec §4.4 "Winner clock recording").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinnerClock {
    pub col_version: i64,
    pub db_version: i64,
    pub seq: i32,
    pub site_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_respects_type_tags() {
        assert!(Value::Null < Value::Integer(i64::MIN));
        assert!(Value::Integer(1) < Value::Float(-1.0));
        assert!(Value::Float(f64::MAX) < Value::Text(String::new()));
        assert!(Value::Text("zzz".into()) < Value::Blob(vec![]));
    }

    #[test]
    fn text_order_is_byte_lexicographic_with_length_tiebreak() {
        assert!(Value::Text("ab".into()) < Value::Text("abc".into()));
        assert!(Value::Text("ab".into()) < Value::Text("b".into()));
    }

    #[test]
    fn algo_round_trips_through_str() {
        for algo in [Algo::Cls, Algo::Dws, Algo::Aws, Algo::Gos] {
            assert_eq!(Algo::from_str(algo.as_str()), Some(algo));
        }
        assert_eq!(Algo::from_str("bogus"), None);
    }
}

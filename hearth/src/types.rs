use std::collections::BTreeMap;

use cid::Cid;
use libipld::Ipld;
use serde_json::Value;

use crate::error::Error;

/// The clock head: the set of current leaf events, canonically sorted.
pub type ClockHead = Vec<Cid>;

/// One document write: a value to put under an id, or a tombstone when
/// `value` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocUpdate {
    pub id: String,
    pub value: Option<Value>,
    /// The event that introduced this update, filled in on reads.
    pub clock: Option<Cid>,
}

impl DocUpdate {
    pub fn put(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
            clock: None,
        }
    }

    pub fn del(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
            clock: None,
        }
    }

    pub fn is_del(&self) -> bool {
        self.value.is_none()
    }
}

/// A resolved document: its current value and the event that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocValue {
    pub value: Value,
    pub event: Cid,
}

/// Result of a write or read: where the clock stood.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrdtMeta {
    pub head: ClockHead,
}

/// A page of changes since some head.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes {
    pub updates: Vec<DocUpdate>,
    pub head: ClockHead,
}

/// Options for [`changes`](crate::Crdt::changes).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangesOpts {
    /// Cap on the number of updates returned.
    pub limit: Option<usize>,
    /// Skip events whose blocks cannot be fetched instead of failing,
    /// yielding a partial but usable delta.
    pub dirty: bool,
}

/// Strips reserved (underscore-prefixed) top-level fields from a document
/// value before it is stored. Outer layers own those fields; persisting
/// them here would let stale copies shadow the live ones on read.
pub(crate) fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, v)| (key.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub(crate) fn json_to_ipld(value: &Value) -> Result<Ipld, Error> {
    Ok(match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else if let Some(f) = n.as_f64() {
                Ipld::Float(f)
            } else {
                return Err(Error::Encoding(format!("unrepresentable number {n}")));
            }
        }
        Value::String(s) => Ipld::String(s.clone()),
        Value::Array(items) => Ipld::List(
            items
                .iter()
                .map(json_to_ipld)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_ipld(v)?);
            }
            Ipld::Map(out)
        }
    })
}

pub(crate) fn ipld_to_json(value: &Ipld) -> Result<Value, Error> {
    Ok(match value {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => {
            let i = i64::try_from(*i)
                .map_err(|_| Error::Encoding(format!("integer out of range: {i}")))?;
            Value::Number(i.into())
        }
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| Error::Encoding(format!("unrepresentable float {f}")))?,
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::List(items) => Value::Array(
            items
                .iter()
                .map(ipld_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Ipld::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), ipld_to_json(v)?);
            }
            Value::Object(out)
        }
        Ipld::Bytes(_) | Ipld::Link(_) => {
            return Err(Error::Encoding("document values are json only".into()))
        }
    })
}

/// Sorts a head into its canonical order, by CID string.
pub(crate) fn sort_head(mut head: ClockHead) -> ClockHead {
    head.sort_by_key(|cid| cid.to_string());
    head.dedup();
    head
}

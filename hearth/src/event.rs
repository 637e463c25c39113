use std::collections::BTreeMap;

use cid::Cid;
use hearth_store::{decode_cbor, encode_cbor, Block};
use libipld::Ipld;

use crate::error::Error;

/// Document id of the synthetic bootstrap event. Filtered out of every
/// read surface.
pub const GENESIS_DOC_ID: &str = "_genesis";

/// One write recorded inside an event. `value` links to the document
/// block; a tombstone has no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOp {
    pub key: String,
    pub value: Option<Cid>,
}

/// The payload of a clock event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    Put(PutOp),
    Batch(Vec<PutOp>),
}

impl EventData {
    /// The contained operations, newest-intent order preserved.
    pub fn ops(&self) -> &[PutOp] {
        match self {
            EventData::Put(op) => std::slice::from_ref(op),
            EventData::Batch(ops) => ops,
        }
    }
}

/// A decoded clock event: causal parents plus the write payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub parents: Vec<Cid>,
    pub data: EventData,
}

fn encode_op(op: &PutOp) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert("key".to_string(), Ipld::String(op.key.clone()));
    map.insert(
        "value".to_string(),
        match op.value {
            Some(cid) => Ipld::Link(cid),
            None => Ipld::Null,
        },
    );
    Ipld::Map(map)
}

fn decode_op(value: &Ipld) -> Result<PutOp, Error> {
    let Ipld::Map(map) = value else {
        return Err(Error::Encoding("event op is not a map".into()));
    };
    let key = match map.get("key") {
        Some(Ipld::String(key)) => key.clone(),
        _ => return Err(Error::Encoding("event op missing key".into())),
    };
    let value = match map.get("value") {
        Some(Ipld::Link(cid)) => Some(*cid),
        Some(Ipld::Null) | None => None,
        _ => return Err(Error::Encoding("event op value is not a link".into())),
    };
    Ok(PutOp { key, value })
}

/// Encodes an event as a dag-cbor block. Encoding is canonical, so two
/// parties producing the same event agree on its CID.
pub fn encode_event(parents: &[Cid], data: &EventData) -> Result<Block, Error> {
    let payload = match data {
        EventData::Put(op) => {
            let Ipld::Map(mut map) = encode_op(op) else {
                unreachable!()
            };
            map.insert("type".to_string(), Ipld::String("put".into()));
            Ipld::Map(map)
        }
        EventData::Batch(ops) => {
            let mut map = BTreeMap::new();
            map.insert("type".to_string(), Ipld::String("batch".into()));
            map.insert(
                "updates".to_string(),
                Ipld::List(ops.iter().map(encode_op).collect()),
            );
            Ipld::Map(map)
        }
    };
    let mut event = BTreeMap::new();
    event.insert("data".to_string(), payload);
    event.insert(
        "parents".to_string(),
        Ipld::List(parents.iter().copied().map(Ipld::Link).collect()),
    );
    Ok(encode_cbor(&Ipld::Map(event))?)
}

pub fn decode_event(bytes: &[u8]) -> Result<Event, Error> {
    let Ipld::Map(event) = decode_cbor(bytes)? else {
        return Err(Error::Encoding("event is not a map".into()));
    };
    let parents = match event.get("parents") {
        Some(Ipld::List(items)) => items
            .iter()
            .map(|item| match item {
                Ipld::Link(cid) => Ok(*cid),
                _ => Err(Error::Encoding("event parent is not a link".into())),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(Error::Encoding("event missing parents".into())),
    };
    let Some(Ipld::Map(data)) = event.get("data") else {
        return Err(Error::Encoding("event missing data".into()));
    };
    let data = match data.get("type") {
        Some(Ipld::String(kind)) if kind == "put" => {
            EventData::Put(decode_op(&Ipld::Map(data.clone()))?)
        }
        Some(Ipld::String(kind)) if kind == "batch" => match data.get("updates") {
            Some(Ipld::List(items)) => EventData::Batch(
                items.iter().map(decode_op).collect::<Result<Vec<_>, _>>()?,
            ),
            _ => return Err(Error::Encoding("batch event missing updates".into())),
        },
        _ => return Err(Error::Encoding("unknown event type".into())),
    };
    Ok(Event { parents, data })
}

/// The parentless bootstrap event every ledger starts from.
///
/// Its content is fixed, so independent parties writing to an empty ledger
/// produce the same genesis CID and their histories merge instead of
/// forking at the root.
pub fn genesis_event() -> Result<(Block, Block), Error> {
    let doc = encode_cbor(&Ipld::Map(BTreeMap::new()))?;
    let event = encode_event(
        &[],
        &EventData::Put(PutOp {
            key: GENESIS_DOC_ID.to_string(),
            value: Some(*doc.cid()),
        }),
    )?;
    Ok((doc, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_event_round_trip() {
        let (doc, _) = genesis_event().unwrap();
        let data = EventData::Put(PutOp {
            key: "doc-1".into(),
            value: Some(*doc.cid()),
        });
        let block = encode_event(&[], &data).unwrap();
        let event = decode_event(block.data()).unwrap();
        assert!(event.parents.is_empty());
        assert_eq!(event.data, data);
    }

    #[test]
    fn batch_event_round_trip() {
        let (doc, genesis) = genesis_event().unwrap();
        let data = EventData::Batch(vec![
            PutOp {
                key: "a".into(),
                value: Some(*doc.cid()),
            },
            PutOp {
                key: "b".into(),
                value: None,
            },
        ]);
        let block = encode_event(&[*genesis.cid()], &data).unwrap();
        let event = decode_event(block.data()).unwrap();
        assert_eq!(event.parents, vec![*genesis.cid()]);
        assert_eq!(event.data.ops().len(), 2);
        assert!(event.data.ops()[1].value.is_none());
    }

    #[test]
    fn genesis_is_deterministic() {
        let (_, a) = genesis_event().unwrap();
        let (_, b) = genesis_event().unwrap();
        assert_eq!(a.cid(), b.cid());
    }
}

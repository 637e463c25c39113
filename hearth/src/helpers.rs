use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use cid::Cid;
use hearth_store::{encode_cbor, BlockFetcher, CarTransaction, CompactionFetcher};

use crate::clock::{advance, EventFetcher};
use crate::error::Error;
use crate::event::{encode_event, genesis_event, EventData, PutOp, GENESIS_DOC_ID};
use crate::types::{
    ipld_to_json, json_to_ipld, sort_head, ChangesOpts, ClockHead, DocUpdate, DocValue,
};

/// Stages one bulk write into `tx`: document blocks, the event recording
/// them, and on an empty ledger the genesis event first. Returns the head
/// after folding the new event in.
pub(crate) async fn apply_bulk_update(
    tx: &CarTransaction,
    head: &[Cid],
    updates: &[DocUpdate],
) -> Result<ClockHead, Error> {
    let mut head = sort_head(head.to_vec());
    if head.is_empty() {
        let (doc, genesis) = genesis_event()?;
        head = vec![*genesis.cid()];
        tx.put(doc);
        tx.put(genesis);
    }

    let mut ops = Vec::with_capacity(updates.len());
    for update in updates {
        let value = match &update.value {
            Some(value) => {
                let block = encode_cbor(&json_to_ipld(value)?).map_err(Error::Store)?;
                let cid = *block.cid();
                tx.put(block);
                Some(cid)
            }
            None => None,
        };
        ops.push(PutOp {
            key: update.id.clone(),
            value,
        });
    }
    let data = if ops.len() == 1 {
        EventData::Put(ops.remove(0))
    } else {
        EventData::Batch(ops)
    };

    let event = encode_event(&head, &data)?;
    let event_cid = *event.cid();
    tx.put(event);

    let mut events = EventFetcher::new(tx);
    advance(&mut events, &head, event_cid).await
}

/// Linearizes the events reachable from `head`, stopping at (and
/// excluding) the events in `stop`.
///
/// The order puts every event before all of its ancestors: an event is
/// emitted only once every reachable child of it has been emitted, so an
/// op is never shadowed by one it causally supersedes, no matter how
/// unevenly deep the branches are. Concurrent events are tie-broken by
/// CID string, giving every party the same linearization of the same DAG.
async fn causal_order(
    events: &mut EventFetcher<'_>,
    head: &[Cid],
    stop: &HashSet<Cid>,
    dirty: bool,
) -> Result<Vec<Cid>, Error> {
    let mut queue: VecDeque<Cid> = sort_head(head.to_vec())
        .into_iter()
        .filter(|cid| !stop.contains(cid))
        .collect();
    let mut discovered: HashSet<Cid> = queue.iter().copied().collect();
    let mut parents: HashMap<Cid, Vec<Cid>> = HashMap::new();
    let mut pending_children: HashMap<Cid, usize> = HashMap::new();

    while let Some(cid) = queue.pop_front() {
        let event = match events.get(&cid).await {
            Ok(event) => event,
            Err(Error::MissingBlock(_)) if dirty => {
                // unreadable event: keep the node, lose its ancestry links
                parents.insert(cid, Vec::new());
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut links = Vec::new();
        for parent in &event.parents {
            if stop.contains(parent) {
                continue;
            }
            links.push(*parent);
            *pending_children.entry(*parent).or_insert(0) += 1;
            if discovered.insert(*parent) {
                queue.push_back(*parent);
            }
        }
        parents.insert(cid, links);
    }

    let mut ready: BTreeMap<String, Cid> = discovered
        .iter()
        .filter(|cid| !pending_children.contains_key(*cid))
        .map(|cid| (cid.to_string(), *cid))
        .collect();
    let mut order = Vec::with_capacity(discovered.len());
    while let Some((_, cid)) = ready.pop_first() {
        order.push(cid);
        for parent in parents.get(&cid).into_iter().flatten() {
            if let Some(count) = pending_children.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(parent.to_string(), *parent);
                }
            }
        }
    }
    Ok(order)
}

/// Resolves `key` to its current value, or `None` when absent or deleted.
///
/// Events are visited in causal order, so the first op found for the key
/// is the one no other reachable write supersedes.
pub(crate) async fn get_value(
    blocks: &dyn BlockFetcher,
    head: &[Cid],
    key: &str,
) -> Result<Option<DocValue>, Error> {
    let mut events = EventFetcher::new(blocks);
    let order = causal_order(&mut events, head, &HashSet::new(), false).await?;

    for cid in order {
        let event = events.get(&cid).await?;
        // within a batch the later op wins
        for op in event.data.ops().iter().rev() {
            if op.key != key {
                continue;
            }
            return match op.value {
                Some(value_cid) => {
                    let bytes = blocks
                        .get_block(&value_cid)
                        .await?
                        .ok_or(Error::MissingBlock(value_cid))?;
                    let value = ipld_to_json(&hearth_store::decode_cbor(&bytes)?)?;
                    Ok(Some(DocValue { value, event: cid }))
                }
                None => Ok(None),
            };
        }
    }
    Ok(None)
}

/// Collects the current update per document id, newest first in causal
/// order, walking from `head` down to (and excluding) the events in
/// `since`.
pub(crate) async fn clock_changes(
    blocks: &dyn BlockFetcher,
    head: &[Cid],
    since: &[Cid],
    opts: ChangesOpts,
) -> Result<Vec<DocUpdate>, Error> {
    let stop: HashSet<Cid> = since.iter().copied().collect();
    let mut events = EventFetcher::new(blocks);
    let order = causal_order(&mut events, head, &stop, opts.dirty).await?;
    let mut seen_keys: HashSet<String> = HashSet::new();
    let mut updates = Vec::new();

    for cid in order {
        let event = match events.get(&cid).await {
            Ok(event) => event,
            Err(Error::MissingBlock(_)) if opts.dirty => continue,
            Err(e) => return Err(e),
        };
        for op in event.data.ops().iter().rev() {
            if op.key == GENESIS_DOC_ID || !seen_keys.insert(op.key.clone()) {
                continue;
            }
            let value = match op.value {
                Some(value_cid) => match blocks.get_block(&value_cid).await? {
                    Some(bytes) => Some(ipld_to_json(&hearth_store::decode_cbor(&bytes)?)?),
                    None if opts.dirty => continue,
                    None => return Err(Error::MissingBlock(value_cid)),
                },
                None => None,
            };
            updates.push(DocUpdate {
                id: op.key.clone(),
                value,
                clock: Some(cid),
            });
            if let Some(limit) = opts.limit {
                if updates.len() >= limit {
                    return Ok(updates);
                }
            }
        }
    }
    Ok(updates)
}

/// Touches everything a compacted shard must carry: the full event
/// ancestry of `head` plus every document block those events link.
/// Superseded values stay reachable on purpose; a `changes` page scoped
/// by `since` to one branch may still have to resolve them.
pub(crate) async fn do_compact(fetcher: &CompactionFetcher, head: &[Cid]) -> Result<(), Error> {
    let mut events = EventFetcher::new(fetcher);
    let order = causal_order(&mut events, head, &HashSet::new(), false).await?;

    for cid in order {
        let event = events.get(&cid).await?;
        for op in event.data.ops() {
            if let Some(value_cid) = op.value {
                fetcher
                    .get(&value_cid)
                    .await?
                    .ok_or(Error::MissingBlock(value_cid))?;
            }
        }
    }
    Ok(())
}

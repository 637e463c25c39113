use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cid::Cid;
use hearth_store::BlockFetcher;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::Error;
use crate::event::{decode_event, Event};
use crate::types::{sort_head, ClockHead, DocUpdate};

/// Decodes and caches event blocks during one traversal.
pub(crate) struct EventFetcher<'a> {
    blocks: &'a dyn BlockFetcher,
    cache: HashMap<Cid, Arc<Event>>,
}

impl<'a> EventFetcher<'a> {
    pub(crate) fn new(blocks: &'a dyn BlockFetcher) -> Self {
        Self {
            blocks,
            cache: HashMap::new(),
        }
    }

    pub(crate) async fn get(&mut self, cid: &Cid) -> Result<Arc<Event>, Error> {
        if let Some(event) = self.cache.get(cid) {
            return Ok(event.clone());
        }
        let bytes = self
            .blocks
            .get_block(cid)
            .await?
            .ok_or(Error::MissingBlock(*cid))?;
        let event = Arc::new(decode_event(&bytes)?);
        self.cache.insert(*cid, event.clone());
        Ok(event)
    }
}

/// Whether `b` is an ancestor of `a` (or equal to it).
async fn contains(events: &mut EventFetcher<'_>, a: Cid, b: Cid) -> Result<bool, Error> {
    if a == b {
        return Ok(true);
    }
    let event = events.get(&a).await?;
    let mut queue: VecDeque<Cid> = event.parents.iter().copied().collect();
    let mut visited = HashSet::new();
    while let Some(link) = queue.pop_front() {
        if link == b {
            return Ok(true);
        }
        if !visited.insert(link) {
            continue;
        }
        let event = events.get(&link).await?;
        queue.extend(event.parents.iter().copied());
    }
    Ok(false)
}

/// Folds one event into a head: events dominated by the newcomer leave the
/// head, an already-dominated newcomer changes nothing, and a concurrent
/// one widens the head. The result is canonically sorted.
pub(crate) async fn advance(
    events: &mut EventFetcher<'_>,
    head: &[Cid],
    event: Cid,
) -> Result<ClockHead, Error> {
    if head.contains(&event) {
        return Ok(sort_head(head.to_vec()));
    }

    let mut new_head = head.to_vec();
    let mut changed = false;
    for cid in head {
        if contains(events, event, *cid).await? {
            new_head.retain(|c| c != cid);
            if !new_head.contains(&event) {
                new_head.push(event);
            }
            changed = true;
        }
    }
    if changed {
        return Ok(sort_head(new_head));
    }

    for cid in head {
        if contains(events, *cid, event).await? {
            return Ok(sort_head(head.to_vec()));
        }
    }

    let mut widened = head.to_vec();
    widened.push(event);
    Ok(sort_head(widened))
}

type TickFn = Arc<dyn Fn(&[DocUpdate]) + Send + Sync>;
type NotifyFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Tick,
    Tock,
    Zoom,
}

/// Handle returned by the subscribe methods; pass it back to
/// [`CrdtClock::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: u64,
    channel: Channel,
}

/// The ledger's merkle clock.
///
/// Holds the current head and notifies subscribers when it moves: `tick`
/// fires with the updates of a local linear advance, `zoom` fires when a
/// merge rewrote history underneath readers, and `tock` fires after every
/// change.
pub struct CrdtClock {
    head: RwLock<ClockHead>,
    next_token: AtomicU64,
    ticks: Mutex<HashMap<u64, TickFn>>,
    tocks: Mutex<HashMap<u64, NotifyFn>>,
    zooms: Mutex<HashMap<u64, NotifyFn>>,
}

impl std::fmt::Debug for CrdtClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtClock")
            .field("head", &*self.head.read())
            .finish_non_exhaustive()
    }
}

impl Default for CrdtClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtClock {
    pub fn new() -> Self {
        Self {
            head: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(0),
            ticks: Mutex::new(HashMap::new()),
            tocks: Mutex::new(HashMap::new()),
            zooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn head(&self) -> ClockHead {
        self.head.read().clone()
    }

    /// Moves the clock to cover `new_head`, folding in each event.
    ///
    /// `updates` marks a local write: subscribers get a `tick` with the
    /// written documents, but only while the advance stays linear. When
    /// the fold widens the head — a merge, or a local write that raced a
    /// concurrent advance — subscribers get a `zoom` instead.
    pub async fn apply_head(
        &self,
        blocks: &dyn BlockFetcher,
        new_head: ClockHead,
        updates: Option<Vec<DocUpdate>>,
    ) -> Result<(), Error> {
        let new_head = sort_head(new_head);
        let current = self.head();
        if current == new_head {
            return Ok(());
        }

        let mut events = EventFetcher::new(blocks);
        let mut head = current.clone();
        for cid in &new_head {
            head = advance(&mut events, &head, *cid).await?;
        }
        if head == current {
            // incoming head was dominated, nothing moved
            return Ok(());
        }
        trace!(?head, "clock advanced");
        let widened = head != new_head;
        *self.head.write() = head;

        if widened {
            // the fold produced a merge: history moved under readers, and
            // even a local write loses its linear story once a concurrent
            // advance slipped in between snapshot and apply
            for zoom in self.subscribers(&self.zooms) {
                zoom();
            }
        } else if let Some(updates) = updates {
            for tick in self.subscribers(&self.ticks) {
                tick(&updates);
            }
        }
        for tock in self.subscribers(&self.tocks) {
            tock();
        }
        Ok(())
    }

    /// Drops all subscriptions; used on close.
    pub fn close(&self) {
        self.ticks.lock().clear();
        self.tocks.lock().clear();
        self.zooms.lock().clear();
    }

    fn subscribers<F: Clone>(&self, registry: &Mutex<HashMap<u64, F>>) -> Vec<F> {
        registry.lock().values().cloned().collect()
    }

    fn token(&self, channel: Channel) -> SubscriptionToken {
        SubscriptionToken {
            id: self.next_token.fetch_add(1, Ordering::Relaxed),
            channel,
        }
    }

    /// Called with the updates of every local linear advance.
    pub fn on_tick(&self, f: impl Fn(&[DocUpdate]) + Send + Sync + 'static) -> SubscriptionToken {
        let token = self.token(Channel::Tick);
        self.ticks.lock().insert(token.id, Arc::new(f));
        token
    }

    /// Called after every head change, local or merged.
    pub fn on_tock(&self, f: impl Fn() + Send + Sync + 'static) -> SubscriptionToken {
        let token = self.token(Channel::Tock);
        self.tocks.lock().insert(token.id, Arc::new(f));
        token
    }

    /// Called when a merge moved the head; readers should requery rather
    /// than patch in deltas.
    pub fn on_zoom(&self, f: impl Fn() + Send + Sync + 'static) -> SubscriptionToken {
        let token = self.token(Channel::Zoom);
        self.zooms.lock().insert(token.id, Arc::new(f));
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        match token.channel {
            Channel::Tick => {
                self.ticks.lock().remove(&token.id);
            }
            Channel::Tock => {
                self.tocks.lock().remove(&token.id);
            }
            Channel::Zoom => {
                self.zooms.lock().remove(&token.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use hearth_store::Block;

    use crate::event::{encode_event, EventData, PutOp};

    use super::*;

    #[derive(Default)]
    struct MapFetcher(parking_lot::Mutex<HashMap<Cid, Vec<u8>>>);

    impl MapFetcher {
        fn put(&self, block: &Block) {
            self.0.lock().insert(*block.cid(), block.data().to_vec());
        }
    }

    #[async_trait]
    impl BlockFetcher for MapFetcher {
        async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, hearth_store::Error> {
            Ok(self.0.lock().get(cid).cloned())
        }
    }

    fn put_event(store: &MapFetcher, key: &str, parents: &[Cid]) -> Cid {
        let block = encode_event(
            parents,
            &EventData::Put(PutOp {
                key: key.into(),
                value: None,
            }),
        )
        .unwrap();
        store.put(&block);
        *block.cid()
    }

    #[tokio::test]
    async fn linear_child_replaces_its_parent() {
        let store = MapFetcher::default();
        let root = put_event(&store, "r", &[]);
        let child = put_event(&store, "a", &[root]);

        let mut events = EventFetcher::new(&store);
        let head = advance(&mut events, &[root], child).await.unwrap();
        assert_eq!(head, vec![child]);
    }

    #[tokio::test]
    async fn concurrent_events_widen_the_head() {
        let store = MapFetcher::default();
        let root = put_event(&store, "r", &[]);
        let left = put_event(&store, "a", &[root]);
        let right = put_event(&store, "b", &[root]);

        let mut events = EventFetcher::new(&store);
        let head = advance(&mut events, &[left], right).await.unwrap();
        assert_eq!(head.len(), 2);
        assert!(head.contains(&left) && head.contains(&right));

        // a descendant of both folds the head back to one leaf
        let merge = put_event(&store, "m", &[left, right]);
        let head = advance(&mut events, &head, merge).await.unwrap();
        assert_eq!(head, vec![merge]);
    }

    #[tokio::test]
    async fn racing_local_write_fires_zoom_instead_of_tick() {
        use std::sync::atomic::AtomicUsize;

        let store = MapFetcher::default();
        let root = put_event(&store, "r", &[]);
        let left = put_event(&store, "a", &[root]);
        let right = put_event(&store, "b", &[root]);

        let clock = CrdtClock::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let zooms = Arc::new(AtomicUsize::new(0));
        let tick_count = ticks.clone();
        clock.on_tick(move |_| {
            tick_count.fetch_add(1, Ordering::SeqCst);
        });
        let zoom_count = zooms.clone();
        clock.on_zoom(move || {
            zoom_count.fetch_add(1, Ordering::SeqCst);
        });

        // a merge delivered another party's event while a local write
        // built on [root] was still in flight
        clock.apply_head(&store, vec![left], None).await.unwrap();
        clock
            .apply_head(&store, vec![right], Some(vec![DocUpdate::del("b")]))
            .await
            .unwrap();

        // the local write lost its linear story: no tick, one zoom
        assert_eq!(clock.head().len(), 2);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(zooms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dominated_event_changes_nothing() {
        let store = MapFetcher::default();
        let root = put_event(&store, "r", &[]);
        let child = put_event(&store, "a", &[root]);

        let mut events = EventFetcher::new(&store);
        let head = advance(&mut events, &[child], root).await.unwrap();
        assert_eq!(head, vec![child]);

        // and advancing an event already in the head is a no-op
        let head = advance(&mut events, &head, child).await.unwrap();
        assert_eq!(head, vec![child]);
    }
}

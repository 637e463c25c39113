//! Local-first embedded document ledger.
//!
//! Documents are JSON values addressed by id. Every write becomes an event
//! in a merkle clock: a content-addressed block naming its causal parents.
//! The clock head is the set of current leaves; concurrent writers widen
//! it and merges fold it back together, deterministically on every party.
//! Blocks are packed into CAR shards, encrypted, and published through a
//! [`Gateway`], so two processes pointed at the same storage converge
//! without coordinating.
//!
//! ```no_run
//! # async fn demo() -> Result<(), hearth::Error> {
//! use hearth::{Crdt, CrdtOpts, DocUpdate, MemoryGateway};
//!
//! let ledger = Crdt::new(CrdtOpts::new("example", MemoryGateway::new()));
//! ledger
//!     .bulk(vec![DocUpdate::put("alice", serde_json::json!({"role": "admin"}))])
//!     .await?;
//! let doc = ledger.get("alice").await?.unwrap();
//! assert_eq!(doc.value["role"], "admin");
//! # Ok(())
//! # }
//! ```

mod clock;
mod crdt;
mod error;
mod event;
mod helpers;
mod types;

pub use crate::clock::{CrdtClock, SubscriptionToken};
pub use crate::crdt::{Crdt, CrdtOpts};
pub use crate::error::Error;
pub use crate::event::{decode_event, encode_event, Event, EventData, PutOp, GENESIS_DOC_ID};
pub use crate::types::{Changes, ChangesOpts, ClockHead, CrdtMeta, DocUpdate, DocValue};

pub use hearth_keybag::KeyBag;
pub use hearth_store::{FileGateway, Gateway, IvStrategy, MemoryGateway};

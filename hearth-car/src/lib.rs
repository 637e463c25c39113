//! Implementation of the [CAR v1 format], used by the hearth commit pipeline
//! to serialize the blocks of a transaction into durable archive shards.
//!
//! Archives are built and parsed fully in memory: the commit pipeline owns the
//! plaintext shard bytes before they are handed to the encryption codec, and
//! the loader receives whole shards back from the gateway. The size accounting
//! helpers let the pipeline split a transaction across shards at an exact byte
//! threshold without encoding speculatively.
//!
//! [CAR v1 format]: https://ipld.io/specs/transport/car/carv1/

// The `DagCbor` derive from libipld 0.16 generates code that relies on never
// type fallback; silence the rust-2024 compatibility lint until the derive is
// fixed upstream.
#![allow(dependency_on_unit_never_type_fallback)]

mod error;
mod header;
mod reader;
mod util;
mod writer;

pub use crate::error::Error;
pub use crate::header::CarHeader;
pub use crate::reader::CarReader;
pub use crate::util::{block_length, header_length, varint_length};
pub use crate::writer::CarWriter;

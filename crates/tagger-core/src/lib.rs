// tagger-core: everything a single node needs to drive its Time Controller,
// ingest per-channel timestamp streams, merge them onto one timeline, and
// compute the inter-node offset.
//
// Layering, leaves first: `scpi` and `dlt` wrap the two local instrument
// services; `stream` ingests framed timestamp batches; `merge` produces the
// ordered output; `timetag` owns the on-disk formats; `sync` turns two
// partial files into an offset report; `acquisition` wires it all into the
// per-node pipeline.

pub mod acquisition;
pub mod dlt;
pub mod merge;
pub mod scpi;
pub mod stream;
pub mod sync;
pub mod timetag;

pub use timetag::{ChannelId, TimeTag};

//! Lookout store: the in-RAM resource cache and the stages that feed it.
//!
//! Watch events pass the [`ThrottleFilter`], are coalesced per key by the
//! [`EventAggregator`], and are applied once per tick to the [`ResourceStore`], which
//! owns the ownership graph, derived status, counters and filter flags. Readers get
//! immutable [`StoreView`] snapshots.

#![forbid(unsafe_code)]

mod aggregate;
mod cache;
mod graph;
pub mod status;
mod throttle;

pub use aggregate::EventAggregator;
pub use cache::{PutOutcome, ResourceStore, Selection, StoreView};
pub use graph::OwnershipGraph;
pub use status::status_for_resource;
pub use throttle::ThrottleFilter;

//! # clusterd
//! The shared state of a high availability cluster daemon.
//!
//! This is a convenience package re-exporting the sub-projects, realistically
//! you probably only want one of them:
//!
//! ### Features
//! - `clusterd_node` - Cluster data, anti-entropy generations, placement, quorum and monitors.
//! - `clusterd_events` - Structured events, their log messages and hook delivery.

#[cfg(feature = "clusterd-events")]
pub use clusterd_events as events;
#[cfg(feature = "clusterd-node")]
pub use clusterd_node as node;

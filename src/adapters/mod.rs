//! Concrete Linux adapters implementing the collaborator ports.

pub mod hdparm;

pub use hdparm::{FibmapBlockMapper, HdparmDiscardProvider, HdparmDiscardSink};

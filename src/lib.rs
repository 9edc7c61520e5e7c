//! gPTP core: IEEE 802.1AS time synchronization and path delay
//!
//! This library implements the per-port state machines of a gPTP time-aware
//! system: best master selection, Announce exchange, Sync master and slave
//! with a PI servo, and peer-to-peer path delay measurement including the
//! Milan multiple-response rules. A [`Coordinator`](manager::Coordinator)
//! drives them from a single tick; packet I/O and hardware timestamping are
//! supplied by the embedding application.
pub mod core;
pub mod delay;
pub mod manager;
pub mod protocol;
pub mod sync;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, Result};
pub use crate::manager::{Coordinator, Driver, ManagerEvent, ManagerState};
pub use crate::time::HardwareTimestampInterface;
pub use crate::protocol::transport::MessageTransmitter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Core value types: identifiers, timestamps and the process clock, statuses.

pub mod ids;
pub mod status;
pub mod timestamp;

pub use ids::{IdError, NodeID, PttID, ADDR_LEN, ID_LEN};
pub use status::Status;
pub use timestamp::{Clock, Timestamp};

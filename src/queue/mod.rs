//! Offline operation queue.

mod operation;
mod store;

pub use operation::{OfflineOperation, OperationStatus};
pub use store::OfflineQueue;

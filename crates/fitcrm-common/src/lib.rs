pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{RunId, SanityCheck, SnapshotId};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle for a storage snapshot owned by the backup collaborator.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotId(String);

/// Identifies one invocation of `run`/`rollback` in the run log.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(String);

macro_rules! impl_id_type {
    ($t:ty) => {
        impl $t {
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id_type!(SnapshotId);
impl_id_type!(RunId);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Domain assertion evaluated by the integrity verifier.
///
/// `query` must return a single integer. With `expect_zero` any non-zero
/// count is a violation; without it a zero count is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityCheck {
    pub name: String,
    pub query: String,
    #[serde(default = "default_expect_zero")]
    pub expect_zero: bool,
}

fn default_expect_zero() -> bool {
    true
}

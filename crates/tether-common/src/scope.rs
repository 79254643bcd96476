//! Data scopes.

use serde::{Deserialize, Serialize};

/// Whether state is local to one controller or shared across a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// State lives in this controller's local store only.
    #[default]
    Local,
    /// State lives in the store shared by cooperating controllers.
    Global,
}

impl Scope {
    /// Returns the scope name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

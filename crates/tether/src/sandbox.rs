//! Sandbox hooks for name-resolution records.

use serde::{Deserialize, Serialize};

/// One hosts-file entry pushed into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host name.
    pub hosts: String,
    /// Address, in textual form.
    pub ip: String,
}

impl HostRecord {
    /// Create a record.
    pub fn new(hosts: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hosts: hosts.into(),
            ip: ip.into(),
        }
    }
}

/// An isolated execution context that endpoints join.
///
/// Implementations own their hosts-file handling and log their own failures.
pub trait Sandbox: Send + Sync {
    /// Sandbox ID.
    fn id(&self) -> &str;

    /// Add entries to the sandbox's hosts file.
    fn add_hosts_entries(&self, records: &[HostRecord]);

    /// Remove entries from the sandbox's hosts file.
    fn delete_hosts_entries(&self, records: &[HostRecord]);
}

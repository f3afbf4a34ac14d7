//! Host inventory lookups.
//!
//! Host CRUD lives outside the bridge. The server only needs to resolve a
//! host id to a connectable record, which the config's `[[hosts]]` table
//! provides.

use std::collections::HashMap;
use termgate_core::HostRecord;

pub trait HostDirectory: Send + Sync {
    fn lookup(&self, host_id: u32) -> Option<HostRecord>;
}

/// Fixed inventory loaded at startup.
#[derive(Debug, Default)]
pub struct StaticHosts {
    hosts: HashMap<u32, HostRecord>,
}

impl StaticHosts {
    pub fn new(hosts: impl IntoIterator<Item = HostRecord>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.id, h)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostDirectory for StaticHosts {
    fn lookup(&self, host_id: u32) -> Option<HostRecord> {
        self.hosts.get(&host_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::Credential;

    #[test]
    fn lookup_by_id() {
        let hosts = StaticHosts::new([HostRecord {
            id: 3,
            name: "db".into(),
            address: "db.internal".into(),
            port: 2222,
            username: "ops".into(),
            credential: Credential::Password("pw".into()),
        }]);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts.lookup(3).unwrap().port, 2222);
        assert!(hosts.lookup(4).is_none());
    }
}

use crate::net::MacAddr;
use crate::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Hardware address of each bridge member, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct InterfaceIdentityCache {
    macs: HashMap<String, MacAddr>,
}

impl InterfaceIdentityCache {
    /// Read `<sysfs_root>/class/net/<iface>/address` for every member.
    ///
    /// Members whose address cannot be read are left out; rules that need
    /// them are skipped later.
    pub fn load(sysfs_root: &Path, members: &[&str]) -> Self {
        let mut macs = HashMap::new();
        for iface in members {
            let path = sysfs_root.join("class/net").join(iface).join("address");
            match std::fs::read_to_string(&path) {
                Ok(text) => match text.trim().parse::<MacAddr>() {
                    Ok(mac) => {
                        debug!(iface = %iface, mac = %mac, "member address");
                        macs.insert(iface.to_string(), mac);
                    }
                    Err(e) => warn!(iface = %iface, error = %e, "unparseable member address"),
                },
                Err(e) => {
                    warn!(iface = %iface, path = %path.display(), error = %e, "cannot read member address")
                }
            }
        }
        Self { macs }
    }

    pub fn from_entries<I: IntoIterator<Item = (String, MacAddr)>>(entries: I) -> Self {
        Self {
            macs: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, iface: &str) -> Option<MacAddr> {
        self.macs.get(iface).copied()
    }

    pub fn len(&self) -> usize {
        self.macs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macs.is_empty()
    }
}

/// Names of every network interface on the system, sorted.
pub fn list_interfaces(sysfs_root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(sysfs_root.join("class/net"))? {
        let entry = entry?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

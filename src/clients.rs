//! Client identification: a static IP → client map plus per-group policy
//! (safe-search opt-out, group-specific blocklist).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::blocking::BlockFilter;
use crate::config::parse_bool;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub group: Option<String>,
}

pub struct GroupPolicy {
    /// false lets the group bypass the global safe-search rewrite.
    pub safe_search: bool,
    /// Group-specific blocklist consulted instead of the global one.
    pub blocklist: Option<Arc<BlockFilter>>,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            safe_search: true,
            blocklist: None,
        }
    }
}

/// Immutable snapshot, swapped on reload.
pub struct ClientDirectory {
    by_ip: HashMap<IpAddr, ClientInfo>,
    groups: HashMap<String, GroupPolicy>,
}

impl ClientDirectory {
    pub fn empty() -> Self {
        Self {
            by_ip: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Clients come as `ip=name[@group]`, group policies as
    /// `group:key=value` (one key per entry; entries for the same group
    /// merge).
    pub fn from_entries(clients: &[String], groups: &[String]) -> Self {
        let mut by_ip = HashMap::new();
        for entry in clients {
            let Some((ip_raw, rest)) = entry.split_once('=') else {
                warn!("Skipping malformed client entry: {}", entry);
                continue;
            };
            let Ok(ip) = ip_raw.trim().parse::<IpAddr>() else {
                warn!("Skipping client with bad IP: {}", entry);
                continue;
            };
            let (client_name, group) = match rest.split_once('@') {
                Some((client_name, group)) => {
                    (client_name.trim().to_string(), Some(group.trim().to_string()))
                }
                None => (rest.trim().to_string(), None),
            };
            by_ip.insert(
                ip,
                ClientInfo {
                    name: client_name,
                    group,
                },
            );
        }

        let mut group_map: HashMap<String, GroupPolicy> = HashMap::new();
        for entry in groups {
            let Some((group_name, kv)) = entry.split_once(':') else {
                warn!("Skipping malformed group entry: {}", entry);
                continue;
            };
            let policy = group_map.entry(group_name.trim().to_string()).or_default();
            match kv.split_once('=') {
                Some(("safe_search", value)) => {
                    policy.safe_search = parse_bool(value.trim(), true);
                }
                Some(("blocklist", path)) => match std::fs::read_to_string(path.trim()) {
                    Ok(contents) => {
                        let rules: Vec<String> =
                            contents.lines().map(|l| l.to_string()).collect();
                        policy.blocklist = Some(Arc::new(BlockFilter::from_rules(
                            rules,
                            Vec::new(),
                            Vec::new(),
                        )));
                    }
                    Err(err) => warn!("Failed to read group blocklist {}: {}", path, err),
                },
                _ => warn!("Skipping unknown group policy: {}", entry),
            }
        }

        Self {
            by_ip,
            groups: group_map,
        }
    }

    pub fn identify(&self, ip: &IpAddr) -> Option<&ClientInfo> {
        self.by_ip.get(ip)
    }

    pub fn group_policy(&self, group: &str) -> Option<&GroupPolicy> {
        self.groups.get(group)
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_parsing() {
        let directory = ClientDirectory::from_entries(
            &[
                "192.168.1.10=laptop@kids".to_string(),
                "192.168.1.11=nas".to_string(),
                "garbage".to_string(),
            ],
            &[],
        );
        assert_eq!(directory.len(), 2);

        let laptop = directory
            .identify(&"192.168.1.10".parse().unwrap())
            .unwrap();
        assert_eq!(laptop.name, "laptop");
        assert_eq!(laptop.group.as_deref(), Some("kids"));

        let nas = directory.identify(&"192.168.1.11".parse().unwrap()).unwrap();
        assert!(nas.group.is_none());
    }

    #[test]
    fn group_safe_search_opt_out() {
        let directory = ClientDirectory::from_entries(
            &[],
            &["adults:safe_search=off".to_string()],
        );
        let policy = directory.group_policy("adults").unwrap();
        assert!(!policy.safe_search);
        assert!(policy.blocklist.is_none());
    }

    #[test]
    fn unknown_group_has_no_policy() {
        let directory = ClientDirectory::empty();
        assert!(directory.group_policy("nobody").is_none());
    }
}

//! Local override records: answered authoritatively, ahead of blocklists
//! and the cache, so they keep working with no upstream reachable.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::warn;

use crate::dns::{DnsRecord, RecordType, name};

const DEFAULT_TTL: u32 = 300;

/// Immutable snapshot keyed by (lowercased name, type).
pub struct LocalRecords {
    map: HashMap<(String, RecordType), Vec<DnsRecord>>,
}

impl LocalRecords {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Build from `name:type:value[:ttl]` entries; malformed entries are
    /// logged and skipped.
    pub fn from_entries(entries: &[String]) -> Self {
        let mut map: HashMap<(String, RecordType), Vec<DnsRecord>> = HashMap::new();

        for entry in entries {
            match parse_entry(entry) {
                Some(record) => {
                    let key = (record.name.clone(), record.rtype);
                    map.entry(key).or_default().push(record);
                }
                None => warn!("Skipping malformed local record: {}", entry),
            }
        }

        Self { map }
    }

    pub fn lookup(&self, normalized_name: &str, rtype: RecordType) -> Option<&[DnsRecord]> {
        self.map
            .get(&(normalized_name.to_string(), rtype))
            .map(|records| records.as_slice())
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_entry(entry: &str) -> Option<DnsRecord> {
    let parts: Vec<&str> = entry.split(':').collect();
    if parts.len() < 3 {
        return None;
    }
    let record_name = name::normalize(parts[0].trim());
    let rtype = RecordType::parse_mnemonic(parts[1].trim())?;
    let value = parts[2].trim();
    let ttl = parts
        .get(3)
        .and_then(|t| t.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_TTL);

    if record_name.is_empty() || value.is_empty() {
        return None;
    }

    match rtype {
        RecordType::A => {
            let addr = value.parse::<Ipv4Addr>().ok()?;
            Some(DnsRecord::a(record_name, addr, ttl))
        }
        RecordType::AAAA => {
            let addr = value.parse::<Ipv6Addr>().ok()?;
            Some(DnsRecord::aaaa(record_name, addr, ttl))
        }
        RecordType::CNAME => DnsRecord::cname(record_name, &name::normalize(value), ttl).ok(),
        RecordType::TXT => Some(DnsRecord::txt(record_name, value, ttl)),
        _ => None,
    }
}

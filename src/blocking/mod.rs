//! Blocklist matching: deny/allow/block sets with a bloom-gated suffix walk.

pub mod parser;

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use bloomfilter::Bloom;
use tracing::{info, warn};

use crate::dns::{DnsMessage, DnsRecord, RecordType};
use crate::error::Result;

pub use parser::normalize_rule;

/// Bloom filter false-positive target for the blocklist gate.
const BLOOM_FP_RATE: f64 = 0.001;

/// How blocked queries are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedResponse {
    /// NXDOMAIN with a synthesized SOA in the authority section.
    NxDomain,
    /// A/AAAA pointing at a configured sink address.
    Address(Ipv4Addr, Option<Ipv6Addr>),
}

impl BlockedResponse {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("nxdomain") {
            return Some(BlockedResponse::NxDomain);
        }
        let mut parts = s.split(',');
        let v4 = parts.next()?.trim().parse::<Ipv4Addr>().ok()?;
        let v6 = parts.next().and_then(|p| p.trim().parse::<Ipv6Addr>().ok());
        Some(BlockedResponse::Address(v4, v6))
    }
}

/// Immutable snapshot of the loaded lists. Rebuilt wholesale on reload and
/// swapped in under the resolver's writer lock.
pub struct BlockFilter {
    blocklist: HashSet<String>,
    bloom: Option<Bloom<String>>,
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
}

impl BlockFilter {
    pub fn empty() -> Self {
        Self {
            blocklist: HashSet::new(),
            bloom: None,
            allowlist: HashSet::new(),
            denylist: HashSet::new(),
        }
    }

    /// Build from raw source lines. Blocklist lines go through rule
    /// normalization; allow/deny entries are exact domains.
    pub fn from_rules<B, E>(block_lines: B, allow: E, deny: E) -> Self
    where
        B: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        let blocklist: HashSet<String> = block_lines
            .into_iter()
            .filter_map(|line| normalize_rule(&line))
            .collect();
        let allowlist: HashSet<String> = allow
            .into_iter()
            .map(|d| crate::dns::name::normalize(&d))
            .collect();
        let denylist: HashSet<String> = deny
            .into_iter()
            .map(|d| crate::dns::name::normalize(&d))
            .collect();

        let bloom = if blocklist.is_empty() {
            None
        } else {
            match Bloom::new_for_fp_rate(blocklist.len(), BLOOM_FP_RATE) {
                Ok(mut bloom) => {
                    for domain in &blocklist {
                        bloom.set(domain);
                    }
                    Some(bloom)
                }
                Err(err) => {
                    warn!("Failed to size bloom filter: {}", err);
                    None
                }
            }
        };

        info!(
            "Block filter loaded: {} blocked, {} allowed, {} denied",
            blocklist.len(),
            allowlist.len(),
            denylist.len()
        );

        Self {
            blocklist,
            bloom,
            allowlist,
            denylist,
        }
    }

    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }

    /// Decide for a lowercased, trailing-dot-stripped name.
    /// Denylist wins over allowlist wins over blocklist.
    pub fn is_blocked(&self, name: &str) -> bool {
        if suffix_walk(name, |candidate| self.denylist.contains(candidate)) {
            return true;
        }
        if suffix_walk(name, |candidate| self.allowlist.contains(candidate)) {
            return false;
        }
        suffix_walk(name, |candidate| {
            // Only bloom-admitted candidates reach the exact set.
            match &self.bloom {
                Some(bloom) if !bloom.check(&candidate.to_string()) => false,
                _ => self.blocklist.contains(candidate),
            }
        })
    }
}

/// Walk labels left-to-right: test the name, strip the leftmost label, test
/// again, until nothing is left.
fn suffix_walk<F: Fn(&str) -> bool>(name: &str, test: F) -> bool {
    let mut candidate = name;
    loop {
        if candidate.is_empty() {
            return false;
        }
        if test(candidate) {
            return true;
        }
        match candidate.find('.') {
            Some(idx) => candidate = &candidate[idx + 1..],
            None => return false,
        }
    }
}

/// Collect raw rules from inline config plus local list files. Unreadable
/// files are logged and skipped.
pub fn collect_rules(inline: &[String], files: &[String]) -> Vec<String> {
    let mut rules: Vec<String> = inline.to_vec();
    for path in files {
        match std::fs::read_to_string(path) {
            Ok(contents) => rules.extend(contents.lines().map(|l| l.to_string())),
            Err(err) => warn!("Failed to read blocklist file {}: {}", path, err),
        }
    }
    rules
}

/// Synthesize the reply for a blocked question.
pub fn blocked_reply(
    request: &DnsMessage,
    qname: &str,
    qtype: RecordType,
    mode: BlockedResponse,
    blocked_ttl: u32,
) -> Result<DnsMessage> {
    match mode {
        BlockedResponse::NxDomain => DnsMessage::nxdomain_with_soa(request, qname, blocked_ttl),
        BlockedResponse::Address(v4, v6) => {
            let mut reply = DnsMessage::response_for(request);
            reply.header.aa = true;
            match qtype {
                RecordType::A => {
                    reply.answers.push(DnsRecord::a(qname, v4, blocked_ttl));
                }
                RecordType::AAAA => {
                    if let Some(v6) = v6 {
                        reply.answers.push(DnsRecord::aaaa(qname, v6, blocked_ttl));
                    }
                }
                _ => {}
            }
            Ok(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(block: &[&str], allow: &[&str], deny: &[&str]) -> BlockFilter {
        BlockFilter::from_rules(
            block.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            allow.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            deny.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn exact_and_subdomain_blocking() {
        let filter = filter(&["ads.test"], &[], &[]);
        assert!(filter.is_blocked("ads.test"));
        assert!(filter.is_blocked("tracker.ads.test"));
        assert!(filter.is_blocked("a.b.ads.test"));
        assert!(!filter.is_blocked("goodads.test"));
        assert!(!filter.is_blocked("example.com"));
    }

    #[test]
    fn allowlist_overrides_blocklist() {
        let filter = filter(&["ads.test"], &["ok.ads.test"], &[]);
        assert!(filter.is_blocked("ads.test"));
        assert!(!filter.is_blocked("ok.ads.test"));
        assert!(!filter.is_blocked("deep.ok.ads.test"));
    }

    #[test]
    fn denylist_overrides_allowlist() {
        let filter = filter(&[], &["ads.test"], &["ads.test"]);
        assert!(filter.is_blocked("ads.test"));
        assert!(filter.is_blocked("x.ads.test"));
    }

    #[test]
    fn empty_filter_blocks_nothing() {
        let filter = BlockFilter::empty();
        assert!(!filter.is_blocked("anything.test"));
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let domains: Vec<String> = (0..5000).map(|i| format!("blocked{}.test", i)).collect();
        let filter = BlockFilter::from_rules(domains.clone(), Vec::new(), Vec::new());
        for domain in &domains {
            assert!(filter.is_blocked(domain), "false negative for {}", domain);
        }
    }

    #[test]
    fn bloom_false_positive_rate_bounded() {
        let domains: Vec<String> = (0..10_000).map(|i| format!("blocked{}.test", i)).collect();
        let filter = BlockFilter::from_rules(domains, Vec::new(), Vec::new());

        let mut false_positives = 0;
        for i in 0..10_000 {
            if filter.is_blocked(&format!("clean{}.example", i)) {
                false_positives += 1;
            }
        }
        // Target rate is 0.1%; allow up to 1% on a disjoint probe set.
        assert!(false_positives <= 100, "{} false positives", false_positives);
    }

    #[test]
    fn blocked_response_parsing() {
        assert_eq!(
            BlockedResponse::parse("nxdomain"),
            Some(BlockedResponse::NxDomain)
        );
        assert_eq!(
            BlockedResponse::parse("0.0.0.0"),
            Some(BlockedResponse::Address(Ipv4Addr::UNSPECIFIED, None))
        );
        assert_eq!(
            BlockedResponse::parse("0.0.0.0,::"),
            Some(BlockedResponse::Address(
                Ipv4Addr::UNSPECIFIED,
                Some(Ipv6Addr::UNSPECIFIED)
            ))
        );
        assert_eq!(BlockedResponse::parse("junk"), None);
    }
}

use super::enums::{RecordClass, RecordType, rcode};
use super::header::{DnsHeader, HEADER_LEN};
use super::question::DnsQuestion;
use super::record::DnsRecord;
use crate::error::Result;

/// A fully parsed DNS message. Serialization never emits compression
/// pointers, so `to_bytes` output re-parses to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = DnsHeader::parse(buf)?;
        let mut offset = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = DnsQuestion::parse(buf, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut parse_records = |count: u16, offset: &mut usize| -> Result<Vec<DnsRecord>> {
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (record, next) = DnsRecord::parse(buf, *offset)?;
                records.push(record);
                *offset = next;
            }
            Ok(records)
        };

        let answers = parse_records(header.ancount, &mut offset)?;
        let authorities = parse_records(header.nscount, &mut offset)?;
        let additionals = parse_records(header.arcount, &mut offset)?;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;

        let mut out = Vec::with_capacity(512);
        header.write(&mut out)?;
        for question in &self.questions {
            question.write(&mut out)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut out)?;
        }
        Ok(out)
    }

    /// Build a recursive query for one question.
    pub fn query(id: u16, question: DnsQuestion) -> Self {
        Self {
            header: DnsHeader {
                id,
                rd: true,
                qdcount: 1,
                ..Default::default()
            },
            questions: vec![question],
            ..Default::default()
        }
    }

    /// Start a response echoing the request's id, question, and RD bit.
    pub fn response_for(request: &DnsMessage) -> Self {
        Self {
            header: DnsHeader {
                id: request.header.id,
                qr: true,
                opcode: request.header.opcode,
                rd: request.header.rd,
                ra: true,
                qdcount: request.questions.len() as u16,
                ..Default::default()
            },
            questions: request.questions.clone(),
            ..Default::default()
        }
    }

    pub fn failure_response(request: &DnsMessage, code: u8) -> Self {
        let mut response = Self::response_for(request);
        response.header.rcode = code;
        response
    }

    /// NXDOMAIN with a synthesized SOA in the authority section.
    pub fn nxdomain_with_soa(request: &DnsMessage, zone: &str, ttl: u32) -> Result<Self> {
        let mut response = Self::response_for(request);
        response.header.rcode = rcode::NXDOMAIN;
        response.header.aa = true;
        response.authorities.push(DnsRecord::soa(zone, ttl)?);
        Ok(response)
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    pub fn is_servfail(&self) -> bool {
        self.header.rcode == rcode::SERVFAIL
    }

    pub fn is_nxdomain(&self) -> bool {
        self.header.rcode == rcode::NXDOMAIN
    }

    /// Rewrite every RR TTL; used when serving stale entries with a pinned
    /// short TTL.
    pub fn rewrite_ttls(&mut self, ttl: u32) {
        for record in self
            .answers
            .iter_mut()
            .chain(&mut self.authorities)
            .chain(&mut self.additionals)
        {
            if record.rtype != RecordType::OPT {
                record.ttl = ttl;
            }
        }
    }

    /// Retarget a cached answer at a live request: new id, the request's
    /// question section (case-preserving), RD/RA flags sane.
    pub fn retarget(&mut self, request: &DnsMessage) {
        self.header.id = request.header.id;
        self.header.qr = true;
        self.header.rd = request.header.rd;
        self.header.ra = true;
        self.questions = request.questions.clone();
        self.header.qdcount = request.questions.len() as u16;
    }

    /// UDP payload size advertised via EDNS (the OPT pseudo-record carries
    /// it in the class field), floored at the classic 512.
    pub fn edns_udp_size(&self) -> usize {
        for record in &self.additionals {
            if record.rtype == RecordType::OPT {
                let size = u16::from(record.rclass) as usize;
                return size.max(512);
            }
        }
        512
    }

    /// Shrink an oversized UDP reply to header + question with TC set; the
    /// client retries over TCP.
    pub fn truncate_for_udp(&self) -> DnsMessage {
        let mut truncated = DnsMessage {
            header: self.header.clone(),
            questions: self.questions.clone(),
            ..Default::default()
        };
        truncated.header.tc = true;
        truncated.header.ancount = 0;
        truncated.header.nscount = 0;
        truncated.header.arcount = 0;
        truncated
    }

    /// Cacheable TTL per the response-TTL policy: SOA-derived for NXDOMAIN,
    /// minimum answer TTL for positive replies, `negative_ttl` when neither
    /// yields a usable value.
    pub fn response_ttl(&self, negative_ttl: u32) -> u32 {
        if self.is_nxdomain() {
            for authority in &self.authorities {
                if authority.rtype == RecordType::SOA {
                    let ttl = match authority.soa_minimum() {
                        Some(minimum) => minimum.min(authority.ttl),
                        None => authority.ttl,
                    };
                    return if ttl > 0 { ttl } else { negative_ttl };
                }
            }
            return negative_ttl;
        }

        let min_answer = self
            .answers
            .iter()
            .filter(|r| r.rtype != RecordType::OPT)
            .map(|r| r.ttl)
            .min();

        match min_answer {
            Some(ttl) if ttl > 0 => ttl,
            // No answers, or all-zero TTLs: fall back so short-lived junk
            // does not loop through the cache.
            _ => negative_ttl,
        }
    }
}

/// The clamping rules applied to every cacheable TTL.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub respect_source_ttl: bool,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub negative_ttl: u32,
}

impl TtlPolicy {
    /// Response TTL followed by the clamp; 0 means "do not cache".
    pub fn effective_ttl(&self, message: &DnsMessage) -> u32 {
        let ttl = message.response_ttl(self.negative_ttl);
        if ttl == 0 {
            return 0;
        }
        clamp_ttl(ttl, self.respect_source_ttl, self.min_ttl, self.max_ttl)
    }
}

/// Clamp a source TTL per config: floor to `min_ttl` unless the source TTL
/// is respected, cap at `max_ttl` when set.
pub fn clamp_ttl(ttl: u32, respect_source_ttl: bool, min_ttl: u32, max_ttl: u32) -> u32 {
    let mut ttl = ttl;
    if !respect_source_ttl && min_ttl > 0 && ttl < min_ttl {
        ttl = min_ttl;
    }
    if max_ttl > 0 && ttl > max_ttl {
        ttl = max_ttl;
    }
    ttl
}

use std::net::{Ipv4Addr, Ipv6Addr};

use super::enums::{RecordClass, RecordType};
use super::name;
use crate::error::{Result, WardenError};

/// A resource record with opaque rdata. Rdata that embeds domain names is
/// decompressed at parse time so a re-serialized record is self-contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn a(name: impl Into<String>, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    pub fn aaaa(name: impl Into<String>, addr: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: RecordType::AAAA,
            rclass: RecordClass::IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    pub fn cname(name: impl Into<String>, target: &str, ttl: u32) -> Result<Self> {
        let mut rdata = Vec::new();
        name::write_name(&mut rdata, target)?;
        Ok(Self {
            name: name.into(),
            rtype: RecordType::CNAME,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        })
    }

    pub fn txt(name: impl Into<String>, text: &str, ttl: u32) -> Self {
        let mut rdata = Vec::new();
        for chunk in text.as_bytes().chunks(255) {
            rdata.push(chunk.len() as u8);
            rdata.extend_from_slice(chunk);
        }
        Self {
            name: name.into(),
            rtype: RecordType::TXT,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        }
    }

    /// Synthesize the SOA record attached to negative replies: `ns.<zone>` /
    /// `hostmaster.<zone>` with every timer set to the blocked/negative TTL.
    pub fn soa(zone: &str, ttl: u32) -> Result<Self> {
        let mut rdata = Vec::new();
        name::write_name(&mut rdata, &format!("ns.{}", zone))?;
        name::write_name(&mut rdata, &format!("hostmaster.{}", zone))?;
        rdata.extend_from_slice(&1u32.to_be_bytes()); // serial
        rdata.extend_from_slice(&ttl.to_be_bytes()); // refresh
        rdata.extend_from_slice(&ttl.to_be_bytes()); // retry
        rdata.extend_from_slice(&ttl.to_be_bytes()); // expire
        rdata.extend_from_slice(&ttl.to_be_bytes()); // minimum
        Ok(Self {
            name: zone.to_string(),
            rtype: RecordType::SOA,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        })
    }

    /// SOA MINIMUM field (RFC 1035 §3.3.13), used for negative TTLs.
    pub fn soa_minimum(&self) -> Option<u32> {
        if self.rtype != RecordType::SOA {
            return None;
        }
        let mut pos = name::skip_name(&self.rdata, 0).ok()?;
        pos = name::skip_name(&self.rdata, pos).ok()?;
        pos += 16; // serial, refresh, retry, expire
        if pos + 4 > self.rdata.len() {
            return None;
        }
        Some(u32::from_be_bytes([
            self.rdata[pos],
            self.rdata[pos + 1],
            self.rdata[pos + 2],
            self.rdata[pos + 3],
        ]))
    }

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (rname, offset) = name::parse_name(data, offset)?;
        if offset + 10 > data.len() {
            return Err(WardenError::InvalidRecordSection);
        }
        let rtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        let rclass = RecordClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        let ttl = u32::from_be_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        let rdata_start = offset + 10;
        let rdata_end = rdata_start + rdlength;
        if rdata_end > data.len() {
            return Err(WardenError::InvalidRecordSection);
        }

        let rdata = decompress_rdata(data, rdata_start, rdata_end, rtype)?;

        Ok((
            Self {
                name: rname,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            rdata_end,
        ))
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        name::write_name(out, &self.name)?;
        out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.rclass).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        if self.rdata.len() > u16::MAX as usize {
            return Err(WardenError::InvalidRecordSection);
        }
        out.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.rdata);
        Ok(())
    }
}

/// Rewrite rdata so embedded names carry no compression pointers. Types
/// whose rdata cannot reference names are copied verbatim.
fn decompress_rdata(
    data: &[u8],
    start: usize,
    end: usize,
    rtype: RecordType,
) -> Result<Vec<u8>> {
    match rtype {
        RecordType::CNAME | RecordType::NS | RecordType::PTR => {
            let (target, _) = name::parse_name(data, start)?;
            let mut rdata = Vec::new();
            name::write_name(&mut rdata, &target)?;
            Ok(rdata)
        }
        RecordType::MX => {
            if start + 2 > end {
                return Err(WardenError::InvalidRecordSection);
            }
            let mut rdata = data[start..start + 2].to_vec();
            let (target, _) = name::parse_name(data, start + 2)?;
            name::write_name(&mut rdata, &target)?;
            Ok(rdata)
        }
        RecordType::SOA => {
            let (mname, pos) = name::parse_name(data, start)?;
            let (rname, pos) = name::parse_name(data, pos)?;
            if pos + 20 > data.len() {
                return Err(WardenError::InvalidRecordSection);
            }
            let mut rdata = Vec::new();
            name::write_name(&mut rdata, &mname)?;
            name::write_name(&mut rdata, &rname)?;
            rdata.extend_from_slice(&data[pos..pos + 20]);
            Ok(rdata)
        }
        RecordType::SRV => {
            if start + 6 > end {
                return Err(WardenError::InvalidRecordSection);
            }
            let mut rdata = data[start..start + 6].to_vec();
            let (target, _) = name::parse_name(data, start + 6)?;
            name::write_name(&mut rdata, &target)?;
            Ok(rdata)
        }
        _ => Ok(data[start..end].to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_record_round_trip() {
        let record = DnsRecord::a("example.com", Ipv4Addr::new(93, 184, 216, 34), 300);
        let mut wire = Vec::new();
        record.write(&mut wire).unwrap();
        let (parsed, end) = DnsRecord::parse(&wire, 0).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(end, wire.len());
    }

    #[test]
    fn soa_minimum_extraction() {
        let record = DnsRecord::soa("ads.test", 3600).unwrap();
        assert_eq!(record.soa_minimum(), Some(3600));
        assert_eq!(record.name, "ads.test");
    }

    #[test]
    fn cname_rdata_is_wire_name() {
        let record = DnsRecord::cname("www.google.com", "forcesafesearch.google.com", 300).unwrap();
        let (target, _) = name::parse_name(&record.rdata, 0).unwrap();
        assert_eq!(target, "forcesafesearch.google.com");
    }
}

use super::enums::{RecordClass, RecordType};
use super::name;
use crate::error::{Result, WardenError};

/// A single question section entry. The name is kept as received on the
/// wire; callers normalize when they need the canonical lowercased form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuestion {
    pub fn new(name: impl Into<String>, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            name: name.into(),
            qtype,
            qclass,
        }
    }

    /// Lowercased, trailing-dot-stripped name.
    pub fn normalized_name(&self) -> String {
        name::normalize(&self.name)
    }

    pub(crate) fn parse(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (qname, offset) = name::parse_name(data, offset)?;
        if offset + 4 > data.len() {
            return Err(WardenError::InvalidQuestionSection);
        }
        let qtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let qclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        Ok((
            Self {
                name: qname,
                qtype: qtype.into(),
                qclass: qclass.into(),
            },
            offset + 4,
        ))
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        name::write_name(out, &self.name)?;
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
        Ok(())
    }
}

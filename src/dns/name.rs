//! Domain name wire codec with compression-pointer support.
//!
//! Reading follows pointers against the full packet buffer; writing always
//! emits uncompressed labels, so bytes produced here re-parse to identical
//! bytes.

use crate::error::{Result, WardenError};

const MAX_POINTER_JUMPS: usize = 5;

/// Parse a domain name starting at `start`, following compression pointers.
/// Returns the dotted name (no trailing dot) and the offset just past the
/// name in the original (unjumped) position.
pub fn parse_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut jumps = 0;
    let mut end_after_first_pointer = None;

    loop {
        if offset >= data.len() {
            return Err(WardenError::InvalidLabel);
        }

        let len = data[offset];

        if (len & 0xC0) == 0xC0 {
            if offset + 1 >= data.len() {
                return Err(WardenError::InvalidLabel);
            }
            if end_after_first_pointer.is_none() {
                end_after_first_pointer = Some(offset + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WardenError::InvalidLabel);
            }
            offset = u16::from_be_bytes([len & 0x3F, data[offset + 1]]) as usize;
            continue;
        }

        if len == 0 {
            let end = end_after_first_pointer.unwrap_or(offset + 1);
            return Ok((labels.join("."), end));
        }

        if len > 63 {
            return Err(WardenError::InvalidLabel);
        }

        let label_start = offset + 1;
        let label_end = label_start + len as usize;
        if label_end > data.len() {
            return Err(WardenError::InvalidLabel);
        }

        let label = String::from_utf8(data[label_start..label_end].to_vec())
            .map_err(|_| WardenError::InvalidLabel)?;
        labels.push(label);
        offset = label_end;
    }
}

/// Skip a domain name and return the offset just past it.
pub fn skip_name(data: &[u8], mut offset: usize) -> Result<usize> {
    let mut jumps = 0;

    loop {
        if offset >= data.len() {
            return Err(WardenError::InvalidLabel);
        }

        let len = data[offset];

        if (len & 0xC0) == 0xC0 {
            if offset + 1 >= data.len() {
                return Err(WardenError::InvalidLabel);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WardenError::InvalidLabel);
            }
            // A pointer terminates the name in-line.
            return Ok(offset + 2);
        }

        if len == 0 {
            return Ok(offset + 1);
        }

        if len > 63 {
            return Err(WardenError::InvalidLabel);
        }

        offset += 1 + len as usize;
    }
}

/// Append a domain name in uncompressed wire form.
pub fn write_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(WardenError::InvalidLabel);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Lowercase and strip the trailing dot; the canonical form used for cache
/// keys and blocklist lookups.
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

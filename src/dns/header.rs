use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use crate::error::{Result, WardenError};

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(WardenError::InvalidHeader);
        }

        let mut reader = BitReader::<_, BigEndian>::new(&buf[0..HEADER_LEN]);
        let mut header = DnsHeader::default();
        header.id = read_var(&mut reader, 16)? as u16;
        header.qr = read_var(&mut reader, 1)? == 1;
        header.opcode = read_var(&mut reader, 4)? as u8;
        header.aa = read_var(&mut reader, 1)? == 1;
        header.tc = read_var(&mut reader, 1)? == 1;
        header.rd = read_var(&mut reader, 1)? == 1;
        header.ra = read_var(&mut reader, 1)? == 1;
        header.z = read_var(&mut reader, 3)? as u8;
        header.rcode = read_var(&mut reader, 4)? as u8;
        header.qdcount = read_var(&mut reader, 16)? as u16;
        header.ancount = read_var(&mut reader, 16)? as u16;
        header.nscount = read_var(&mut reader, 16)? as u16;
        header.arcount = read_var(&mut reader, 16)? as u16;
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut writer = BitWriter::<_, BigEndian>::new(out);
        write_var(&mut writer, 16, self.id as u32)?;
        write_var(&mut writer, 1, self.qr as u32)?;
        write_var(&mut writer, 4, self.opcode as u32)?;
        write_var(&mut writer, 1, self.aa as u32)?;
        write_var(&mut writer, 1, self.tc as u32)?;
        write_var(&mut writer, 1, self.rd as u32)?;
        write_var(&mut writer, 1, self.ra as u32)?;
        write_var(&mut writer, 3, self.z as u32)?;
        write_var(&mut writer, 4, self.rcode as u32)?;
        write_var(&mut writer, 16, self.qdcount as u32)?;
        write_var(&mut writer, 16, self.ancount as u32)?;
        write_var(&mut writer, 16, self.nscount as u32)?;
        write_var(&mut writer, 16, self.arcount as u32)?;
        Ok(())
    }
}

fn read_var(reader: &mut BitReader<&[u8], BigEndian>, bits: u32) -> Result<u32> {
    reader
        .read_var::<u32>(bits)
        .map_err(|_| WardenError::InvalidHeader)
}

fn write_var(writer: &mut BitWriter<&mut Vec<u8>, BigEndian>, bits: u32, value: u32) -> Result<()> {
    writer
        .write_var::<u32>(bits, value)
        .map_err(|_| WardenError::InvalidHeader)
}

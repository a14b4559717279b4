//! FastCGI 1.0 wire format: record framing and name-value pair encoding.
//!
//! See the archived specification, especially sections 3.3 (records),
//! 3.4 (name-value pairs) and 5 (application records):
//! <https://fastcgi-archives.github.io/FastCGI_Specification.html>

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

// Protocol version.
pub const FCGI_VERSION_1: u8 = 1;

// Record types.
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

// BeginRequest flags.
pub const FCGI_KEEP_CONN: u8 = 1;

// Protocol status codes carried by EndRequest.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

/// Maximum content bytes in a single record body.
pub const MAX_CONTENT: usize = 65_535;

/// The role the upstream application plays for a request.
///
/// Only [`Role::Responder`] is driven by this crate; the other tags are
/// representable so a request can carry them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    /// Builds a version-1 header for `content_len` bytes of content, with the
    /// padding required to align the record body to 8 bytes.
    pub fn new(record_type: u8, request_id: u16, content_len: usize) -> Self {
        RecordHeader {
            version: FCGI_VERSION_1,
            record_type,
            request_id,
            content_length: content_len as u16,
            padding_length: padding_for(content_len),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        RecordHeader {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// Padding bytes needed to bring `content_len` up to an 8-byte boundary.
pub fn padding_for(content_len: usize) -> u8 {
    ((8 - (content_len % 8)) % 8) as u8
}

/// A complete inbound record: header plus content, padding already discarded.
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

/// Reads one record from `reader`.
///
/// Fails with [`Error::InvalidHeader`] on any version other than 1. A clean
/// EOF at a record boundary, or mid-record, surfaces as
/// `std::io::ErrorKind::UnexpectedEof`; the response reader treats that as the
/// end of the response.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Record> {
    let mut hdr = [0u8; RecordHeader::SIZE];
    reader.read_exact(&mut hdr).await?;
    let header = RecordHeader::decode(&hdr);
    if header.version != FCGI_VERSION_1 {
        return Err(Error::InvalidHeader(header.version));
    }

    let content_len = header.content_length as usize;
    let total = content_len + header.padding_length as usize;
    let mut buf = vec![0u8; total];
    if total > 0 {
        reader.read_exact(&mut buf).await?;
    }
    buf.truncate(content_len);
    Ok(Record {
        header,
        content: Bytes::from(buf),
    })
}

/// Encodes a name-value length: one byte below 128, otherwise four bytes
/// big-endian with the top bit set.
pub fn put_nv_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

/// Encodes one name-value pair.
pub fn put_nv_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_nv_len(buf, name.len());
    put_nv_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

fn read_nv_len(data: &mut &[u8]) -> Result<usize> {
    let first = *data
        .first()
        .ok_or_else(|| Error::Protocol("unexpected end of name-value data".into()))?;
    if first < 128 {
        *data = &data[1..];
        Ok(first as usize)
    } else {
        if data.len() < 4 {
            return Err(Error::Protocol("truncated 4-byte name-value length".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        Ok(len as usize)
    }
}

/// Decodes the name-value pairs of a Params content buffer, in wire order.
pub fn decode_nv_pairs(mut data: &[u8]) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data)?;
        let value_len = read_nv_len(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(Error::Protocol("truncated name-value pair".into()));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[name_len..name_len + value_len]).into_owned();
        data = &data[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Builds the 8-byte BeginRequest body: role, flags, five reserved bytes.
pub fn begin_request_body(role: Role, flags: u8) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[0..2].copy_from_slice(&role.as_u16().to_be_bytes());
    body[2] = flags;
    body
}

/// Parsed 8-byte EndRequest body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequest {
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() < 5 {
            return None;
        }
        Some(EndRequest {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        body[4] = self.protocol_status;
        body
    }
}

//! OD4 datagram framing and the protobuf subset it carries.
//!
//! A datagram is `0x0D 0xA4`, a 3-byte little-endian length and a protobuf
//! encoded envelope. Signed integers use ZigZag varints.

use bytes::Bytes;
use thiserror::Error;

use crate::source::Timestamp;

pub const OD4_HEADER: [u8; 2] = [0x0D, 0xA4];
const HEADER_LEN: usize = 5;
const MAX_PAYLOAD: usize = 0x00FF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram does not start with the OD4 header")]
    BadHeader,
    #[error("message truncated")]
    Truncated,
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    WireType(u8),
    #[error("payload of {0} bytes exceeds the OD4 length field")]
    TooLarge(usize),
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(WireError::Truncated)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(WireError::VarintOverflow);
        }
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl Field<'_> {
    fn as_u64(&self) -> u64 {
        match *self {
            Field::Varint(v) | Field::Fixed64(v) => v,
            Field::Fixed32(v) => u64::from(v),
            Field::Bytes(_) => 0,
        }
    }

    fn as_sint(&self) -> i64 {
        match *self {
            Field::Varint(v) => zigzag_decode(v),
            other => other.as_u64() as i64,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Field::Bytes(b) => b,
            _ => &[],
        }
    }
}

/// Iterates `(field number, value)` pairs of one message
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn field(&mut self) -> Result<(u32, Field<'a>), WireError> {
        let key = read_varint(self.buf, &mut self.pos)?;
        let number = (key >> 3) as u32;
        let field = match (key & 0x7) as u8 {
            0 => Field::Varint(read_varint(self.buf, &mut self.pos)?),
            1 => {
                let raw = self.take(8)?;
                let mut bytes = [0; 8];
                bytes.copy_from_slice(raw);
                Field::Fixed64(u64::from_le_bytes(bytes))
            }
            2 => {
                let len = read_varint(self.buf, &mut self.pos)?;
                Field::Bytes(self.take(usize::try_from(len).map_err(|_| WireError::Truncated)?)?)
            }
            5 => {
                let raw = self.take(4)?;
                let mut bytes = [0; 4];
                bytes.copy_from_slice(raw);
                Field::Fixed32(u32::from_le_bytes(bytes))
            }
            other => return Err(WireError::WireType(other)),
        };
        Ok((number, field))
    }
}

impl<'a> Iterator for FieldReader<'a> {
    type Item = Result<(u32, Field<'a>), WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let item = self.field();
        if item.is_err() {
            self.pos = self.buf.len();
        }
        Some(item)
    }
}

#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, number: u32, wire_type: u8) {
        write_varint((u64::from(number) << 3) | u64::from(wire_type), &mut self.buf);
    }

    pub fn uint(&mut self, number: u32, value: u64) -> &mut Self {
        self.key(number, 0);
        write_varint(value, &mut self.buf);
        self
    }

    pub fn sint(&mut self, number: u32, value: i64) -> &mut Self {
        self.uint(number, zigzag_encode(value))
    }

    pub fn bytes(&mut self, number: u32, value: &[u8]) -> &mut Self {
        self.key(number, 2);
        write_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

fn decode_timestamp(buf: &[u8]) -> Result<Timestamp, WireError> {
    let (mut seconds, mut micros) = (0, 0);
    for field in FieldReader::new(buf) {
        match field? {
            (1, value) => seconds = value.as_sint(),
            (2, value) => micros = value.as_sint(),
            _ => {}
        }
    }
    Ok(Timestamp::from_parts(seconds, micros))
}

fn encode_timestamp(timestamp: Timestamp) -> Vec<u8> {
    FieldWriter::new()
        .sint(1, timestamp.seconds())
        .sint(2, timestamp.subsec_micros())
        .finish()
}

/// Container every message on the bus travels in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub data_type: i32,
    pub serialized_data: Bytes,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub sample_time: Timestamp,
    pub sender_stamp: u32,
}

impl Envelope {
    pub fn new(data_type: i32, serialized_data: impl Into<Bytes>, sent: Timestamp) -> Self {
        Self {
            data_type,
            serialized_data: serialized_data.into(),
            sent,
            received: Timestamp::default(),
            sample_time: sent,
            sender_stamp: 0,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut envelope = Envelope::default();
        for field in FieldReader::new(buf) {
            match field? {
                (1, value) => envelope.data_type = value.as_sint() as i32,
                (2, value) => envelope.serialized_data = Bytes::copy_from_slice(value.as_bytes()),
                (3, value) => envelope.sent = decode_timestamp(value.as_bytes())?,
                (4, value) => envelope.received = decode_timestamp(value.as_bytes())?,
                (5, value) => envelope.sample_time = decode_timestamp(value.as_bytes())?,
                (6, value) => envelope.sender_stamp = value.as_u64() as u32,
                _ => {}
            }
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Vec<u8> {
        FieldWriter::new()
            .sint(1, i64::from(self.data_type))
            .bytes(2, &self.serialized_data)
            .bytes(3, &encode_timestamp(self.sent))
            .bytes(4, &encode_timestamp(self.received))
            .bytes(5, &encode_timestamp(self.sample_time))
            .uint(6, u64::from(self.sender_stamp))
            .finish()
    }

    /// Parse one framed datagram
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        if datagram[..2] != OD4_HEADER {
            return Err(WireError::BadHeader);
        }
        let len = usize::from(datagram[2])
            | usize::from(datagram[3]) << 8
            | usize::from(datagram[4]) << 16;
        let body = datagram
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or(WireError::Truncated)?;
        Self::decode(body)
    }

    pub fn to_datagram(&self) -> Result<Vec<u8>, WireError> {
        let body = self.encode();
        if body.len() > MAX_PAYLOAD {
            return Err(WireError::TooLarge(body.len()));
        }
        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        datagram.extend_from_slice(&OD4_HEADER);
        datagram.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
        datagram.extend_from_slice(&body);
        Ok(datagram)
    }
}

/// Compressed frame produced by the external encoder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedImage {
    pub fourcc: String,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl EncodedImage {
    /// Message type identifier on the bus
    pub const ID: i32 = 1055;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut image = EncodedImage::default();
        for field in FieldReader::new(buf) {
            match field? {
                (1, value) => image.fourcc = String::from_utf8_lossy(value.as_bytes()).into_owned(),
                (2, value) => image.width = value.as_u64() as u32,
                (3, value) => image.height = value.as_u64() as u32,
                (4, value) => image.data = Bytes::copy_from_slice(value.as_bytes()),
                _ => {}
            }
        }
        Ok(image)
    }

    pub fn encode(&self) -> Vec<u8> {
        FieldWriter::new()
            .bytes(1, self.fourcc.as_bytes())
            .uint(2, u64::from(self.width))
            .uint(3, u64::from(self.height))
            .bytes(4, &self.data)
            .finish()
    }

    /// Wrap into an envelope stamped with `sent`
    pub fn into_envelope(self, sent: Timestamp) -> Envelope {
        Envelope::new(Self::ID, self.encode(), sent)
    }
}

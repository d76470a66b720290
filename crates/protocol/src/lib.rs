#![forbid(unsafe_code)]

//! Wire-level building blocks shared by the message schemas and the broker:
//! zigzag varints, the v2 record-batch header, and the helpers the broker
//! uses to peek into and rewrite stored batches.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod api;
pub mod messages;

pub const CURRENT_RECORD_BATCH_MAGIC: i8 = 2;
pub const RECORD_BATCH_HEADER_LEN: usize = 61;

// Field offsets inside a v2 record-batch header.
const BASE_OFFSET_AT: usize = 0;
const BATCH_LENGTH_AT: usize = 8;
const LEADER_EPOCH_AT: usize = 12;
const MAGIC_AT: usize = 16;
const CRC_AT: usize = 17;
const ATTRIBUTES_AT: usize = 21;
const LAST_OFFSET_DELTA_AT: usize = 23;
const BASE_TIMESTAMP_AT: usize = 27;
const MAX_TIMESTAMP_AT: usize = 35;
const PRODUCER_ID_AT: usize = 43;
const PRODUCER_EPOCH_AT: usize = 51;
const BASE_SEQUENCE_AT: usize = 53;
const RECORDS_COUNT_AT: usize = 57;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Truncated,
    VarintOverflow,
    VarlongOverflow,
    InvalidVersion { api: &'static str, version: i16 },
    MissingRequiredField(&'static str),
    InvalidMagic(i8),
    InvalidBoolean(u8),
    InvalidCompactLength(u64),
    InvalidString,
    InvalidLength(i32),
    InvalidBatchLength(i32),
    InvalidRecordsCount(i32),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "ran out of input"),
            Self::VarintOverflow => write!(f, "varint does not fit in 32 bits"),
            Self::VarlongOverflow => write!(f, "varlong does not fit in 64 bits"),
            Self::InvalidVersion { api, version } => {
                write!(f, "{api} does not support version {version}")
            }
            Self::MissingRequiredField(field) => write!(f, "required field absent: {field}"),
            Self::InvalidMagic(magic) => write!(f, "record batch magic {magic} is not v2"),
            Self::InvalidBoolean(value) => write!(f, "boolean byte out of range: {value}"),
            Self::InvalidCompactLength(length) => write!(f, "bad compact length: {length}"),
            Self::InvalidString => write!(f, "string is not valid UTF-8"),
            Self::InvalidLength(length) => write!(f, "bad length prefix: {length}"),
            Self::InvalidBatchLength(length) => write!(f, "bad batch_length: {length}"),
            Self::InvalidRecordsCount(count) => write!(f, "bad records_count: {count}"),
        }
    }
}

impl Error for ProtocolError {}

/// The fixed 61-byte header every v2 record batch starts with.  Stored
/// batches are opaque to the broker except for this header: produce reads
/// the codec and record count out of it, fetch rewrites the base offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatchHeader {
    pub base_offset: i64,
    pub batch_length: i32,
    pub partition_leader_epoch: i32,
    pub magic: i8,
    pub crc: u32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records_count: i32,
}

impl RecordBatchHeader {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.magic != CURRENT_RECORD_BATCH_MAGIC {
            return Err(ProtocolError::InvalidMagic(self.magic));
        }
        if self.batch_length < 0 {
            return Err(ProtocolError::InvalidBatchLength(self.batch_length));
        }
        if self.records_count < 0 {
            return Err(ProtocolError::InvalidRecordsCount(self.records_count));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_BATCH_HEADER_LEN);
        out.extend_from_slice(&self.base_offset.to_be_bytes());
        out.extend_from_slice(&self.batch_length.to_be_bytes());
        out.extend_from_slice(&self.partition_leader_epoch.to_be_bytes());
        out.push(self.magic as u8);
        out.extend_from_slice(&self.crc.to_be_bytes());
        out.extend_from_slice(&self.attributes.to_be_bytes());
        out.extend_from_slice(&self.last_offset_delta.to_be_bytes());
        out.extend_from_slice(&self.base_timestamp.to_be_bytes());
        out.extend_from_slice(&self.max_timestamp.to_be_bytes());
        out.extend_from_slice(&self.producer_id.to_be_bytes());
        out.extend_from_slice(&self.producer_epoch.to_be_bytes());
        out.extend_from_slice(&self.base_sequence.to_be_bytes());
        out.extend_from_slice(&self.records_count.to_be_bytes());
        out
    }

    pub fn decode(batch: &[u8]) -> Result<Self, ProtocolError> {
        if batch.len() < RECORD_BATCH_HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        let header = Self {
            base_offset: be_i64(batch, BASE_OFFSET_AT),
            batch_length: be_i32(batch, BATCH_LENGTH_AT),
            partition_leader_epoch: be_i32(batch, LEADER_EPOCH_AT),
            magic: batch[MAGIC_AT] as i8,
            crc: be_i32(batch, CRC_AT) as u32,
            attributes: be_i16(batch, ATTRIBUTES_AT),
            last_offset_delta: be_i32(batch, LAST_OFFSET_DELTA_AT),
            base_timestamp: be_i64(batch, BASE_TIMESTAMP_AT),
            max_timestamp: be_i64(batch, MAX_TIMESTAMP_AT),
            producer_id: be_i64(batch, PRODUCER_ID_AT),
            producer_epoch: be_i16(batch, PRODUCER_EPOCH_AT),
            base_sequence: be_i32(batch, BASE_SEQUENCE_AT),
            records_count: be_i32(batch, RECORDS_COUNT_AT),
        };
        header.validate()?;
        Ok(header)
    }
}

/// Compression codec from attribute bits 0-2, or 0 (none) when the input is
/// too short to carry an attributes word.
pub fn compression_codec(batch: &[u8]) -> i8 {
    if batch.len() < ATTRIBUTES_AT + 2 {
        return 0;
    }
    (be_i16(batch, ATTRIBUTES_AT) & 0x07) as i8
}

/// Logical record count a batch claims to carry, or 0 for inputs shorter
/// than a full header.
pub fn records_count(batch: &[u8]) -> i32 {
    if batch.len() < RECORDS_COUNT_AT + 4 {
        return 0;
    }
    be_i32(batch, RECORDS_COUNT_AT)
}

/// Overwrite the base-offset field of a stored batch with the offset the
/// broker assigned, so consumers see broker offsets rather than whatever the
/// producer serialized.  Inputs shorter than the field are left alone.
pub fn patch_base_offset(batch: &mut [u8], base_offset: i64) {
    if batch.len() >= 8 {
        batch[BASE_OFFSET_AT..BASE_OFFSET_AT + 8].copy_from_slice(&base_offset.to_be_bytes());
    }
}

fn be_i16(bytes: &[u8], at: usize) -> i16 {
    let mut raw = [0_u8; 2];
    raw.copy_from_slice(&bytes[at..at + 2]);
    i16::from_be_bytes(raw)
}

fn be_i32(bytes: &[u8], at: usize) -> i32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    i32::from_be_bytes(raw)
}

fn be_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_be_bytes(raw)
}

// ── Varints ──────────────────────────────────────────────────────────────────
//
// Unsigned base-128 with the low seven bits first and the high bit marking
// continuation; signed values go through the zigzag mapping so small
// magnitudes stay short in either sign.

pub fn encode_varint(value: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    let zigzag = ((value << 1) ^ (value >> 31)) as u32;
    append_uvarint(&mut out, u64::from(zigzag));
    out
}

pub fn decode_varint(input: &[u8]) -> Result<(i32, usize), ProtocolError> {
    let (raw, read) = take_uvarint(input, 5, ProtocolError::VarintOverflow)?;
    let raw = u32::try_from(raw).map_err(|_| ProtocolError::VarintOverflow)?;
    Ok((((raw >> 1) as i32) ^ -((raw & 1) as i32), read))
}

pub fn encode_varlong(value: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    append_uvarint(&mut out, ((value << 1) ^ (value >> 63)) as u64);
    out
}

pub fn decode_varlong(input: &[u8]) -> Result<(i64, usize), ProtocolError> {
    let (raw, read) = take_uvarint(input, 10, ProtocolError::VarlongOverflow)?;
    Ok((((raw >> 1) as i64) ^ -((raw & 1) as i64), read))
}

pub(crate) fn append_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Shift-accumulating uvarint decoder shared by both widths.  `max_bytes`
/// bounds the encoding (5 for 32-bit, 10 for 64-bit); any continuation past
/// it, or bits spilling over 64, yields `overflow`.
pub(crate) fn take_uvarint(
    input: &[u8],
    max_bytes: usize,
    overflow: ProtocolError,
) -> Result<(u64, usize), ProtocolError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for index in 0..max_bytes {
        let Some(&byte) = input.get(index) else {
            return Err(ProtocolError::Truncated);
        };
        let bits = u64::from(byte & 0x7f);
        if shift >= 64 || (shift > 0 && bits.leading_zeros() < shift) {
            return Err(overflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
    }
    Err(overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_over_edge_values() {
        for value in [0, 1, -1, 63, -64, 300, -300, 8192, -8192, i32::MIN, i32::MAX] {
            let encoded = encode_varint(value);
            let (decoded, read) = decode_varint(&encoded).expect("decode varint");
            assert_eq!((decoded, read), (value, encoded.len()));
        }
    }

    #[test]
    fn varint_matches_kafka_reference_bytes() {
        assert_eq!(encode_varint(0), [0x00]);
        assert_eq!(encode_varint(-1), [0x01]);
        assert_eq!(encode_varint(1), [0x02]);
        assert_eq!(encode_varint(63), [0x7e]);
        assert_eq!(encode_varint(-64), [0x7f]);
        assert_eq!(encode_varint(64), [0x80, 0x01]);
        assert_eq!(encode_varint(-65), [0x81, 0x01]);
        assert_eq!(encode_varint(i32::MAX), [0xfe, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(encode_varint(i32::MIN), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn varlong_roundtrip_over_edge_values() {
        let values = [
            0,
            1,
            -1,
            63,
            -64,
            i64::from(i32::MAX),
            i64::from(i32::MIN),
            1 << 40,
            -(1 << 40),
            i64::MIN,
            i64::MAX,
        ];
        for value in values {
            let encoded = encode_varlong(value);
            let (decoded, read) = decode_varlong(&encoded).expect("decode varlong");
            assert_eq!((decoded, read), (value, encoded.len()));
        }
    }

    #[test]
    fn truncated_varint_is_detected() {
        assert_eq!(
            decode_varint(&[0x80, 0x80]).expect_err("truncated"),
            ProtocolError::Truncated
        );
        assert_eq!(decode_varint(&[]).expect_err("empty"), ProtocolError::Truncated);
    }

    #[test]
    fn oversized_varint_is_rejected() {
        // Six continuation bytes can never be a 32-bit varint.
        let err = decode_varint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).expect_err("overflow");
        assert_eq!(err, ProtocolError::VarintOverflow);
        // Five bytes whose top nibble spills past 32 bits.
        let err = decode_varint(&[0xff, 0xff, 0xff, 0xff, 0x1f]).expect_err("overflow");
        assert_eq!(err, ProtocolError::VarintOverflow);
    }

    #[test]
    fn oversized_varlong_is_rejected() {
        let err = decode_varlong(&[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01,
        ])
        .expect_err("overflow");
        assert_eq!(err, ProtocolError::VarlongOverflow);
        let err = decode_varlong(&[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02,
        ])
        .expect_err("tenth byte spills");
        assert_eq!(err, ProtocolError::VarlongOverflow);
    }

    fn sample_header() -> RecordBatchHeader {
        RecordBatchHeader {
            base_offset: 42,
            batch_length: 512,
            partition_leader_epoch: 0,
            magic: CURRENT_RECORD_BATCH_MAGIC,
            crc: 0xfeed_beef,
            attributes: 0b0000_0010,
            last_offset_delta: 9,
            base_timestamp: 1_700_000_000_000,
            max_timestamp: 1_700_000_000_999,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records_count: 10,
        }
    }

    #[test]
    fn batch_header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(encoded.len(), RECORD_BATCH_HEADER_LEN);
        assert_eq!(RecordBatchHeader::decode(&encoded).expect("decode"), header);
    }

    #[test]
    fn batch_header_rejects_wrong_magic() {
        let mut encoded = sample_header().encode();
        encoded[MAGIC_AT] = 1;
        assert_eq!(
            RecordBatchHeader::decode(&encoded).expect_err("bad magic"),
            ProtocolError::InvalidMagic(1)
        );
    }

    #[test]
    fn batch_header_rejects_short_input() {
        assert_eq!(
            RecordBatchHeader::decode(&[0_u8; 32]).expect_err("short"),
            ProtocolError::Truncated
        );
    }

    #[test]
    fn codec_lives_in_the_low_attribute_bits() {
        let mut header = sample_header();
        header.attributes = 0b0000_0100;
        assert_eq!(compression_codec(&header.encode()), 4);
        header.attributes = 0b0001_0011; // codec 3 plus an unrelated flag bit
        assert_eq!(compression_codec(&header.encode()), 3);
        assert_eq!(compression_codec(&[0_u8; 4]), 0);
    }

    #[test]
    fn records_count_sits_at_the_header_tail() {
        assert_eq!(records_count(&sample_header().encode()), 10);
        assert_eq!(records_count(&[0_u8; 16]), 0);
    }

    #[test]
    fn base_offset_patch_rewrites_in_place() {
        let mut encoded = sample_header().encode();
        patch_base_offset(&mut encoded, 1234);
        let decoded = RecordBatchHeader::decode(&encoded).expect("decode");
        assert_eq!(decoded.base_offset, 1234);

        let mut short = vec![1_u8, 2, 3];
        patch_base_offset(&mut short, 99);
        assert_eq!(short, vec![1, 2, 3]);
    }
}

#![forbid(unsafe_code)]

//! Versioned request decoders and response encoders for the fifteen APIs the
//! broker serves.  Every decoder and encoder is parameterized by the request's
//! api_version; fields are read and written in wire order with per-version
//! gates, switching to compact encodings past the API's flexible threshold.

use crate::api::ApiKey;
use crate::{append_uvarint, take_uvarint, ProtocolError};

/// Borrowing cursor over a request body.
pub struct Reader<'a> {
    input: &'a [u8],
    pub cursor: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.input[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.read_exact(1)?[0] as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_exact(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidBoolean(other)),
        }
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        let bytes = self.read_exact(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.read_exact(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let bytes = self.read_exact(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn read_uvarint(&mut self) -> Result<u64, ProtocolError> {
        let (value, read) = take_uvarint(
            &self.input[self.cursor..],
            10,
            ProtocolError::VarlongOverflow,
        )?;
        self.cursor += read;
        Ok(value)
    }
}

fn ensure_version(api: ApiKey, version: i16) -> Result<(), ProtocolError> {
    if api.supported_versions().contains(version) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidVersion {
            api: api.name(),
            version,
        })
    }
}

// ── Primitive writers ────────────────────────────────────────────────────────

pub(crate) fn write_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

pub(crate) fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_uvarint(out: &mut Vec<u8>, value: u64) {
    append_uvarint(out, value);
}

pub(crate) fn write_string(out: &mut Vec<u8>, value: &str, flexible: bool) {
    if flexible {
        write_uvarint(out, value.len() as u64 + 1);
        out.extend_from_slice(value.as_bytes());
    } else {
        write_i16(out, value.len() as i16);
        out.extend_from_slice(value.as_bytes());
    }
}

pub(crate) fn write_nullable_string(out: &mut Vec<u8>, value: Option<&str>, flexible: bool) {
    match value {
        None if flexible => write_uvarint(out, 0),
        None => write_i16(out, -1),
        Some(s) => write_string(out, s, flexible),
    }
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, value: &[u8], flexible: bool) {
    if flexible {
        write_uvarint(out, value.len() as u64 + 1);
        out.extend_from_slice(value);
    } else {
        write_i32(out, value.len() as i32);
        out.extend_from_slice(value);
    }
}

pub(crate) fn write_nullable_bytes(out: &mut Vec<u8>, value: Option<&[u8]>, flexible: bool) {
    match value {
        None if flexible => write_uvarint(out, 0),
        None => write_i32(out, -1),
        Some(bytes) => write_bytes(out, bytes, flexible),
    }
}

pub(crate) fn write_array_len(out: &mut Vec<u8>, len: usize, flexible: bool) {
    if flexible {
        write_uvarint(out, len as u64 + 1);
    } else {
        write_i32(out, len as i32);
    }
}

/// Tagged-field sections this broker emits are always empty.
pub(crate) fn write_empty_tagged_fields(out: &mut Vec<u8>) {
    write_uvarint(out, 0);
}

// ── Primitive readers ────────────────────────────────────────────────────────

/// Null strings decode as empty, matching how lenient the broker is with
/// clients that send -1 where the schema says non-null.
pub(crate) fn read_string(reader: &mut Reader<'_>, flexible: bool) -> Result<String, ProtocolError> {
    Ok(read_nullable_string(reader, flexible)?.unwrap_or_default())
}

pub(crate) fn read_nullable_string(
    reader: &mut Reader<'_>,
    flexible: bool,
) -> Result<Option<String>, ProtocolError> {
    let len = if flexible {
        let encoded = reader.read_uvarint()?;
        if encoded == 0 {
            return Ok(None);
        }
        usize::try_from(encoded - 1).map_err(|_| ProtocolError::InvalidCompactLength(encoded))?
    } else {
        let len = reader.read_i16()?;
        if len < 0 {
            return Ok(None);
        }
        len as usize
    };
    let raw = reader.read_exact(len)?;
    let value = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidString)?;
    Ok(Some(value.to_string()))
}

pub(crate) fn read_bytes(reader: &mut Reader<'_>, flexible: bool) -> Result<Vec<u8>, ProtocolError> {
    Ok(read_nullable_bytes(reader, flexible)?.unwrap_or_default())
}

pub(crate) fn read_nullable_bytes(
    reader: &mut Reader<'_>,
    flexible: bool,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let len = if flexible {
        let encoded = reader.read_uvarint()?;
        if encoded == 0 {
            return Ok(None);
        }
        usize::try_from(encoded - 1).map_err(|_| ProtocolError::InvalidCompactLength(encoded))?
    } else {
        let len = reader.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < -1 {
            return Err(ProtocolError::InvalidLength(len));
        }
        len as usize
    };
    Ok(Some(reader.read_exact(len)?.to_vec()))
}

pub(crate) fn read_array_len(
    reader: &mut Reader<'_>,
    flexible: bool,
) -> Result<usize, ProtocolError> {
    Ok(read_nullable_array_len(reader, flexible)?.unwrap_or(0))
}

pub(crate) fn read_nullable_array_len(
    reader: &mut Reader<'_>,
    flexible: bool,
) -> Result<Option<usize>, ProtocolError> {
    if flexible {
        let encoded = reader.read_uvarint()?;
        if encoded == 0 {
            return Ok(None);
        }
        usize::try_from(encoded - 1)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidCompactLength(encoded))
    } else {
        let len = reader.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < -1 {
            return Err(ProtocolError::InvalidLength(len));
        }
        Ok(Some(len as usize))
    }
}

pub(crate) fn skip_tagged_fields(reader: &mut Reader<'_>) -> Result<(), ProtocolError> {
    let count = reader.read_uvarint()?;
    for _ in 0..count {
        let _tag = reader.read_uvarint()?;
        let size = reader.read_uvarint()?;
        let size = usize::try_from(size).map_err(|_| ProtocolError::InvalidCompactLength(size))?;
        reader.read_exact(size)?;
    }
    Ok(())
}

// ── Headers ──────────────────────────────────────────────────────────────────

/// The common request header.  `api_key` stays raw so the dispatcher can
/// answer unknown keys with an error frame that still echoes the correlation
/// id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

impl RequestHeader {
    pub fn api(&self) -> Option<ApiKey> {
        ApiKey::from_code(self.api_key)
    }

    /// Decode a header, auto-detecting the flexible client-id encoding from
    /// the API kind and version.  Unknown API keys use the classic encoding.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut reader = Reader::new(input);
        let api_key = reader.read_i16()?;
        let api_version = reader.read_i16()?;
        let correlation_id = reader.read_i32()?;
        let flexible = ApiKey::from_code(api_key)
            .map(|api| api.is_flexible(api_version))
            .unwrap_or(false);
        let client_id = read_string(&mut reader, flexible)?;
        if flexible {
            skip_tagged_fields(&mut reader)?;
        }
        Ok((
            Self {
                api_key,
                api_version,
                correlation_id,
                client_id,
            },
            reader.cursor,
        ))
    }
}

/// Encode a response header.  `flexible` must come from
/// `ApiKey::response_header_is_flexible`, which bakes in the ApiVersions
/// exception.
pub fn encode_response_header(out: &mut Vec<u8>, correlation_id: i32, flexible: bool) {
    write_i32(out, correlation_id);
    if flexible {
        write_empty_tagged_fields(out);
    }
}

// ── ApiVersions (18) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiVersionsRequest {
    pub client_software_name: String,
    pub client_software_version: String,
}

impl ApiVersionsRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::ApiVersions, version)?;
        let mut reader = Reader::new(input);
        let mut decoded = Self::default();
        if version >= 3 {
            decoded.client_software_name = read_string(&mut reader, true)?;
            decoded.client_software_version = read_string(&mut reader, true)?;
            skip_tagged_fields(&mut reader)?;
        }
        Ok((decoded, reader.cursor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedApi {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

/// The version table advertised to clients, one entry per served API.
pub fn supported_apis() -> Vec<SupportedApi> {
    ApiKey::ALL
        .iter()
        .map(|api| {
            let range = api.supported_versions();
            SupportedApi {
                api_key: api.code(),
                min_version: range.low,
                max_version: range.high,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_keys: Vec<SupportedApi>,
    pub throttle_time_ms: i32,
}

impl ApiVersionsResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::ApiVersions, version)?;
        let flexible = ApiKey::ApiVersions.is_flexible(version);
        let mut out = Vec::new();
        write_i16(&mut out, self.error_code);
        write_array_len(&mut out, self.api_keys.len(), flexible);
        for api in &self.api_keys {
            write_i16(&mut out, api.api_key);
            write_i16(&mut out, api.min_version);
            write_i16(&mut out, api.max_version);
            if flexible {
                write_empty_tagged_fields(&mut out);
            }
        }
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        if flexible {
            write_empty_tagged_fields(&mut out);
        }
        Ok(out)
    }
}

// ── SaslHandshake (17) ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::SaslHandshake, version)?;
        let mut reader = Reader::new(input);
        let mechanism = read_string(&mut reader, false)?;
        Ok((Self { mechanism }, reader.cursor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslHandshakeResponse {
    pub error_code: i16,
    pub mechanisms: Vec<String>,
}

impl SaslHandshakeResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::SaslHandshake, version)?;
        let mut out = Vec::new();
        write_i16(&mut out, self.error_code);
        write_array_len(&mut out, self.mechanisms.len(), false);
        for mechanism in &self.mechanisms {
            write_string(&mut out, mechanism, false);
        }
        Ok(out)
    }
}

// ── SaslAuthenticate (36) ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslAuthenticateRequest {
    pub auth_bytes: Vec<u8>,
}

impl SaslAuthenticateRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::SaslAuthenticate, version)?;
        let mut reader = Reader::new(input);
        let auth_bytes = read_bytes(&mut reader, false)?;
        Ok((Self { auth_bytes }, reader.cursor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslAuthenticateResponse {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub auth_bytes: Option<Vec<u8>>,
}

impl SaslAuthenticateResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::SaslAuthenticate, version)?;
        let mut out = Vec::new();
        write_i16(&mut out, self.error_code);
        write_nullable_string(&mut out, self.error_message.as_deref(), false);
        write_nullable_bytes(&mut out, self.auth_bytes.as_deref(), false);
        Ok(out)
    }
}

// ── Metadata (3) ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRequest {
    /// `None` means "all topics".
    pub topics: Option<Vec<String>>,
    pub allow_auto_topic_creation: bool,
    pub include_cluster_authorized_operations: bool,
    pub include_topic_authorized_operations: bool,
}

impl MetadataRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::Metadata, version)?;
        let mut reader = Reader::new(input);
        let topics = match read_nullable_array_len(&mut reader, false)? {
            None => None,
            Some(count) => {
                let mut names = Vec::new();
                for _ in 0..count {
                    names.push(read_string(&mut reader, false)?);
                }
                Some(names)
            }
        };
        let allow_auto_topic_creation = if version >= 4 {
            reader.read_bool()?
        } else {
            false
        };
        let (include_cluster, include_topic) = if version >= 8 {
            (reader.read_bool()?, reader.read_bool()?)
        } else {
            (false, false)
        };
        Ok((
            Self {
                topics,
                allow_auto_topic_creation,
                include_cluster_authorized_operations: include_cluster,
                include_topic_authorized_operations: include_topic,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    pub error_code: i16,
    pub partition_index: i32,
    pub leader_id: i32,
    pub leader_epoch: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTopic {
    pub error_code: i16,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<MetadataPartition>,
}

/// Sentinel for "authorized operations were not requested".
const AUTHORIZED_OPERATIONS_OMITTED: i32 = i32::MIN;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataResponse {
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub topics: Vec<MetadataTopic>,
    pub include_cluster_authorized_operations: bool,
    pub include_topic_authorized_operations: bool,
}

impl MetadataResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::Metadata, version)?;
        let mut out = Vec::new();
        if version >= 3 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_array_len(&mut out, self.brokers.len(), false);
        for broker in &self.brokers {
            write_i32(&mut out, broker.node_id);
            write_string(&mut out, &broker.host, false);
            write_i32(&mut out, broker.port);
            if version >= 1 {
                write_nullable_string(&mut out, broker.rack.as_deref(), false);
            }
        }
        if version >= 2 {
            write_nullable_string(&mut out, self.cluster_id.as_deref(), false);
        }
        if version >= 1 {
            write_i32(&mut out, self.controller_id);
        }
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_i16(&mut out, topic.error_code);
            write_string(&mut out, &topic.name, false);
            if version >= 1 {
                write_bool(&mut out, topic.is_internal);
            }
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i16(&mut out, partition.error_code);
                write_i32(&mut out, partition.partition_index);
                write_i32(&mut out, partition.leader_id);
                if version >= 7 {
                    write_i32(&mut out, partition.leader_epoch);
                }
                write_array_len(&mut out, partition.replica_nodes.len(), false);
                for node in &partition.replica_nodes {
                    write_i32(&mut out, *node);
                }
                write_array_len(&mut out, partition.isr_nodes.len(), false);
                for node in &partition.isr_nodes {
                    write_i32(&mut out, *node);
                }
                if version >= 5 {
                    write_array_len(&mut out, partition.offline_replicas.len(), false);
                    for node in &partition.offline_replicas {
                        write_i32(&mut out, *node);
                    }
                }
            }
            if version >= 8 {
                let ops = if self.include_topic_authorized_operations {
                    0
                } else {
                    AUTHORIZED_OPERATIONS_OMITTED
                };
                write_i32(&mut out, ops);
            }
        }
        if version >= 8 {
            let ops = if self.include_cluster_authorized_operations {
                0
            } else {
                AUTHORIZED_OPERATIONS_OMITTED
            };
            write_i32(&mut out, ops);
        }
        Ok(out)
    }
}

// ── CreateTopics (19) ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateTopicsRequestTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    pub assignments: Vec<(i32, Vec<i32>)>,
    pub configs: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateTopicsRequest {
    pub topics: Vec<CreateTopicsRequestTopic>,
    pub timeout_ms: i32,
    pub validate_only: bool,
}

impl CreateTopicsRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::CreateTopics, version)?;
        let flexible = ApiKey::CreateTopics.is_flexible(version);
        let mut reader = Reader::new(input);

        let topic_count = read_array_len(&mut reader, flexible)?;
        let mut topics = Vec::new();
        for _ in 0..topic_count {
            let name = read_string(&mut reader, flexible)?;
            let num_partitions = reader.read_i32()?;
            let replication_factor = reader.read_i16()?;

            let assignment_count = read_array_len(&mut reader, flexible)?;
            let mut assignments = Vec::new();
            for _ in 0..assignment_count {
                let partition = reader.read_i32()?;
                let broker_count = read_array_len(&mut reader, flexible)?;
                let mut brokers = Vec::new();
                for _ in 0..broker_count {
                    brokers.push(reader.read_i32()?);
                }
                if flexible {
                    skip_tagged_fields(&mut reader)?;
                }
                assignments.push((partition, brokers));
            }

            let config_count = read_array_len(&mut reader, flexible)?;
            let mut configs = Vec::new();
            for _ in 0..config_count {
                let config_name = read_string(&mut reader, flexible)?;
                let value = read_nullable_string(&mut reader, flexible)?;
                if flexible {
                    skip_tagged_fields(&mut reader)?;
                }
                configs.push((config_name, value));
            }

            if flexible {
                skip_tagged_fields(&mut reader)?;
            }
            topics.push(CreateTopicsRequestTopic {
                name,
                num_partitions,
                replication_factor,
                assignments,
                configs,
            });
        }

        let timeout_ms = reader.read_i32()?;
        let validate_only = if version >= 1 { reader.read_bool()? } else { false };
        if flexible {
            skip_tagged_fields(&mut reader)?;
        }
        Ok((
            Self {
                topics,
                timeout_ms,
                validate_only,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTopicsResponseTopic {
    pub name: String,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub num_partitions: i32,
    pub replication_factor: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateTopicsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<CreateTopicsResponseTopic>,
}

impl CreateTopicsResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::CreateTopics, version)?;
        let flexible = ApiKey::CreateTopics.is_flexible(version);
        let mut out = Vec::new();
        if version >= 2 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_array_len(&mut out, self.topics.len(), flexible);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, flexible);
            write_i16(&mut out, topic.error_code);
            if version >= 1 {
                write_nullable_string(&mut out, topic.error_message.as_deref(), flexible);
            }
            if version >= 5 {
                write_i32(&mut out, topic.num_partitions);
                write_i16(&mut out, topic.replication_factor);
                // Empty per-topic config list.
                write_array_len(&mut out, 0, true);
                write_empty_tagged_fields(&mut out);
            }
        }
        if flexible {
            write_empty_tagged_fields(&mut out);
        }
        Ok(out)
    }
}

// ── Produce (0) ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceRequestPartition {
    pub index: i32,
    pub records: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceRequestTopic {
    pub name: String,
    pub partitions: Vec<ProduceRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceRequestTopic>,
}

impl ProduceRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::Produce, version)?;
        let mut reader = Reader::new(input);
        let transactional_id = if version >= 3 {
            read_nullable_string(&mut reader, false)?
        } else {
            None
        };
        let acks = reader.read_i16()?;
        let timeout_ms = reader.read_i32()?;
        let topic_count = read_array_len(&mut reader, false)?;
        let mut topics = Vec::new();
        for _ in 0..topic_count {
            let name = read_string(&mut reader, false)?;
            let partition_count = read_array_len(&mut reader, false)?;
            let mut partitions = Vec::new();
            for _ in 0..partition_count {
                let index = reader.read_i32()?;
                let records = read_nullable_bytes(&mut reader, false)?;
                partitions.push(ProduceRequestPartition { index, records });
            }
            topics.push(ProduceRequestTopic { name, partitions });
        }
        Ok((
            Self {
                transactional_id,
                acks,
                timeout_ms,
                topics,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponsePartition {
    pub index: i32,
    pub error_code: i16,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
    pub log_start_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponseTopic {
    pub name: String,
    pub partitions: Vec<ProduceResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceResponseTopic>,
    pub throttle_time_ms: i32,
}

impl ProduceResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::Produce, version)?;
        let mut out = Vec::new();
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, false);
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i32(&mut out, partition.index);
                write_i16(&mut out, partition.error_code);
                write_i64(&mut out, partition.base_offset);
                if version >= 2 {
                    write_i64(&mut out, partition.log_append_time_ms);
                }
                if version >= 5 {
                    write_i64(&mut out, partition.log_start_offset);
                }
                if version >= 8 {
                    // record_errors (empty) + error_message (null)
                    write_array_len(&mut out, 0, false);
                    write_nullable_string(&mut out, None, false);
                }
            }
        }
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        Ok(out)
    }
}

// ── Fetch (1) ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchRequestPartition {
    pub index: i32,
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchRequestTopic {
    pub name: String,
    pub partitions: Vec<FetchRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    pub session_id: i32,
    pub session_epoch: i32,
    pub topics: Vec<FetchRequestTopic>,
    pub rack_id: String,
}

impl FetchRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::Fetch, version)?;
        let mut reader = Reader::new(input);
        let replica_id = reader.read_i32()?;
        let max_wait_ms = reader.read_i32()?;
        let min_bytes = reader.read_i32()?;
        let max_bytes = if version >= 3 {
            reader.read_i32()?
        } else {
            i32::MAX
        };
        let isolation_level = if version >= 4 { reader.read_i8()? } else { 0 };
        let (session_id, session_epoch) = if version >= 7 {
            (reader.read_i32()?, reader.read_i32()?)
        } else {
            (0, -1)
        };

        let topic_count = read_array_len(&mut reader, false)?;
        let mut topics = Vec::new();
        for _ in 0..topic_count {
            let name = read_string(&mut reader, false)?;
            let partition_count = read_array_len(&mut reader, false)?;
            let mut partitions = Vec::new();
            for _ in 0..partition_count {
                let index = reader.read_i32()?;
                let current_leader_epoch = if version >= 9 { reader.read_i32()? } else { -1 };
                let fetch_offset = reader.read_i64()?;
                let log_start_offset = if version >= 5 { reader.read_i64()? } else { -1 };
                let partition_max_bytes = reader.read_i32()?;
                partitions.push(FetchRequestPartition {
                    index,
                    current_leader_epoch,
                    fetch_offset,
                    log_start_offset,
                    partition_max_bytes,
                });
            }
            topics.push(FetchRequestTopic { name, partitions });
        }

        if version >= 7 {
            // Forgotten topics, decoded and discarded (no fetch sessions).
            let forgotten_count = read_array_len(&mut reader, false)?;
            for _ in 0..forgotten_count {
                read_string(&mut reader, false)?;
                let partition_count = read_array_len(&mut reader, false)?;
                for _ in 0..partition_count {
                    reader.read_i32()?;
                }
            }
        }
        let rack_id = if version >= 11 {
            read_string(&mut reader, false)?
        } else {
            String::new()
        };

        Ok((
            Self {
                replica_id,
                max_wait_ms,
                min_bytes,
                max_bytes,
                isolation_level,
                session_id,
                session_epoch,
                topics,
                rack_id,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchResponsePartition {
    pub index: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    pub preferred_read_replica: i32,
    pub records: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchResponseTopic {
    pub name: String,
    pub partitions: Vec<FetchResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub session_id: i32,
    pub topics: Vec<FetchResponseTopic>,
}

impl FetchResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::Fetch, version)?;
        let mut out = Vec::new();
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        if version >= 7 {
            write_i16(&mut out, self.error_code);
            write_i32(&mut out, self.session_id);
        }
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, false);
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i32(&mut out, partition.index);
                write_i16(&mut out, partition.error_code);
                write_i64(&mut out, partition.high_watermark);
                if version >= 4 {
                    write_i64(&mut out, partition.last_stable_offset);
                }
                if version >= 5 {
                    write_i64(&mut out, partition.log_start_offset);
                }
                if version >= 4 {
                    // aborted_transactions, always empty.
                    write_array_len(&mut out, 0, false);
                }
                if version >= 11 {
                    write_i32(&mut out, partition.preferred_read_replica);
                }
                write_nullable_bytes(&mut out, partition.records.as_deref(), false);
            }
        }
        Ok(out)
    }
}

// ── ListOffsets (2) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsRequestPartition {
    pub partition_index: i32,
    pub current_leader_epoch: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsRequestTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub isolation_level: i8,
    pub topics: Vec<ListOffsetsRequestTopic>,
}

impl ListOffsetsRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::ListOffsets, version)?;
        let mut reader = Reader::new(input);
        let replica_id = reader.read_i32()?;
        let isolation_level = if version >= 2 { reader.read_i8()? } else { 0 };
        let topic_count = read_array_len(&mut reader, false)?;
        let mut topics = Vec::new();
        for _ in 0..topic_count {
            let name = read_string(&mut reader, false)?;
            let partition_count = read_array_len(&mut reader, false)?;
            let mut partitions = Vec::new();
            for _ in 0..partition_count {
                let partition_index = reader.read_i32()?;
                let current_leader_epoch = if version >= 4 { reader.read_i32()? } else { -1 };
                let timestamp = reader.read_i64()?;
                if version == 0 {
                    reader.read_i32()?; // max_num_offsets, ignored
                }
                partitions.push(ListOffsetsRequestPartition {
                    partition_index,
                    current_leader_epoch,
                    timestamp,
                });
            }
            topics.push(ListOffsetsRequestTopic { name, partitions });
        }
        Ok((
            Self {
                replica_id,
                isolation_level,
                topics,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsResponsePartition {
    pub partition_index: i32,
    pub error_code: i16,
    pub timestamp: i64,
    pub offset: i64,
    pub leader_epoch: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsResponseTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOffsetsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsResponseTopic>,
}

impl ListOffsetsResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::ListOffsets, version)?;
        let mut out = Vec::new();
        if version >= 2 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, false);
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i32(&mut out, partition.partition_index);
                write_i16(&mut out, partition.error_code);
                if version == 0 {
                    // v0 answers with an old-style offset array.
                    write_array_len(&mut out, 1, false);
                    write_i64(&mut out, partition.offset);
                } else {
                    write_i64(&mut out, partition.timestamp);
                    write_i64(&mut out, partition.offset);
                    if version >= 4 {
                        write_i32(&mut out, partition.leader_epoch);
                    }
                }
            }
        }
        Ok(out)
    }
}

// ── FindCoordinator (10) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindCoordinatorRequest {
    pub key: String,
    pub key_type: i8,
}

impl FindCoordinatorRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::FindCoordinator, version)?;
        let flexible = ApiKey::FindCoordinator.is_flexible(version);
        let mut reader = Reader::new(input);
        let key = read_string(&mut reader, flexible)?;
        let key_type = if version >= 1 { reader.read_i8()? } else { 0 };
        if flexible {
            skip_tagged_fields(&mut reader)?;
        }
        Ok((Self { key, key_type }, reader.cursor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindCoordinatorResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl FindCoordinatorResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::FindCoordinator, version)?;
        let flexible = ApiKey::FindCoordinator.is_flexible(version);
        let mut out = Vec::new();
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_i16(&mut out, self.error_code);
        if version >= 1 {
            write_nullable_string(&mut out, self.error_message.as_deref(), flexible);
        }
        write_i32(&mut out, self.node_id);
        write_string(&mut out, &self.host, flexible);
        write_i32(&mut out, self.port);
        if flexible {
            write_empty_tagged_fields(&mut out);
        }
        Ok(out)
    }
}

// ── JoinGroup (11) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinGroupRequestProtocol {
    pub name: String,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub protocol_type: String,
    pub protocols: Vec<JoinGroupRequestProtocol>,
}

impl JoinGroupRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::JoinGroup, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let session_timeout_ms = reader.read_i32()?;
        let rebalance_timeout_ms = if version >= 1 {
            reader.read_i32()?
        } else {
            session_timeout_ms
        };
        let member_id = read_string(&mut reader, false)?;
        let group_instance_id = if version >= 5 {
            read_nullable_string(&mut reader, false)?
        } else {
            None
        };
        let protocol_type = read_string(&mut reader, false)?;
        let protocol_count = read_array_len(&mut reader, false)?;
        let mut protocols = Vec::new();
        for _ in 0..protocol_count {
            let name = read_string(&mut reader, false)?;
            let metadata = read_bytes(&mut reader, false)?;
            protocols.push(JoinGroupRequestProtocol { name, metadata });
        }
        Ok((
            Self {
                group_id,
                session_timeout_ms,
                rebalance_timeout_ms,
                member_id,
                group_instance_id,
                protocol_type,
                protocols,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinGroupResponseMember {
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub generation_id: i32,
    pub protocol_name: String,
    pub leader: String,
    pub member_id: String,
    pub members: Vec<JoinGroupResponseMember>,
}

impl JoinGroupResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::JoinGroup, version)?;
        let mut out = Vec::new();
        if version >= 2 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_i16(&mut out, self.error_code);
        write_i32(&mut out, self.generation_id);
        write_string(&mut out, &self.protocol_name, false);
        write_string(&mut out, &self.leader, false);
        write_string(&mut out, &self.member_id, false);
        write_array_len(&mut out, self.members.len(), false);
        for member in &self.members {
            write_string(&mut out, &member.member_id, false);
            if version >= 5 {
                write_nullable_string(&mut out, member.group_instance_id.as_deref(), false);
            }
            write_bytes(&mut out, &member.metadata, false);
        }
        Ok(out)
    }
}

// ── SyncGroup (14) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncGroupRequestAssignment {
    pub member_id: String,
    pub assignment: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub assignments: Vec<SyncGroupRequestAssignment>,
}

impl SyncGroupRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::SyncGroup, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let generation_id = reader.read_i32()?;
        let member_id = read_string(&mut reader, false)?;
        let group_instance_id = if version >= 3 {
            read_nullable_string(&mut reader, false)?
        } else {
            None
        };
        let assignment_count = read_array_len(&mut reader, false)?;
        let mut assignments = Vec::new();
        for _ in 0..assignment_count {
            let assignment_member = read_string(&mut reader, false)?;
            let assignment = read_bytes(&mut reader, false)?;
            assignments.push(SyncGroupRequestAssignment {
                member_id: assignment_member,
                assignment,
            });
        }
        Ok((
            Self {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
                assignments,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub assignment: Vec<u8>,
}

impl SyncGroupResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::SyncGroup, version)?;
        let mut out = Vec::new();
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_i16(&mut out, self.error_code);
        write_bytes(&mut out, &self.assignment, false);
        Ok(out)
    }
}

// ── Heartbeat (12) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
}

impl HeartbeatRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::Heartbeat, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let generation_id = reader.read_i32()?;
        let member_id = read_string(&mut reader, false)?;
        let group_instance_id = if version >= 3 {
            read_nullable_string(&mut reader, false)?
        } else {
            None
        };
        Ok((
            Self {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartbeatResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
}

impl HeartbeatResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::Heartbeat, version)?;
        let mut out = Vec::new();
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_i16(&mut out, self.error_code);
        Ok(out)
    }
}

// ── LeaveGroup (13) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaveGroupRequestMember {
    pub member_id: String,
    pub group_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub members: Vec<LeaveGroupRequestMember>,
}

impl LeaveGroupRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::LeaveGroup, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let members = if version <= 2 {
            let member_id = read_string(&mut reader, false)?;
            vec![LeaveGroupRequestMember {
                member_id,
                group_instance_id: None,
            }]
        } else {
            let count = read_array_len(&mut reader, false)?;
            let mut members = Vec::new();
            for _ in 0..count {
                let member_id = read_string(&mut reader, false)?;
                let group_instance_id = read_nullable_string(&mut reader, false)?;
                members.push(LeaveGroupRequestMember {
                    member_id,
                    group_instance_id,
                });
            }
            members
        };
        Ok((Self { group_id, members }, reader.cursor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaveGroupResponseMember {
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaveGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub members: Vec<LeaveGroupResponseMember>,
}

impl LeaveGroupResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::LeaveGroup, version)?;
        let mut out = Vec::new();
        if version >= 1 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_i16(&mut out, self.error_code);
        if version >= 3 {
            write_array_len(&mut out, self.members.len(), false);
            for member in &self.members {
                write_string(&mut out, &member.member_id, false);
                write_nullable_string(&mut out, member.group_instance_id.as_deref(), false);
                write_i16(&mut out, member.error_code);
            }
        }
        Ok(out)
    }
}

// ── OffsetCommit (8) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitRequestPartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_leader_epoch: i32,
    pub commit_timestamp: i64,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitRequestTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitRequestPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitRequestTopic>,
}

impl OffsetCommitRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::OffsetCommit, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let (generation_id, member_id) = if version >= 1 {
            (reader.read_i32()?, read_string(&mut reader, false)?)
        } else {
            (-1, String::new())
        };
        let retention_time_ms = if (2..=4).contains(&version) {
            reader.read_i64()?
        } else {
            -1
        };
        let group_instance_id = if version >= 7 {
            read_nullable_string(&mut reader, false)?
        } else {
            None
        };
        let topic_count = read_array_len(&mut reader, false)?;
        let mut topics = Vec::new();
        for _ in 0..topic_count {
            let name = read_string(&mut reader, false)?;
            let partition_count = read_array_len(&mut reader, false)?;
            let mut partitions = Vec::new();
            for _ in 0..partition_count {
                let partition_index = reader.read_i32()?;
                let committed_offset = reader.read_i64()?;
                let committed_leader_epoch = if version >= 6 { reader.read_i32()? } else { -1 };
                let commit_timestamp = if version == 1 { reader.read_i64()? } else { -1 };
                let metadata = read_nullable_string(&mut reader, false)?;
                partitions.push(OffsetCommitRequestPartition {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    commit_timestamp,
                    metadata,
                });
            }
            topics.push(OffsetCommitRequestTopic { name, partitions });
        }
        Ok((
            Self {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
                retention_time_ms,
                topics,
            },
            reader.cursor,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitResponsePartition {
    pub partition_index: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitResponseTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetCommitResponseTopic>,
}

impl OffsetCommitResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::OffsetCommit, version)?;
        let mut out = Vec::new();
        if version >= 3 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, false);
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i32(&mut out, partition.partition_index);
                write_i16(&mut out, partition.error_code);
            }
        }
        Ok(out)
    }
}

// ── OffsetFetch (9) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetFetchRequestTopic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    /// `None` means "all committed topics" (v2+ null array).
    pub topics: Option<Vec<OffsetFetchRequestTopic>>,
}

impl OffsetFetchRequest {
    pub fn decode(version: i16, input: &[u8]) -> Result<(Self, usize), ProtocolError> {
        ensure_version(ApiKey::OffsetFetch, version)?;
        let mut reader = Reader::new(input);
        let group_id = read_string(&mut reader, false)?;
        let topics = match read_nullable_array_len(&mut reader, false)? {
            None => None,
            Some(count) => {
                let mut topics = Vec::new();
                for _ in 0..count {
                    let name = read_string(&mut reader, false)?;
                    let partition_count = read_array_len(&mut reader, false)?;
                    let mut partition_indexes = Vec::new();
                    for _ in 0..partition_count {
                        partition_indexes.push(reader.read_i32()?);
                    }
                    topics.push(OffsetFetchRequestTopic {
                        name,
                        partition_indexes,
                    });
                }
                Some(topics)
            }
        };
        Ok((Self { group_id, topics }, reader.cursor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetFetchResponsePartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_leader_epoch: i32,
    pub metadata: Option<String>,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetFetchResponseTopic {
    pub name: String,
    pub partitions: Vec<OffsetFetchResponsePartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetFetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetFetchResponseTopic>,
    pub error_code: i16,
}

impl OffsetFetchResponse {
    pub fn encode(&self, version: i16) -> Result<Vec<u8>, ProtocolError> {
        ensure_version(ApiKey::OffsetFetch, version)?;
        let mut out = Vec::new();
        if version >= 3 {
            write_i32(&mut out, self.throttle_time_ms);
        }
        write_array_len(&mut out, self.topics.len(), false);
        for topic in &self.topics {
            write_string(&mut out, &topic.name, false);
            write_array_len(&mut out, topic.partitions.len(), false);
            for partition in &topic.partitions {
                write_i32(&mut out, partition.partition_index);
                write_i64(&mut out, partition.committed_offset);
                if version >= 5 {
                    write_i32(&mut out, partition.committed_leader_epoch);
                }
                write_nullable_string(&mut out, partition.metadata.as_deref(), false);
                write_i16(&mut out, partition.error_code);
            }
        }
        if version >= 2 {
            write_i16(&mut out, self.error_code);
        }
        Ok(out)
    }
}

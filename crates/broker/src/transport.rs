use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use monolog_protocol::api::{
    ApiKey, ERROR_COORDINATOR_NOT_AVAILABLE, ERROR_NONE, ERROR_SASL_AUTHENTICATION_FAILED,
    ERROR_TOPIC_ALREADY_EXISTS, ERROR_UNKNOWN_MEMBER_ID, ERROR_UNKNOWN_TOPIC_OR_PARTITION,
    ERROR_UNSUPPORTED_SASL_MECHANISM, ERROR_UNSUPPORTED_VERSION, OFFSET_EARLIEST, OFFSET_LATEST,
};
use monolog_protocol::messages::{
    encode_response_header, supported_apis, ApiVersionsRequest, ApiVersionsResponse,
    CreateTopicsRequest, CreateTopicsResponse, CreateTopicsResponseTopic, FetchRequest,
    FetchRequestPartition, FetchResponse, FetchResponsePartition, FetchResponseTopic,
    FindCoordinatorRequest, FindCoordinatorResponse, HeartbeatRequest, HeartbeatResponse,
    JoinGroupRequest, JoinGroupResponse, JoinGroupResponseMember, LeaveGroupRequest,
    LeaveGroupResponse, LeaveGroupResponseMember, ListOffsetsRequest, ListOffsetsResponse,
    ListOffsetsResponsePartition, ListOffsetsResponseTopic, MetadataBroker, MetadataPartition,
    MetadataRequest, MetadataResponse, MetadataTopic, OffsetCommitRequest, OffsetCommitResponse,
    OffsetCommitResponsePartition, OffsetCommitResponseTopic, OffsetFetchRequest,
    OffsetFetchResponse, OffsetFetchResponsePartition, OffsetFetchResponseTopic, ProduceRequest,
    ProduceResponse, ProduceResponsePartition, ProduceResponseTopic, RequestHeader,
    SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
    SaslHandshakeResponse, SupportedApi, SyncGroupRequest, SyncGroupResponse,
};
use monolog_protocol::{patch_base_offset, ProtocolError};
use monolog_storage::StoredBatch;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::metrics::TransportMetrics;
use crate::pending::PendingFetch;
use crate::security;

pub const CLUSTER_ID: &str = "monolog-cluster";
pub const NODE_ID: i32 = 0;

/// Upper bound on stored rows returned by one fetch, on top of the byte
/// budget.
pub const FETCH_MAX_BATCHES: usize = 100;

#[derive(Debug)]
pub enum TransportError {
    Io {
        operation: &'static str,
        message: String,
    },
    FrameTooLarge {
        size: usize,
        max_size: usize,
    },
    InvalidFrameSize(i32),
    Protocol(ProtocolError),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { operation, message } => write!(f, "{operation}: {message}"),
            Self::FrameTooLarge { size, max_size } => {
                write!(f, "frame of {size} bytes exceeds limit {max_size}")
            }
            Self::InvalidFrameSize(size) => write!(f, "invalid frame size: {size}"),
            Self::Protocol(err) => write!(f, "protocol: {err}"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl TransportError {
    pub(crate) fn io(operation: &'static str, err: std::io::Error) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }
}

/// Per-connection state threaded through the dispatcher.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub id: u64,
    pub authenticated: bool,
}

impl ConnectionState {
    pub fn new(id: u64, authenticated: bool) -> Self {
        Self { id, authenticated }
    }
}

/// What the dispatcher produced for one frame: a wire-ready response, or
/// nothing yet because the fetch was parked and its response slot will be
/// filled by the scheduler.
#[derive(Debug)]
pub enum Dispatch {
    Response(Vec<u8>),
    Parked,
}

/// Decode → engine → encode for every frame.  One instance is shared by all
/// connections; per-connection state travels in [`ConnectionState`].
pub struct Transport {
    engine: Arc<Engine>,
    metrics: TransportMetrics,
    host: String,
    port: i32,
    auth_token: Option<String>,
    max_fetch_bytes: usize,
}

impl Transport {
    pub fn new(engine: Arc<Engine>, metrics: TransportMetrics, config: &Config) -> Self {
        let (host, port) = config.advertised_host_port();
        Self {
            engine,
            metrics,
            host,
            port,
            auth_token: config.auth_token.clone(),
            max_fetch_bytes: config.limits.max_fetch_bytes,
        }
    }

    /// Whether fresh connections start authenticated (no token configured).
    pub fn auth_disabled(&self) -> bool {
        self.auth_token.is_none()
    }

    /// Handle one request frame.  Protocol-level failures (malformed header
    /// or body) surface as errors and close the connection; semantic failures
    /// become error codes inside a normal response.
    pub fn process_frame(
        &self,
        frame: &[u8],
        connection: &mut ConnectionState,
        response_seq: u64,
        completion: &mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<Dispatch, TransportError> {
        let (header, consumed) = RequestHeader::decode(frame)?;
        let body = &frame[consumed..];
        self.metrics.record_request(header.api_key);

        let Some(api) = header.api() else {
            warn!(api_key = header.api_key, "unsupported api key");
            return Ok(Dispatch::Response(error_frame(
                header.correlation_id,
                ERROR_UNSUPPORTED_VERSION,
            )));
        };
        if !api.supported_versions().contains(header.api_version) {
            warn!(
                api = api.name(),
                version = header.api_version,
                "unsupported api version"
            );
            return Ok(Dispatch::Response(error_frame(
                header.correlation_id,
                ERROR_UNSUPPORTED_VERSION,
            )));
        }

        if !connection.authenticated && !auth_exempt(api) {
            // The client may retry after authenticating; keep the connection.
            return Ok(Dispatch::Response(error_frame(
                header.correlation_id,
                ERROR_SASL_AUTHENTICATION_FAILED,
            )));
        }

        debug!(
            api = api.name(),
            version = header.api_version,
            correlation_id = header.correlation_id,
            client_id = %header.client_id,
            "request"
        );

        let response = match api {
            ApiKey::ApiVersions => self.handle_api_versions(&header, body)?,
            ApiKey::SaslHandshake => self.handle_sasl_handshake(&header, body)?,
            ApiKey::SaslAuthenticate => self.handle_sasl_authenticate(&header, body, connection)?,
            ApiKey::Metadata => self.handle_metadata(&header, body)?,
            ApiKey::CreateTopics => self.handle_create_topics(&header, body)?,
            ApiKey::Produce => self.handle_produce(&header, body)?,
            ApiKey::Fetch => {
                let dispatch =
                    self.handle_fetch(&header, body, connection, response_seq, completion)?;
                if matches!(dispatch, Dispatch::Response(_)) {
                    self.metrics.record_response(header.api_key);
                }
                return Ok(dispatch);
            }
            ApiKey::ListOffsets => self.handle_list_offsets(&header, body)?,
            ApiKey::FindCoordinator => self.handle_find_coordinator(&header, body)?,
            ApiKey::JoinGroup => self.handle_join_group(&header, body)?,
            ApiKey::SyncGroup => self.handle_sync_group(&header, body)?,
            ApiKey::Heartbeat => self.handle_heartbeat(&header, body)?,
            ApiKey::LeaveGroup => self.handle_leave_group(&header, body)?,
            ApiKey::OffsetCommit => self.handle_offset_commit(&header, body)?,
            ApiKey::OffsetFetch => self.handle_offset_fetch(&header, body)?,
        };
        self.metrics.record_response(header.api_key);
        Ok(Dispatch::Response(finish_frame(
            &header,
            api,
            response,
        )))
    }

    // ── Handlers ─────────────────────────────────────────────────────────

    fn handle_api_versions(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        ApiVersionsRequest::decode(header.api_version, body)?;
        let response = ApiVersionsResponse {
            error_code: ERROR_NONE,
            api_keys: supported_apis(),
            throttle_time_ms: 0,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_sasl_handshake(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = SaslHandshakeRequest::decode(header.api_version, body)?;
        let error_code = if request.mechanism == security::MECHANISM_PLAIN {
            ERROR_NONE
        } else {
            warn!(mechanism = %request.mechanism, "unsupported sasl mechanism");
            ERROR_UNSUPPORTED_SASL_MECHANISM
        };
        let response = SaslHandshakeResponse {
            error_code,
            mechanisms: vec![security::MECHANISM_PLAIN.to_string()],
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_sasl_authenticate(
        &self,
        header: &RequestHeader,
        body: &[u8],
        connection: &mut ConnectionState,
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = SaslAuthenticateRequest::decode(header.api_version, body)?;
        let accepted = match (&self.auth_token, security::parse_plain(&request.auth_bytes)) {
            (None, _) => true,
            (Some(token), Some((_user, password))) => security::token_matches(token, &password),
            (Some(_), None) => false,
        };
        let response = if accepted {
            connection.authenticated = true;
            SaslAuthenticateResponse {
                error_code: ERROR_NONE,
                error_message: None,
                auth_bytes: None,
            }
        } else {
            warn!(connection = connection.id, "sasl authentication failed");
            SaslAuthenticateResponse {
                error_code: ERROR_SASL_AUTHENTICATION_FAILED,
                error_message: Some("Authentication failed".to_string()),
                auth_bytes: None,
            }
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_metadata(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = MetadataRequest::decode(header.api_version, body)?;
        let topic_names = match &request.topics {
            None => self.engine.list_topics(),
            Some(names) if names.is_empty() => self.engine.list_topics(),
            Some(names) => names.clone(),
        };

        let mut topics = Vec::with_capacity(topic_names.len());
        for name in topic_names {
            let mut exists = self.engine.topic_exists(&name);
            if !exists && request.allow_auto_topic_creation {
                match self.engine.create_topic(&name, crate::now_ms()) {
                    Ok(()) => exists = true,
                    Err(err) => {
                        error!(topic = %name, error = %err, "metadata auto-create failed")
                    }
                }
            }
            topics.push(if exists {
                MetadataTopic {
                    error_code: ERROR_NONE,
                    name,
                    is_internal: false,
                    partitions: vec![MetadataPartition {
                        error_code: ERROR_NONE,
                        partition_index: 0,
                        leader_id: NODE_ID,
                        leader_epoch: 0,
                        replica_nodes: vec![NODE_ID],
                        isr_nodes: vec![NODE_ID],
                        offline_replicas: vec![],
                    }],
                }
            } else {
                MetadataTopic {
                    error_code: ERROR_UNKNOWN_TOPIC_OR_PARTITION,
                    name,
                    is_internal: false,
                    partitions: vec![],
                }
            });
        }

        let response = MetadataResponse {
            throttle_time_ms: 0,
            brokers: vec![MetadataBroker {
                node_id: NODE_ID,
                host: self.host.clone(),
                port: self.port,
                rack: None,
            }],
            cluster_id: Some(CLUSTER_ID.to_string()),
            controller_id: NODE_ID,
            topics,
            include_cluster_authorized_operations: request.include_cluster_authorized_operations,
            include_topic_authorized_operations: request.include_topic_authorized_operations,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_create_topics(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = CreateTopicsRequest::decode(header.api_version, body)?;
        let now_ms = crate::now_ms();
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            // Partition and replication counts are accepted but this broker
            // always runs one partition, one replica.
            let error_code = match self.engine.create_topic(&topic.name, now_ms) {
                Ok(()) => ERROR_NONE,
                Err(EngineError::TopicAlreadyExists(_)) => ERROR_TOPIC_ALREADY_EXISTS,
                Err(err) => {
                    error!(topic = %topic.name, error = %err, "create topic failed");
                    ERROR_UNKNOWN_TOPIC_OR_PARTITION
                }
            };
            topics.push(CreateTopicsResponseTopic {
                name: topic.name,
                error_code,
                error_message: None,
                num_partitions: 1,
                replication_factor: 1,
            });
        }
        let response = CreateTopicsResponse {
            throttle_time_ms: 0,
            topics,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_produce(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = ProduceRequest::decode(header.api_version, body)?;
        let now_ms = crate::now_ms();
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                let batch = partition.records.unwrap_or_default();
                let (error_code, base_offset) =
                    match self.engine.produce(&topic.name, &batch, now_ms) {
                        Ok(base_offset) => (ERROR_NONE, base_offset),
                        Err(err) => {
                            warn!(topic = %topic.name, error = %err, "produce failed");
                            (ERROR_UNKNOWN_TOPIC_OR_PARTITION, -1)
                        }
                    };
                partitions.push(ProduceResponsePartition {
                    index: partition.index,
                    error_code,
                    base_offset,
                    log_append_time_ms: -1,
                    log_start_offset: 0,
                });
            }
            topics.push(ProduceResponseTopic {
                name: topic.name,
                partitions,
            });
        }
        let response = ProduceResponse {
            topics,
            throttle_time_ms: 0,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_fetch(
        &self,
        header: &RequestHeader,
        body: &[u8],
        connection: &ConnectionState,
        response_seq: u64,
        completion: &mpsc::Sender<(u64, Vec<u8>)>,
    ) -> Result<Dispatch, TransportError> {
        let (request, _) = FetchRequest::decode(header.api_version, body)?;

        // A single-partition fetch that finds nothing may park instead of
        // answering, provided the client asked to wait.  The response slot
        // stays reserved in the connection's ordered writer, so parking never
        // reorders responses.
        if request.max_wait_ms > 0 && request.topics.len() == 1 {
            let topic = &request.topics[0];
            if topic.partitions.len() == 1 {
                let partition = &topic.partitions[0];
                if self.engine.topic_exists(&topic.name) {
                    let batches = self
                        .engine
                        .fetch(&topic.name, partition.fetch_offset, FETCH_MAX_BATCHES)
                        .unwrap_or_default();
                    if batches.is_empty() {
                        let deadline = Instant::now()
                            + Duration::from_millis(u64::try_from(request.max_wait_ms).unwrap_or(0));
                        self.engine.pending().park(PendingFetch {
                            connection_id: connection.id,
                            response_seq,
                            correlation_id: header.correlation_id,
                            api_version: header.api_version,
                            topic: topic.name.clone(),
                            partition: partition.index,
                            fetch_offset: partition.fetch_offset,
                            max_bytes: partition.partition_max_bytes,
                            deadline,
                            completion: completion.clone(),
                        });
                        debug!(
                            topic = %topic.name,
                            offset = partition.fetch_offset,
                            wait_ms = request.max_wait_ms,
                            "parked fetch"
                        );
                        return Ok(Dispatch::Parked);
                    }
                }
            }
        }

        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in &request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for partition in &topic.partitions {
                partitions.push(self.fetch_partition(&topic.name, partition));
            }
            topics.push(FetchResponseTopic {
                name: topic.name.clone(),
                partitions,
            });
        }
        let response = FetchResponse {
            throttle_time_ms: 0,
            error_code: ERROR_NONE,
            session_id: 0,
            topics,
        };
        let body = response.encode(header.api_version)?;
        Ok(Dispatch::Response(finish_frame(header, ApiKey::Fetch, body)))
    }

    fn fetch_partition(
        &self,
        topic: &str,
        partition: &FetchRequestPartition,
    ) -> FetchResponsePartition {
        if !self.engine.topic_exists(topic) {
            return FetchResponsePartition {
                index: partition.index,
                error_code: ERROR_UNKNOWN_TOPIC_OR_PARTITION,
                high_watermark: 0,
                last_stable_offset: 0,
                log_start_offset: 0,
                preferred_read_replica: -1,
                records: None,
            };
        }
        let batches = self
            .engine
            .fetch(topic, partition.fetch_offset, FETCH_MAX_BATCHES)
            .unwrap_or_default();
        let latest = self.engine.latest_offset(topic).unwrap_or(-1);
        let earliest = self.engine.earliest_offset(topic).unwrap_or(0);
        FetchResponsePartition {
            index: partition.index,
            error_code: ERROR_NONE,
            high_watermark: latest + 1,
            last_stable_offset: latest + 1,
            log_start_offset: earliest,
            preferred_read_replica: -1,
            records: self.concat_batches(batches, partition.partition_max_bytes),
        }
    }

    /// Concatenate stored batches, each with its base offset patched to the
    /// broker-assigned one, until the byte budget runs out.  The first batch
    /// always goes through so a large batch cannot stall a consumer.
    fn concat_batches(&self, batches: Vec<StoredBatch>, partition_max_bytes: i32) -> Option<Vec<u8>> {
        if batches.is_empty() {
            return None;
        }
        let budget = if partition_max_bytes > 0 {
            (partition_max_bytes as usize).min(self.max_fetch_bytes)
        } else {
            self.max_fetch_bytes
        };
        let mut out = Vec::new();
        for batch in batches {
            if !out.is_empty() && out.len() + batch.value.len() > budget {
                break;
            }
            let mut value = batch.value;
            patch_base_offset(&mut value, batch.offset);
            out.extend_from_slice(&value);
        }
        Some(out)
    }

    /// Build the wire-ready response for a parked fetch completed by the
    /// scheduler (empty on deadline, records when data arrived).
    pub(crate) fn encode_parked_fetch(
        &self,
        fetch: &PendingFetch,
        batches: Vec<StoredBatch>,
    ) -> Result<Vec<u8>, TransportError> {
        let latest = self.engine.latest_offset(&fetch.topic).unwrap_or(-1);
        let earliest = self.engine.earliest_offset(&fetch.topic).unwrap_or(0);
        let response = FetchResponse {
            throttle_time_ms: 0,
            error_code: ERROR_NONE,
            session_id: 0,
            topics: vec![FetchResponseTopic {
                name: fetch.topic.clone(),
                partitions: vec![FetchResponsePartition {
                    index: fetch.partition,
                    error_code: ERROR_NONE,
                    high_watermark: latest + 1,
                    last_stable_offset: latest + 1,
                    log_start_offset: earliest,
                    preferred_read_replica: -1,
                    records: self.concat_batches(batches, fetch.max_bytes),
                }],
            }],
        };
        let body = response.encode(fetch.api_version)?;
        let mut out = Vec::new();
        encode_response_header(
            &mut out,
            fetch.correlation_id,
            ApiKey::Fetch.response_header_is_flexible(fetch.api_version),
        );
        out.extend_from_slice(&body);
        Ok(length_prefixed(out))
    }

    fn handle_list_offsets(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = ListOffsetsRequest::decode(header.api_version, body)?;
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                let (error_code, offset) = match partition.timestamp {
                    OFFSET_LATEST => match self.engine.latest_offset(&topic.name) {
                        Ok(latest) => (ERROR_NONE, latest + 1),
                        Err(_) => (ERROR_UNKNOWN_TOPIC_OR_PARTITION, -1),
                    },
                    OFFSET_EARLIEST => match self.engine.earliest_offset(&topic.name) {
                        Ok(earliest) => (ERROR_NONE, earliest),
                        Err(_) => (ERROR_UNKNOWN_TOPIC_OR_PARTITION, -1),
                    },
                    // Offsets are not indexed by arbitrary timestamps; only
                    // the latest/earliest sentinels resolve.
                    _ => (ERROR_NONE, 0),
                };
                partitions.push(ListOffsetsResponsePartition {
                    partition_index: partition.partition_index,
                    error_code,
                    timestamp: partition.timestamp,
                    offset,
                    leader_epoch: -1,
                });
            }
            topics.push(ListOffsetsResponseTopic {
                name: topic.name,
                partitions,
            });
        }
        let response = ListOffsetsResponse {
            throttle_time_ms: 0,
            topics,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_find_coordinator(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        // The key is irrelevant: this broker coordinates every group itself.
        FindCoordinatorRequest::decode(header.api_version, body)?;
        let response = FindCoordinatorResponse {
            throttle_time_ms: 0,
            error_code: ERROR_NONE,
            error_message: None,
            node_id: NODE_ID,
            host: self.host.clone(),
            port: self.port,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_join_group(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = JoinGroupRequest::decode(header.api_version, body)?;
        let protocol_name = request
            .protocols
            .first()
            .map(|protocol| protocol.name.clone())
            .unwrap_or_default();
        let metadata = request
            .protocols
            .first()
            .map(|protocol| protocol.metadata.clone())
            .unwrap_or_default();

        let response = match self.engine.join_group(
            &request.group_id,
            &request.member_id,
            &header.client_id,
            &protocol_name,
            Some(&metadata),
            crate::now_ms(),
        ) {
            Ok(outcome) => JoinGroupResponse {
                throttle_time_ms: 0,
                error_code: ERROR_NONE,
                generation_id: outcome.generation,
                protocol_name,
                // Every joiner is told it leads and sees only itself, so each
                // single-member client computes its own assignment.
                leader: outcome.member_id.clone(),
                member_id: outcome.member_id.clone(),
                members: vec![JoinGroupResponseMember {
                    member_id: outcome.member_id,
                    group_instance_id: None,
                    metadata,
                }],
            },
            Err(err) => {
                warn!(group = %request.group_id, error = %err, "join failed");
                JoinGroupResponse {
                    throttle_time_ms: 0,
                    error_code: group_error_code(&err),
                    generation_id: -1,
                    protocol_name: String::new(),
                    leader: String::new(),
                    member_id: request.member_id.clone(),
                    members: vec![],
                }
            }
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_sync_group(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = SyncGroupRequest::decode(header.api_version, body)?;
        let pairs: Vec<(String, Vec<u8>)> = request
            .assignments
            .into_iter()
            .map(|assignment| (assignment.member_id, assignment.assignment))
            .collect();
        let response = match self.engine.sync_group(
            &request.group_id,
            &request.member_id,
            &pairs,
            crate::now_ms(),
        ) {
            Ok(assignment) => SyncGroupResponse {
                throttle_time_ms: 0,
                error_code: ERROR_NONE,
                assignment,
            },
            Err(err) => {
                warn!(group = %request.group_id, error = %err, "sync failed");
                SyncGroupResponse {
                    throttle_time_ms: 0,
                    error_code: group_error_code(&err),
                    assignment: Vec::new(),
                }
            }
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_heartbeat(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = HeartbeatRequest::decode(header.api_version, body)?;
        let error_code = match self.engine.heartbeat(
            &request.group_id,
            &request.member_id,
            crate::now_ms(),
        ) {
            Ok(()) => ERROR_NONE,
            Err(err) => group_error_code(&err),
        };
        let response = HeartbeatResponse {
            throttle_time_ms: 0,
            error_code,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_leave_group(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = LeaveGroupRequest::decode(header.api_version, body)?;
        let member_ids: Vec<String> = request
            .members
            .iter()
            .map(|member| member.member_id.clone())
            .collect();
        // Leaving is idempotent: an unknown group or member is already gone.
        if let Err(err) = self
            .engine
            .leave_group(&request.group_id, &member_ids, crate::now_ms())
        {
            debug!(group = %request.group_id, error = %err, "leave on absent group");
        }
        let response = LeaveGroupResponse {
            throttle_time_ms: 0,
            error_code: ERROR_NONE,
            members: request
                .members
                .into_iter()
                .map(|member| LeaveGroupResponseMember {
                    member_id: member.member_id,
                    group_instance_id: member.group_instance_id,
                    error_code: ERROR_NONE,
                })
                .collect(),
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_offset_commit(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = OffsetCommitRequest::decode(header.api_version, body)?;
        let now_ms = crate::now_ms();
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                // Only partition 0 exists; other indexes are acknowledged
                // without committing anything.
                let error_code = if partition.partition_index == 0 {
                    match self.engine.commit_offset(
                        &request.group_id,
                        &topic.name,
                        partition.committed_offset,
                        now_ms,
                    ) {
                        Ok(()) => ERROR_NONE,
                        Err(err) => {
                            error!(
                                group = %request.group_id,
                                topic = %topic.name,
                                error = %err,
                                "offset commit failed"
                            );
                            ERROR_COORDINATOR_NOT_AVAILABLE
                        }
                    }
                } else {
                    ERROR_NONE
                };
                partitions.push(OffsetCommitResponsePartition {
                    partition_index: partition.partition_index,
                    error_code,
                });
            }
            topics.push(OffsetCommitResponseTopic {
                name: topic.name,
                partitions,
            });
        }
        let response = OffsetCommitResponse {
            throttle_time_ms: 0,
            topics,
        };
        Ok(response.encode(header.api_version)?)
    }

    fn handle_offset_fetch(
        &self,
        header: &RequestHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (request, _) = OffsetFetchRequest::decode(header.api_version, body)?;
        let mut topics = Vec::new();
        for topic in request.topics.unwrap_or_default() {
            let mut partitions = Vec::with_capacity(topic.partition_indexes.len());
            for partition_index in topic.partition_indexes {
                let committed_offset = if partition_index == 0 {
                    self.engine.fetch_offset(&request.group_id, &topic.name)
                } else {
                    -1
                };
                partitions.push(OffsetFetchResponsePartition {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch: -1,
                    metadata: None,
                    error_code: ERROR_NONE,
                });
            }
            topics.push(OffsetFetchResponseTopic {
                name: topic.name,
                partitions,
            });
        }
        let response = OffsetFetchResponse {
            throttle_time_ms: 0,
            topics,
            error_code: ERROR_NONE,
        };
        Ok(response.encode(header.api_version)?)
    }
}

fn auth_exempt(api: ApiKey) -> bool {
    matches!(
        api,
        ApiKey::ApiVersions | ApiKey::SaslHandshake | ApiKey::SaslAuthenticate
    )
}

fn group_error_code(err: &EngineError) -> i16 {
    match err {
        EngineError::UnknownMember { .. } | EngineError::GroupNotFound(_) => {
            ERROR_UNKNOWN_MEMBER_ID
        }
        _ => ERROR_COORDINATOR_NOT_AVAILABLE,
    }
}

/// Assemble response header + body and length-prefix the result.
fn finish_frame(header: &RequestHeader, api: ApiKey, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    encode_response_header(
        &mut out,
        header.correlation_id,
        api.response_header_is_flexible(header.api_version),
    );
    out.extend_from_slice(&body);
    length_prefixed(out)
}

/// A minimal header-plus-code frame, used for unsupported APIs and the
/// unauthenticated gate.
fn error_frame(correlation_id: i32, error_code: i16) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    encode_response_header(&mut out, correlation_id, false);
    out.extend_from_slice(&error_code.to_be_bytes());
    length_prefixed(out)
}

fn length_prefixed(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as i32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Validate the i32 length prefix of an incoming frame.
pub(crate) fn validate_frame_size(size: i32, max_size: usize) -> Result<usize, TransportError> {
    if size < 0 {
        return Err(TransportError::InvalidFrameSize(size));
    }
    let size = size as usize;
    if size > max_size {
        return Err(TransportError::FrameTooLarge {
            size,
            max_size,
        });
    }
    Ok(size)
}

/// Re-exported list of advertised APIs, mostly for tests and logs.
pub fn advertised_apis() -> Vec<SupportedApi> {
    supported_apis()
}

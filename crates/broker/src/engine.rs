use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use monolog_protocol::{compression_codec, records_count};
use monolog_storage::{Group, GroupStore, StoreError, StoredBatch, TopicMeta, TopicStore};
use tracing::{debug, info};

use crate::pending::PendingQueue;

#[derive(Debug)]
pub enum EngineError {
    TopicNotFound(String),
    TopicAlreadyExists(String),
    GroupNotFound(String),
    UnknownMember { group: String, member: String },
    Store(StoreError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TopicNotFound(topic) => write!(f, "topic not found: {topic}"),
            Self::TopicAlreadyExists(topic) => write!(f, "topic already exists: {topic}"),
            Self::GroupNotFound(group) => write!(f, "group not found: {group}"),
            Self::UnknownMember { group, member } => {
                write!(f, "unknown member {member} in group {group}")
            }
            Self::Store(err) => write!(f, "store: {err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::TopicNotFound(topic) => Self::TopicNotFound(topic),
            StoreError::TopicAlreadyExists(topic) => Self::TopicAlreadyExists(topic),
            StoreError::GroupNotFound(group) => Self::GroupNotFound(group),
            StoreError::MemberNotFound { group, member } => Self::UnknownMember { group, member },
            other => Self::Store(other),
        }
    }
}

/// Snapshot a join returns to its handler.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub member_id: String,
    pub generation: i32,
    pub leader_id: String,
    pub protocol: String,
}

/// Thin orchestration over the stores.  Handlers and schedulers share one
/// engine; all methods here block and run on blocking threads.
pub struct Engine {
    topics: Arc<TopicStore>,
    groups: Arc<GroupStore>,
    pending: PendingQueue,
    auto_create_topics: bool,
    member_sequence: AtomicU64,
}

impl Engine {
    pub fn new(topics: Arc<TopicStore>, groups: Arc<GroupStore>, auto_create_topics: bool) -> Self {
        Self {
            topics,
            groups,
            pending: PendingQueue::new(),
            auto_create_topics,
            member_sequence: AtomicU64::new(1),
        }
    }

    pub fn topics(&self) -> &TopicStore {
        &self.topics
    }

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    // ── Topics ───────────────────────────────────────────────────────────

    pub fn create_topic(&self, name: &str, now_ms: i64) -> Result<(), EngineError> {
        self.topics.create_topic(name, now_ms)?;
        info!(topic = name, "created topic");
        Ok(())
    }

    /// Create the topic if auto-creation is on; otherwise demand it exists.
    pub fn ensure_topic(&self, name: &str, now_ms: i64) -> Result<(), EngineError> {
        if self.topics.topic_exists(name) {
            return Ok(());
        }
        if !self.auto_create_topics {
            return Err(EngineError::TopicNotFound(name.to_string()));
        }
        self.create_topic(name, now_ms)
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.topics.topic_exists(name)
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.topics.list_topics()
    }

    pub fn topic_meta(&self, name: &str) -> Result<TopicMeta, EngineError> {
        Ok(self.topics.topic_meta(name)?)
    }

    pub fn delete_topic(&self, name: &str) -> Result<(), EngineError> {
        self.topics.delete_topic(name)?;
        info!(topic = name, "deleted topic");
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Store a producer batch verbatim.  The compression codec comes from the
    /// batch's attribute bits and the offset range from its records-count
    /// field, so `latest_offset` advances by the number of logical records
    /// the batch claims to carry.
    pub fn produce(&self, topic: &str, batch: &[u8], now_ms: i64) -> Result<i64, EngineError> {
        self.ensure_topic(topic, now_ms)?;
        let codec = compression_codec(batch);
        let record_count = i64::from(records_count(batch)).max(1);
        let base_offset = self
            .topics
            .append_batch(topic, batch, codec, record_count, now_ms)?;
        debug!(topic, base_offset, record_count, "stored batch");
        Ok(base_offset)
    }

    /// Committed batches overlapping `offset`, never blocking.
    pub fn fetch(
        &self,
        topic: &str,
        offset: i64,
        max_batches: usize,
    ) -> Result<Vec<StoredBatch>, EngineError> {
        Ok(self.topics.read_from(topic, offset, max_batches)?)
    }

    pub fn latest_offset(&self, topic: &str) -> Result<i64, EngineError> {
        Ok(self.topics.latest_offset(topic)?)
    }

    pub fn earliest_offset(&self, topic: &str) -> Result<i64, EngineError> {
        Ok(self.topics.earliest_offset(topic)?)
    }

    // ── Consumer groups ──────────────────────────────────────────────────

    /// Join a group, allocating a member id when the caller sent none.
    pub fn join_group(
        &self,
        group_id: &str,
        member_id: &str,
        client_id: &str,
        protocol: &str,
        metadata: Option<&[u8]>,
        now_ms: i64,
    ) -> Result<JoinOutcome, EngineError> {
        self.groups.get_or_create_group(group_id, now_ms)?;
        let member_id = if member_id.is_empty() {
            self.next_member_id(group_id)
        } else {
            member_id.to_string()
        };
        let group = self
            .groups
            .add_member(group_id, &member_id, client_id, protocol, metadata, now_ms)?;
        debug!(
            group = group_id,
            member = %member_id,
            generation = group.generation,
            "member joined"
        );
        Ok(JoinOutcome {
            member_id,
            generation: group.generation,
            leader_id: group.leader_id,
            protocol: group.protocol,
        })
    }

    /// Persist the leader's assignments, settle the group, and return the
    /// caller's own assignment (empty when nobody assigned it anything).
    pub fn sync_group(
        &self,
        group_id: &str,
        member_id: &str,
        assignments: &[(String, Vec<u8>)],
        now_ms: i64,
    ) -> Result<Vec<u8>, EngineError> {
        if self.groups.group(group_id).is_none() {
            return Err(EngineError::GroupNotFound(group_id.to_string()));
        }
        for (target, assignment) in assignments {
            match self
                .groups
                .set_assignment(group_id, target, assignment, now_ms)
            {
                Ok(()) => {}
                // The leader may still list a member that just expired.
                Err(StoreError::MemberNotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.groups.mark_stable(group_id, now_ms)?;
        Ok(self
            .groups
            .assignment(group_id, member_id)
            .unwrap_or_default())
    }

    pub fn heartbeat(&self, group_id: &str, member_id: &str, now_ms: i64) -> Result<(), EngineError> {
        Ok(self.groups.update_heartbeat(group_id, member_id, now_ms)?)
    }

    pub fn leave_group(
        &self,
        group_id: &str,
        member_ids: &[String],
        now_ms: i64,
    ) -> Result<Group, EngineError> {
        let group = self.groups.remove_members(group_id, member_ids, now_ms)?;
        debug!(group = group_id, left = member_ids.len(), "members left");
        Ok(group)
    }

    pub fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        offset: i64,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        self.groups.get_or_create_group(group_id, now_ms)?;
        Ok(self.groups.commit_offset(group_id, topic, offset, now_ms)?)
    }

    pub fn fetch_offset(&self, group_id: &str, topic: &str) -> i64 {
        self.groups.fetch_offset(group_id, topic)
    }

    /// One member-expiry sweep; returns how many members were dropped.
    pub fn expire_members(
        &self,
        session_timeout_ms: i64,
        now_ms: i64,
    ) -> Result<usize, EngineError> {
        let expired = self.groups.expire_members(session_timeout_ms, now_ms)?;
        for (group, member) in &expired {
            info!(group = %group, member = %member, "expired member past session timeout");
        }
        Ok(expired.len())
    }

    /// One retention sweep across every topic; logs per-topic deletions.
    pub fn retention_sweep(&self, cutoff_ms: i64) -> usize {
        let mut total = 0;
        for topic in self.list_topics() {
            match self.topics.delete_before(&topic, cutoff_ms) {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(topic = %topic, deleted, "retention removed records");
                    total += deleted;
                }
                Err(err) => {
                    tracing::error!(topic = %topic, error = %err, "retention sweep failed");
                }
            }
        }
        total
    }

    /// Drop parked fetches owned by a connection that went away.
    pub fn remove_connection(&self, connection_id: u64) {
        self.pending.remove_connection(connection_id);
    }

    fn next_member_id(&self, group_id: &str) -> String {
        let sequence = self.member_sequence.fetch_add(1, Ordering::Relaxed);
        format!("{group_id}-{sequence}")
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::{Db, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMeta {
    pub name: String,
    pub created_at_ms: i64,
    /// Offset of the last stored record, -1 while the topic is empty.
    pub latest_offset: i64,
}

/// One stored row: a producer's record batch kept verbatim plus the offset
/// range the broker assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBatch {
    pub offset: i64,
    pub last_offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub codec: i8,
}

/// Topic and message persistence.  The `topics` cache mirrors the topics
/// table; every mutation happens with the cache write-lock held and the
/// cache entry is only updated after the transaction commits.
pub struct TopicStore {
    db: Db,
    topics: RwLock<HashMap<String, TopicMeta>>,
}

impl TopicStore {
    pub fn open(db: Db) -> Result<Self, StoreError> {
        let topics = load_topics(&db)?;
        Ok(Self {
            db,
            topics: RwLock::new(topics),
        })
    }

    pub fn create_topic(&self, name: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut topics = self.topics.write().expect("topics lock");
        if topics.contains_key(name) {
            return Err(StoreError::TopicAlreadyExists(name.to_string()));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO topics (name, created_at, latest_offset) VALUES (?1, ?2, -1)",
                params![name, now_ms],
            )?;
            Ok(())
        })?;
        topics.insert(
            name.to_string(),
            TopicMeta {
                name: name.to_string(),
                created_at_ms: now_ms,
                latest_offset: -1,
            },
        );
        Ok(())
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.topics.read().expect("topics lock").contains_key(name)
    }

    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .read()
            .expect("topics lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn topic_meta(&self, name: &str) -> Result<TopicMeta, StoreError> {
        self.topics
            .read()
            .expect("topics lock")
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TopicNotFound(name.to_string()))
    }

    /// Delete a topic and every record in it, in one transaction.
    pub fn delete_topic(&self, name: &str) -> Result<(), StoreError> {
        let mut topics = self.topics.write().expect("topics lock");
        if !topics.contains_key(name) {
            return Err(StoreError::TopicNotFound(name.to_string()));
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE topic = ?1", params![name])?;
            tx.execute("DELETE FROM topics WHERE name = ?1", params![name])?;
            tx.commit()?;
            Ok(())
        })?;
        topics.remove(name);
        Ok(())
    }

    /// Append one raw batch.  The base offset is `latest_offset + 1` and the
    /// row spans `record_count` logical offsets; `latest_offset` moves in the
    /// same transaction.  On success the new base offset is returned and is
    /// durable (the commit fsyncs).
    pub fn append_batch(
        &self,
        topic: &str,
        value: &[u8],
        codec: i8,
        record_count: i64,
        timestamp_ms: i64,
    ) -> Result<i64, StoreError> {
        let record_count = record_count.max(1);
        let mut topics = self.topics.write().expect("topics lock");
        let meta = topics
            .get_mut(topic)
            .ok_or_else(|| StoreError::TopicNotFound(topic.to_string()))?;

        let base_offset = meta.latest_offset + 1;
        let last_offset = base_offset + record_count - 1;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (topic, offset, last_offset, timestamp, key, value, codec) \
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                params![topic, base_offset, last_offset, timestamp_ms, value, codec],
            )?;
            tx.execute(
                "UPDATE topics SET latest_offset = ?1 WHERE name = ?2",
                params![last_offset, topic],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        meta.latest_offset = last_offset;
        Ok(base_offset)
    }

    /// Batches whose offset range reaches `from_offset` or later, in offset
    /// order, at most `limit` rows.  Empty when the topic has no such rows.
    pub fn read_from(
        &self,
        topic: &str,
        from_offset: i64,
        limit: usize,
    ) -> Result<Vec<StoredBatch>, StoreError> {
        if !self.topic_exists(topic) {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT offset, last_offset, timestamp, key, value, codec FROM messages \
                 WHERE topic = ?1 AND last_offset >= ?2 ORDER BY offset ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![topic, from_offset, limit as i64], |row| {
                Ok(StoredBatch {
                    offset: row.get(0)?,
                    last_offset: row.get(1)?,
                    timestamp_ms: row.get(2)?,
                    key: row.get(3)?,
                    value: row.get(4)?,
                    codec: row.get(5)?,
                })
            })?;
            let mut batches = Vec::new();
            for row in rows {
                batches.push(row?);
            }
            Ok(batches)
        })
    }

    pub fn latest_offset(&self, topic: &str) -> Result<i64, StoreError> {
        Ok(self.topic_meta(topic)?.latest_offset)
    }

    /// Smallest stored offset, or 0 when the topic holds no records.
    pub fn earliest_offset(&self, topic: &str) -> Result<i64, StoreError> {
        if !self.topic_exists(topic) {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }
        self.db.with_conn(|conn| {
            let earliest: Option<i64> = conn
                .query_row(
                    "SELECT MIN(offset) FROM messages WHERE topic = ?1",
                    params![topic],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(earliest.unwrap_or(0))
        })
    }

    /// Retention sweep for one topic: drop rows older than `cutoff_ms` and
    /// report how many went away.
    pub fn delete_before(&self, topic: &str, cutoff_ms: i64) -> Result<usize, StoreError> {
        if !self.topic_exists(topic) {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM messages WHERE topic = ?1 AND timestamp < ?2",
                params![topic, cutoff_ms],
            )?)
        })?;
        if deleted > 0 {
            debug!(topic, deleted, "retention removed rows");
        }
        Ok(deleted)
    }
}

fn load_topics(db: &Db) -> Result<HashMap<String, TopicMeta>, StoreError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT name, created_at, latest_offset FROM topics")?;
        let rows = stmt.query_map([], |row| {
            Ok(TopicMeta {
                name: row.get(0)?,
                created_at_ms: row.get(1)?,
                latest_offset: row.get(2)?,
            })
        })?;
        let mut topics = HashMap::new();
        for row in rows {
            let meta = row?;
            topics.insert(meta.name.clone(), meta);
        }
        Ok(topics)
    })
}

#![forbid(unsafe_code)]

//! Persistent state behind the broker: one SQLite database holding topics,
//! message batches, consumer groups, their members, and committed offsets.
//! The database is the single source of truth; topic and group metadata are
//! mirrored in in-memory caches that are updated under the same lock as the
//! corresponding row mutation and rebuilt from the database on restart.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod db;
mod groups;
mod topics;

pub use db::Db;
pub use groups::{Group, GroupState, GroupStore, Member};
pub use topics::{StoredBatch, TopicMeta, TopicStore};

#[derive(Debug)]
pub enum StoreError {
    TopicNotFound(String),
    TopicAlreadyExists(String),
    GroupNotFound(String),
    MemberNotFound { group: String, member: String },
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TopicNotFound(topic) => write!(f, "topic not found: {topic}"),
            Self::TopicAlreadyExists(topic) => write!(f, "topic already exists: {topic}"),
            Self::GroupNotFound(group) => write!(f, "group not found: {group}"),
            Self::MemberNotFound { group, member } => {
                write!(f, "member not found: {member} in group {group}")
            }
            Self::Sqlite(err) => write!(f, "sqlite: {err}"),
            Self::Io(err) => write!(f, "io: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

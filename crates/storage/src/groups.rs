use std::collections::HashMap;
use std::sync::RwLock;

use rusqlite::params;
use tracing::debug;

use crate::{Db, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Empty,
    Forming,
    Stable,
}

impl GroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Forming => "forming",
            Self::Stable => "stable",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "forming" => Self::Forming,
            "stable" => Self::Stable,
            _ => Self::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub client_id: String,
    pub last_heartbeat_ms: i64,
    pub metadata: Option<Vec<u8>>,
    pub assignment: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub state: GroupState,
    pub generation: i32,
    pub leader_id: String,
    pub protocol: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub members: HashMap<String, Member>,
    pub committed_offsets: HashMap<String, i64>,
}

impl Group {
    fn new(id: &str, now_ms: i64) -> Self {
        Self {
            id: id.to_string(),
            state: GroupState::Empty,
            generation: 0,
            leader_id: String::new(),
            protocol: String::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            members: HashMap::new(),
            committed_offsets: HashMap::new(),
        }
    }
}

/// Consumer-group persistence.  The cache holds the full group objects
/// (members and committed offsets included); rows and cache change together
/// under the write lock, and the cache is rebuilt from the tables on open.
pub struct GroupStore {
    db: Db,
    groups: RwLock<HashMap<String, Group>>,
}

impl GroupStore {
    pub fn open(db: Db) -> Result<Self, StoreError> {
        let groups = load_groups(&db)?;
        Ok(Self {
            db,
            groups: RwLock::new(groups),
        })
    }

    pub fn get_or_create_group(&self, group_id: &str, now_ms: i64) -> Result<Group, StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        if let Some(group) = groups.get(group_id) {
            return Ok(group.clone());
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (id, state, generation, created_at, updated_at) \
                 VALUES (?1, 'empty', 0, ?2, ?2)",
                params![group_id, now_ms],
            )?;
            Ok(())
        })?;
        let group = Group::new(group_id, now_ms);
        groups.insert(group_id.to_string(), group.clone());
        Ok(group)
    }

    pub fn group(&self, group_id: &str) -> Option<Group> {
        self.groups.read().expect("groups lock").get(group_id).cloned()
    }

    pub fn list_groups(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .groups
            .read()
            .expect("groups lock")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Upsert a member.  The first member becomes leader, an empty group
    /// moves to `forming`, and the generation advances (it never goes back).
    /// Returns the group as it looks after the join.
    pub fn add_member(
        &self,
        group_id: &str,
        member_id: &str,
        client_id: &str,
        protocol: &str,
        metadata: Option<&[u8]>,
        now_ms: i64,
    ) -> Result<Group, StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let mut group = groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

        group.members.insert(
            member_id.to_string(),
            Member {
                id: member_id.to_string(),
                client_id: client_id.to_string(),
                last_heartbeat_ms: now_ms,
                metadata: metadata.map(<[u8]>::to_vec),
                assignment: None,
            },
        );
        if group.members.len() == 1 {
            group.leader_id = member_id.to_string();
        }
        if group.state == GroupState::Empty {
            group.state = GroupState::Forming;
        }
        group.generation = group.generation.saturating_add(1);
        group.protocol = protocol.to_string();
        group.updated_at_ms = now_ms;

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO group_members \
                 (group_id, member_id, client_id, last_heartbeat, metadata, assignment) \
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![group_id, member_id, client_id, now_ms, metadata],
            )?;
            persist_group_meta(&tx, &group)?;
            tx.commit()?;
            Ok(())
        })?;
        groups.insert(group_id.to_string(), group.clone());
        Ok(group)
    }

    /// Remove members; unknown ids are ignored.  An emptied group reverts to
    /// `empty` with its leader cleared; if the leader left but members
    /// remain, one of them is promoted.
    pub fn remove_members(
        &self,
        group_id: &str,
        member_ids: &[String],
        now_ms: i64,
    ) -> Result<Group, StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let mut group = groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

        for member_id in member_ids {
            group.members.remove(member_id);
        }
        reconcile_leader(&mut group);
        group.updated_at_ms = now_ms;

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for member_id in member_ids {
                tx.execute(
                    "DELETE FROM group_members WHERE group_id = ?1 AND member_id = ?2",
                    params![group_id, member_id],
                )?;
            }
            persist_group_meta(&tx, &group)?;
            tx.commit()?;
            Ok(())
        })?;
        groups.insert(group_id.to_string(), group.clone());
        Ok(group)
    }

    pub fn update_heartbeat(
        &self,
        group_id: &str,
        member_id: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;
        let member = group
            .members
            .get_mut(member_id)
            .ok_or_else(|| StoreError::MemberNotFound {
                group: group_id.to_string(),
                member: member_id.to_string(),
            })?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE group_members SET last_heartbeat = ?1 \
                 WHERE group_id = ?2 AND member_id = ?3",
                params![now_ms, group_id, member_id],
            )?;
            Ok(())
        })?;
        member.last_heartbeat_ms = now_ms;
        group.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn set_assignment(
        &self,
        group_id: &str,
        member_id: &str,
        assignment: &[u8],
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;
        let member = group
            .members
            .get_mut(member_id)
            .ok_or_else(|| StoreError::MemberNotFound {
                group: group_id.to_string(),
                member: member_id.to_string(),
            })?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE group_members SET assignment = ?1 \
                 WHERE group_id = ?2 AND member_id = ?3",
                params![assignment, group_id, member_id],
            )?;
            Ok(())
        })?;
        member.assignment = Some(assignment.to_vec());
        group.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn assignment(&self, group_id: &str, member_id: &str) -> Option<Vec<u8>> {
        self.groups
            .read()
            .expect("groups lock")
            .get(group_id)
            .and_then(|group| group.members.get(member_id))
            .and_then(|member| member.assignment.clone())
    }

    /// A successful sync settles the membership.
    pub fn mark_stable(&self, group_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let mut group = groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;
        if group.members.is_empty() {
            return Ok(());
        }
        group.state = GroupState::Stable;
        group.updated_at_ms = now_ms;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            persist_group_meta(&tx, &group)?;
            tx.commit()?;
            Ok(())
        })?;
        groups.insert(group_id.to_string(), group);
        Ok(())
    }

    pub fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        offset: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO group_offsets (group_id, topic, committed_offset) \
                 VALUES (?1, ?2, ?3)",
                params![group_id, topic, offset],
            )?;
            Ok(())
        })?;
        group.committed_offsets.insert(topic.to_string(), offset);
        group.updated_at_ms = now_ms;
        Ok(())
    }

    /// Committed offset for `(group, topic)`, -1 when nothing was committed.
    pub fn fetch_offset(&self, group_id: &str, topic: &str) -> i64 {
        self.groups
            .read()
            .expect("groups lock")
            .get(group_id)
            .and_then(|group| group.committed_offsets.get(topic).copied())
            .unwrap_or(-1)
    }

    /// Drop members whose heartbeat is older than `session_timeout_ms`.
    /// Returns `(group_id, member_id)` pairs that were expired.
    pub fn expire_members(
        &self,
        session_timeout_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let cutoff = now_ms - session_timeout_ms;
        let mut expired = Vec::new();
        let mut groups = self.groups.write().expect("groups lock");
        let group_ids: Vec<String> = groups.keys().cloned().collect();
        for group_id in group_ids {
            let mut group = groups.get(&group_id).cloned().expect("group listed above");
            let stale: Vec<String> = group
                .members
                .values()
                .filter(|member| member.last_heartbeat_ms < cutoff)
                .map(|member| member.id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            for member_id in &stale {
                group.members.remove(member_id);
            }
            reconcile_leader(&mut group);
            group.updated_at_ms = now_ms;
            self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                for member_id in &stale {
                    tx.execute(
                        "DELETE FROM group_members WHERE group_id = ?1 AND member_id = ?2",
                        params![group.id, member_id],
                    )?;
                }
                persist_group_meta(&tx, &group)?;
                tx.commit()?;
                Ok(())
            })?;
            groups.insert(group_id.clone(), group);
            for member_id in stale {
                debug!(group = %group_id, member = %member_id, "expired group member");
                expired.push((group_id.clone(), member_id));
            }
        }
        Ok(expired)
    }

    pub fn delete_group(&self, group_id: &str) -> Result<(), StoreError> {
        let mut groups = self.groups.write().expect("groups lock");
        if !groups.contains_key(group_id) {
            return Err(StoreError::GroupNotFound(group_id.to_string()));
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM group_offsets WHERE group_id = ?1", params![group_id])?;
            tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_id])?;
            tx.execute("DELETE FROM groups WHERE id = ?1", params![group_id])?;
            tx.commit()?;
            Ok(())
        })?;
        groups.remove(group_id);
        Ok(())
    }
}

fn reconcile_leader(group: &mut Group) {
    if group.members.is_empty() {
        group.state = GroupState::Empty;
        group.leader_id.clear();
        return;
    }
    if !group.members.contains_key(&group.leader_id) {
        let mut ids: Vec<&String> = group.members.keys().collect();
        ids.sort();
        group.leader_id = ids[0].clone();
    }
}

fn persist_group_meta(
    tx: &rusqlite::Transaction<'_>,
    group: &Group,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "UPDATE groups SET state = ?1, generation = ?2, leader_id = ?3, protocol = ?4, \
         updated_at = ?5 WHERE id = ?6",
        params![
            group.state.as_str(),
            group.generation,
            group.leader_id,
            group.protocol,
            group.updated_at_ms,
            group.id
        ],
    )?;
    Ok(())
}

fn load_groups(db: &Db) -> Result<HashMap<String, Group>, StoreError> {
    db.with_conn(|conn| {
        let mut groups: HashMap<String, Group> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, state, generation, leader_id, protocol, created_at, updated_at \
                 FROM groups",
            )?;
            let rows = stmt.query_map([], |row| {
                let state: String = row.get(1)?;
                let leader_id: Option<String> = row.get(3)?;
                let protocol: Option<String> = row.get(4)?;
                Ok(Group {
                    id: row.get(0)?,
                    state: GroupState::parse(&state),
                    generation: row.get(2)?,
                    leader_id: leader_id.unwrap_or_default(),
                    protocol: protocol.unwrap_or_default(),
                    created_at_ms: row.get(5)?,
                    updated_at_ms: row.get(6)?,
                    members: HashMap::new(),
                    committed_offsets: HashMap::new(),
                })
            })?;
            for row in rows {
                let group = row?;
                groups.insert(group.id.clone(), group);
            }
        }
        {
            let mut stmt = conn.prepare(
                "SELECT group_id, member_id, client_id, last_heartbeat, metadata, assignment \
                 FROM group_members",
            )?;
            let rows = stmt.query_map([], |row| {
                let client_id: Option<String> = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    Member {
                        id: row.get(1)?,
                        client_id: client_id.unwrap_or_default(),
                        last_heartbeat_ms: row.get(3)?,
                        metadata: row.get(4)?,
                        assignment: row.get(5)?,
                    },
                ))
            })?;
            for row in rows {
                let (group_id, member) = row?;
                if let Some(group) = groups.get_mut(&group_id) {
                    group.members.insert(member.id.clone(), member);
                }
            }
        }
        {
            let mut stmt =
                conn.prepare("SELECT group_id, topic, committed_offset FROM group_offsets")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (group_id, topic, offset) = row?;
                if let Some(group) = groups.get_mut(&group_id) {
                    group.committed_offsets.insert(topic, offset);
                }
            }
        }
        Ok(groups)
    })
}

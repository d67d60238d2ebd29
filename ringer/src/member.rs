//! Ring members and the sorted registry that holds them.
//!
//! Both kinds of member expose the same read-only capabilities through the
//! [`Member`] trait. The [`LocalMember`] is this process; every
//! [`RemoteMember`] owns the [`Link`] to its peer connection.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::connection::Link;
use crate::errors::{ErrorSummary, ErrorTracker};
use crate::message::{Message, Roster};

/// Optimistic latency (µs) for members that have not answered a heartbeat yet.
pub const DEFAULT_LATENCY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unknown,
    Up,
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Unknown => "unknown",
            Status::Up => "up",
            Status::Down => "down",
        };
        f.write_str(label)
    }
}

/// Splits `"host:port"` into its parts.
pub fn parse_name(name: &str) -> Option<(String, u16)> {
    let (host, port) = name.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

pub fn member_name(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Capabilities shared by the local and remote members.
pub trait Member {
    fn name(&self) -> &str;
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn status(&self) -> Status;
    /// Round-trip latency estimate in microseconds.
    fn latency(&self) -> i64;
    fn is_leader(&self) -> bool;
    fn is_local(&self) -> bool;
    fn errors(&self) -> &ErrorTracker;

    fn describe(&self) -> MemberStatus {
        MemberStatus {
            name: self.name().to_string(),
            host: self.host().to_string(),
            port: self.port(),
            status: self.status(),
            latency: self.latency(),
            is_leader: self.is_leader(),
            is_local: self.is_local(),
            errors: self.errors().summary(),
        }
    }
}

/// Serializable snapshot of one member.
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: Status,
    pub latency: i64,
    pub is_leader: bool,
    pub is_local: bool,
    pub errors: Vec<ErrorSummary>,
}

/// The member running in this process.
#[derive(Debug)]
pub struct LocalMember {
    name: String,
    host: String,
    port: u16,
    is_leader: bool,
    errors: ErrorTracker,
}

impl LocalMember {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            name: member_name(host, port),
            host: host.to_string(),
            port,
            is_leader: false,
            errors: ErrorTracker::new(),
        }
    }

    pub fn errors_mut(&mut self) -> &mut ErrorTracker {
        &mut self.errors
    }
}

impl Member for LocalMember {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    // A running process is up by definition; it is never marked down.
    fn status(&self) -> Status {
        Status::Up
    }

    fn latency(&self) -> i64 {
        0
    }

    fn is_leader(&self) -> bool {
        self.is_leader
    }

    fn is_local(&self) -> bool {
        true
    }

    fn errors(&self) -> &ErrorTracker {
        &self.errors
    }
}

/// A member in another process, reached over its peer connection.
#[derive(Debug)]
pub struct RemoteMember {
    name: String,
    host: String,
    port: u16,
    status: Status,
    latency: i64,
    is_leader: bool,
    errors: ErrorTracker,
    link: Link,
    connection: Option<AbortHandle>,
}

impl RemoteMember {
    pub fn new(host: &str, port: u16, link: Link) -> Self {
        Self {
            name: member_name(host, port),
            host: host.to_string(),
            port,
            status: Status::Unknown,
            latency: DEFAULT_LATENCY,
            is_leader: false,
            errors: ErrorTracker::new(),
            link,
            connection: None,
        }
    }

    /// Ties the lifetime of the connection task to this member.
    pub fn with_connection(mut self, connection: AbortHandle) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Queues a message on the peer connection.
    pub fn send(&self, message: Message) -> bool {
        self.link.send(message)
    }

    pub fn set_latency(&mut self, latency: i64) {
        self.latency = latency;
    }

    pub fn errors_mut(&mut self) -> &mut ErrorTracker {
        &mut self.errors
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

impl Member for RemoteMember {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn status(&self) -> Status {
        self.status
    }

    fn latency(&self) -> i64 {
        self.latency
    }

    fn is_leader(&self) -> bool {
        self.is_leader
    }

    fn is_local(&self) -> bool {
        false
    }

    fn errors(&self) -> &ErrorTracker {
        &self.errors
    }
}

/// Every known member, ordered by name.
///
/// Members are only ever added; a member that goes away is marked down.
#[derive(Debug)]
pub struct MemberRegistry {
    local: LocalMember,
    remotes: BTreeMap<String, RemoteMember>,
}

impl MemberRegistry {
    pub fn new(local: LocalMember) -> Self {
        Self {
            local,
            remotes: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &LocalMember {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalMember {
        &mut self.local
    }

    pub fn local_name(&self) -> &str {
        &self.local.name
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, name: &str) -> bool {
        name == self.local.name || self.remotes.contains_key(name)
    }

    /// Adds a remote member; returns false if the name was already known.
    pub fn insert(&mut self, member: RemoteMember) -> bool {
        if self.contains(&member.name) {
            return false;
        }
        self.remotes.insert(member.name.clone(), member);
        true
    }

    pub fn get(&self, name: &str) -> Option<&dyn Member> {
        if name == self.local.name {
            return Some(&self.local);
        }
        self.remotes.get(name).map(|member| member as &dyn Member)
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteMember> {
        self.remotes.get(name)
    }

    pub fn remote_mut(&mut self, name: &str) -> Option<&mut RemoteMember> {
        self.remotes.get_mut(name)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteMember> {
        self.remotes.values()
    }

    pub fn remotes_mut(&mut self) -> impl Iterator<Item = &mut RemoteMember> {
        self.remotes.values_mut()
    }

    /// All members, local included, in ascending name order.
    pub fn members(&self) -> Vec<&dyn Member> {
        let mut members: Vec<&dyn Member> = Vec::with_capacity(self.len());
        let mut local_placed = false;
        for remote in self.remotes.values() {
            if !local_placed && self.local.name.as_str() < remote.name.as_str() {
                members.push(&self.local);
                local_placed = true;
            }
            members.push(remote);
        }
        if !local_placed {
            members.push(&self.local);
        }
        members
    }

    /// Updates a remote member's status; returns true when it changed.
    pub fn set_status(&mut self, name: &str, status: Status) -> bool {
        match self.remotes.get_mut(name) {
            Some(member) if member.status != status => {
                member.status = status;
                true
            }
            _ => false,
        }
    }

    /// Marks exactly `leader` (if any) as the leader.
    pub fn set_leader(&mut self, leader: Option<&str>) {
        self.local.is_leader = leader == Some(self.local.name.as_str());
        for member in self.remotes.values_mut() {
            member.is_leader = leader == Some(member.name.as_str());
        }
    }

    pub fn roster(&self) -> Roster {
        self.members()
            .into_iter()
            .map(|member| (member.name().to_string(), member.status()))
            .collect()
    }
}

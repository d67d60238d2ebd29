//! Request bookkeeping for replicated reads and writes.
//!
//! The ring runtime routes a `get` to the fastest up replica and fans a
//! `set` out to every replica. Each request sent to a member gets an id that
//! the reply echoes, plus a timeout [`Timer`] that is dropped (and so
//! cancelled) as soon as the request resolves.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::RingError;
use crate::member::{Member, MemberRegistry, Status};
use crate::message::RequestId;
use crate::timer::Timer;

pub type GetResult = Result<Option<String>, RingError>;
pub type SetResult = Result<SetReport, RingError>;

/// Outcome of a replicated write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetReport {
    pub key: String,
    /// Replicas that stored the value.
    pub acked: Vec<String>,
    /// Replicas that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SetReport {
    /// True when every replica acknowledged the write.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counts down the replicas of one `set` and answers the caller when the
/// last one has reported.
struct SetLatch {
    report: SetReport,
    waiting: usize,
    reply: oneshot::Sender<SetResult>,
}

enum PendingKind {
    Get { reply: oneshot::Sender<GetResult> },
    Set { latch: u64 },
}

struct Pending {
    member: String,
    kind: PendingKind,
    _timeout: Timer,
}

#[derive(Default)]
pub struct PendingRequests {
    next_id: RequestId,
    next_latch: u64,
    requests: HashMap<RequestId, Pending>,
    latches: HashMap<u64, SetLatch>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> RequestId {
        self.next_id += 1;
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn insert_get(
        &mut self,
        id: RequestId,
        member: &str,
        reply: oneshot::Sender<GetResult>,
        timeout: Timer,
    ) {
        self.requests.insert(
            id,
            Pending {
                member: member.to_string(),
                kind: PendingKind::Get { reply },
                _timeout: timeout,
            },
        );
    }

    /// Opens a latch over `replicas` targets and returns its id.
    pub fn begin_set(&mut self, key: &str, replicas: usize, reply: oneshot::Sender<SetResult>) -> u64 {
        self.next_latch += 1;
        self.latches.insert(
            self.next_latch,
            SetLatch {
                report: SetReport {
                    key: key.to_string(),
                    ..SetReport::default()
                },
                waiting: replicas,
                reply,
            },
        );
        self.next_latch
    }

    pub fn insert_set(&mut self, id: RequestId, latch: u64, member: &str, timeout: Timer) {
        self.requests.insert(
            id,
            Pending {
                member: member.to_string(),
                kind: PendingKind::Set { latch },
                _timeout: timeout,
            },
        );
    }

    /// Completes a pending get; false if the id is unknown or not a get.
    pub fn resolve_get(&mut self, id: RequestId, value: Option<String>) -> bool {
        match self.take(id) {
            Some((_, PendingKind::Get { reply })) => {
                let _ = reply.send(Ok(value));
                true
            }
            Some((member, PendingKind::Set { latch })) => {
                warn!(id, %member, "get reply for a set request");
                self.count_down(latch, member, Err("unexpected get reply".to_string()));
                false
            }
            None => {
                debug!(id, "reply for unknown or finished request");
                false
            }
        }
    }

    /// Records one replica's answer to a set.
    pub fn resolve_set(&mut self, id: RequestId, result: Result<(), String>) -> bool {
        match self.take(id) {
            Some((member, PendingKind::Set { latch })) => {
                self.count_down(latch, member, result);
                true
            }
            Some((member, PendingKind::Get { reply })) => {
                warn!(id, %member, "set reply for a get request");
                let _ = reply.send(Err(RingError::Cancelled(member)));
                false
            }
            None => {
                debug!(id, "reply for unknown or finished request");
                false
            }
        }
    }

    /// Fails a request whose timer fired.
    pub fn expire(&mut self, id: RequestId, timeout: Duration) {
        if let Some((member, kind)) = self.take(id) {
            warn!(id, %member, ?timeout, "request timed out");
            let error = RingError::Timeout {
                member: member.clone(),
                timeout,
            };
            self.fail(member, kind, format!("timed out after {timeout:?}"), error);
        }
    }

    /// Fails one request that could not be sent.
    pub fn cancel(&mut self, id: RequestId) {
        if let Some((member, kind)) = self.take(id) {
            let error = RingError::Cancelled(member.clone());
            self.fail(member, kind, "member unreachable".to_string(), error);
        }
    }

    /// Fails every request waiting on `member`, typically after its
    /// connection dropped.
    pub fn cancel_member(&mut self, member: &str) {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, pending)| pending.member == member)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some((member, kind)) = self.take(id) {
                let error = RingError::Cancelled(member.clone());
                self.fail(member, kind, "connection lost".to_string(), error);
            }
        }
    }

    /// Fails everything; used on shutdown.
    pub fn cancel_all(&mut self) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for id in ids {
            if let Some((member, kind)) = self.take(id) {
                self.fail(member, kind, "ring shut down".to_string(), RingError::Shutdown);
            }
        }
        for (_, latch) in self.latches.drain() {
            let _ = latch.reply.send(Err(RingError::Shutdown));
        }
    }

    fn take(&mut self, id: RequestId) -> Option<(String, PendingKind)> {
        self.requests
            .remove(&id)
            .map(|pending| (pending.member, pending.kind))
    }

    fn fail(&mut self, member: String, kind: PendingKind, reason: String, error: RingError) {
        match kind {
            PendingKind::Get { reply } => {
                let _ = reply.send(Err(error));
            }
            PendingKind::Set { latch } => self.count_down(latch, member, Err(reason)),
        }
    }

    fn count_down(&mut self, latch_id: u64, member: String, result: Result<(), String>) {
        let Some(latch) = self.latches.get_mut(&latch_id) else {
            return;
        };
        match result {
            Ok(()) => latch.report.acked.push(member),
            Err(reason) => latch.report.failed.push((member, reason)),
        }
        latch.waiting = latch.waiting.saturating_sub(1);
        if latch.waiting == 0 {
            if let Some(latch) = self.latches.remove(&latch_id) {
                let _ = latch.reply.send(Ok(latch.report));
            }
        }
    }
}

/// The up target with the lowest latency; the first wins ties.
pub fn fastest<'a>(registry: &'a MemberRegistry, targets: &[&str]) -> Option<&'a dyn Member> {
    let mut best: Option<&dyn Member> = None;
    for member in targets.iter().filter_map(|name| registry.get(name)) {
        if member.status() != Status::Up {
            continue;
        }
        if best.map_or(true, |current| member.latency() < current.latency()) {
            best = Some(member);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Link;
    use crate::hash_ring::ActiveSet;
    use crate::member::{LocalMember, RemoteMember};

    fn registry() -> MemberRegistry {
        let mut registry = MemberRegistry::new(LocalMember::new("a", 1));
        for host in ["b", "c"] {
            let (link, _rx) = Link::channel();
            registry.insert(RemoteMember::new(host, 1, link));
            registry.set_status(&format!("{host}:1"), Status::Up);
        }
        registry
    }

    #[test]
    fn get_resolves_once() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let id = pending.next_id();
        pending.insert_get(id, "b:1", tx, Timer::idle());

        assert!(pending.resolve_get(id, Some("v".into())));
        assert!(!pending.resolve_get(id, None));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("v".to_string())));
        assert!(pending.is_empty());
    }

    #[test]
    fn expired_get_reports_timeout() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let id = pending.next_id();
        pending.insert_get(id, "b:1", tx, Timer::idle());

        pending.expire(id, Duration::from_millis(5));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RingError::Timeout {
                member: "b:1".into(),
                timeout: Duration::from_millis(5)
            })
        );
        // A late reply after the timeout is ignored.
        assert!(!pending.resolve_get(id, Some("late".into())));
    }

    #[test]
    fn set_latch_waits_for_every_replica() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let latch = pending.begin_set("k", 3, tx);
        let ids: Vec<RequestId> = ["a:1", "b:1", "c:1"]
            .iter()
            .map(|member| {
                let id = pending.next_id();
                pending.insert_set(id, latch, member, Timer::idle());
                id
            })
            .collect();

        assert!(pending.resolve_set(ids[0], Ok(())));
        assert!(pending.resolve_set(ids[1], Err("disk full".into())));
        assert!(rx.try_recv().is_err());

        pending.expire(ids[2], Duration::from_secs(5));
        let report = rx.try_recv().unwrap().unwrap();
        assert_eq!(report.key, "k");
        assert_eq!(report.acked, vec!["a:1".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0], ("b:1".to_string(), "disk full".to_string()));
        assert_eq!(report.failed[1].0, "c:1");
        assert!(!report.is_complete());
    }

    #[test]
    fn dropped_connection_cancels_its_requests() {
        let mut pending = PendingRequests::new();
        let (get_tx, mut get_rx) = oneshot::channel();
        let (set_tx, mut set_rx) = oneshot::channel();

        let get_id = pending.next_id();
        pending.insert_get(get_id, "b:1", get_tx, Timer::idle());
        let latch = pending.begin_set("k", 2, set_tx);
        let ours = pending.next_id();
        pending.insert_set(ours, latch, "a:1", Timer::idle());
        let theirs = pending.next_id();
        pending.insert_set(theirs, latch, "b:1", Timer::idle());

        pending.cancel_member("b:1");
        assert_eq!(get_rx.try_recv().unwrap(), Err(RingError::Cancelled("b:1".into())));
        assert!(set_rx.try_recv().is_err());

        pending.resolve_set(ours, Ok(()));
        let report = set_rx.try_recv().unwrap().unwrap();
        assert_eq!(report.acked, vec!["a:1".to_string()]);
        assert_eq!(report.failed, vec![("b:1".to_string(), "connection lost".to_string())]);
    }

    #[test]
    fn cancel_all_answers_every_caller() {
        let mut pending = PendingRequests::new();
        let (get_tx, mut get_rx) = oneshot::channel();
        let (set_tx, mut set_rx) = oneshot::channel();
        let id = pending.next_id();
        pending.insert_get(id, "b:1", get_tx, Timer::idle());
        pending.begin_set("k", 1, set_tx);

        pending.cancel_all();
        assert_eq!(get_rx.try_recv().unwrap(), Err(RingError::Shutdown));
        assert_eq!(set_rx.try_recv().unwrap(), Err(RingError::Shutdown));
    }

    #[test]
    fn fastest_skips_down_members_and_keeps_first_on_ties() {
        let mut registry = registry();
        assert_eq!(fastest(&registry, &["b:1", "c:1"]).unwrap().name(), "b:1");

        registry.remote_mut("c:1").unwrap().set_latency(50);
        assert_eq!(fastest(&registry, &["b:1", "c:1"]).unwrap().name(), "c:1");

        registry.set_status("c:1", Status::Down);
        assert_eq!(fastest(&registry, &["b:1", "c:1"]).unwrap().name(), "b:1");
        registry.set_status("b:1", Status::Down);
        assert!(fastest(&registry, &["b:1", "c:1"]).is_none());

        // The local member is always up with zero latency.
        assert_eq!(fastest(&registry, &["b:1", "a:1"]).unwrap().name(), "a:1");
    }

    #[test]
    fn get_follows_the_faster_replica() {
        let mut registry = registry();
        let active = ActiveSet::derive(&registry.members(), 2);
        let key = (0..)
            .map(|i| format!("key-{i}"))
            .find(|key| !active.targets(key).contains(&"a:1"))
            .unwrap();
        let targets = active.targets(&key);
        assert_eq!(targets.len(), 2);
        let (first, second) = (targets[0].to_string(), targets[1].to_string());

        registry.remote_mut(&first).unwrap().set_latency(10);
        registry.remote_mut(&second).unwrap().set_latency(20);
        assert_eq!(fastest(&registry, &targets).unwrap().name(), first);

        registry.remote_mut(&first).unwrap().set_latency(30);
        assert_eq!(fastest(&registry, &targets).unwrap().name(), second);
    }
}

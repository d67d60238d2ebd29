//! The ring runtime.
//!
//! One task per worker owns every piece of mutable ring state: the member
//! registry, the active set, the gossip round, the cache and the table of
//! pending requests. Everything else talks to it over channels:
//!
//! - **Callers** hold a [`RingHandle`] and send [`Command`]s, each carrying a
//!   oneshot for the answer.
//! - **Peer connections and the listener** report [`PeerEvent`]s.
//! - **Timers and store tasks** report [`Event`]s.
//!
//! Handlers run to completion without locks; anything slow (store I/O,
//! network writes) happens in other tasks and comes back as an event.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::LruCache;
use crate::config::{RingConfig, worker_port};
use crate::connection::{Origin, PeerConnection, PeerEvent, serve_listener};
use crate::error::RingError;
use crate::errors::now_micros;
use crate::gossip::{self, GossipRound};
use crate::hash_ring::ActiveSet;
use crate::heartbeat::HeartbeatMonitor;
use crate::host_pattern;
use crate::member::{
    LocalMember, Member, MemberRegistry, MemberStatus, RemoteMember, Status, member_name, parse_name,
};
use crate::message::{
    GetReply, GetRequest, Heartbeat, Message, RequestId, Roster, RosterAdd, RosterSync, SetReply,
    SetRequest,
};
use crate::store::{Store, StoreError, open_store};
use crate::timer::Timer;
use crate::value_store::{GetResult, PendingRequests, SetResult, fastest};

/// Cloneable handle to a running ring worker.
#[derive(Clone)]
pub struct RingHandle {
    commands: mpsc::UnboundedSender<Command>,
    stable: watch::Receiver<bool>,
    name: String,
    local_addr: SocketAddr,
}

impl RingHandle {
    /// This member's `host:port` name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the member listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stable(&self) -> bool {
        *self.stable.borrow()
    }

    /// Resolves once gossip has converged.
    pub async fn wait_stable(&self) -> Result<(), RingError> {
        let mut stable = self.stable.clone();
        stable
            .wait_for(|stable| *stable)
            .await
            .map(|_| ())
            .map_err(|_| RingError::Shutdown)
    }

    /// Reads `key` from the fastest up replica.
    pub async fn get(&self, key: &str) -> GetResult {
        self.request(|reply| Command::Get {
            key: key.to_string(),
            reply,
        })
        .await?
    }

    /// Writes `key` to every replica and reports which ones stored it.
    pub async fn set(&self, key: &str, value: &str) -> SetResult {
        self.request(|reply| Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            reply,
        })
        .await?
    }

    /// The members that hold `key`, primary first.
    pub async fn targets(&self, key: &str) -> Result<Vec<String>, RingError> {
        self.request(|reply| Command::Targets {
            key: key.to_string(),
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<RingStatus, RingError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn roster(&self) -> Result<Roster, RingError> {
        self.request(|reply| Command::Roster { reply }).await
    }

    /// Stops the runtime, its timers, the listener and every peer connection.
    pub async fn shutdown(&self) -> Result<(), RingError> {
        self.request(|done| Command::Shutdown { done }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| RingError::Shutdown)?;
        rx.await.map_err(|_| RingError::Shutdown)
    }
}

/// Point-in-time description of a worker, served by the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RingStatus {
    pub name: String,
    pub worker_index: usize,
    pub process_count: usize,
    pub is_stable: bool,
    pub attempt: u64,
    pub replicas: usize,
    pub leader: Option<String>,
    /// Up members in ring order.
    pub active: Vec<String>,
    pub members: Vec<MemberStatus>,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub store: String,
    pub pending_requests: usize,
    /// Wall-clock microseconds when the worker started.
    pub started: u64,
}

impl RingStatus {
    pub fn member(&self, name: &str) -> Option<&MemberStatus> {
        self.members.iter().find(|member| member.name == name)
    }
}

/// Requests from [`RingHandle`]s.
enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<GetResult>,
    },
    Set {
        key: String,
        value: String,
        reply: oneshot::Sender<SetResult>,
    },
    Targets {
        key: String,
        reply: oneshot::Sender<Result<Vec<String>, RingError>>,
    },
    Status {
        reply: oneshot::Sender<RingStatus>,
    },
    Roster {
        reply: oneshot::Sender<Roster>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Who is waiting on a local store read.
#[derive(Debug)]
enum ReadWaiter {
    Caller(oneshot::Sender<GetResult>),
    Peer { from: Origin, id: RequestId },
}

/// Who is waiting on a local store write.
#[derive(Debug)]
enum WriteWaiter {
    Request(RequestId),
    Peer { from: Origin, id: RequestId },
}

/// Timer and store completions.
#[derive(Debug)]
enum Event {
    GossipTick,
    HeartbeatTick,
    RequestExpired(RequestId),
    StoreRead {
        key: String,
        result: Result<Option<String>, StoreError>,
        waiter: ReadWaiter,
        /// Write sequence at issue time; `None` if a write was in flight.
        issued_at: Option<u64>,
    },
    StoreWrote {
        key: String,
        result: Result<(), StoreError>,
        waiter: WriteWaiter,
    },
}

/// Bootstrap seeds: sibling workers, pattern hosts and explicit peers.
pub fn seed_names(config: &RingConfig, local_name: &str) -> Vec<String> {
    let mut seeds = Vec::new();

    if !config.client_only {
        for index in 0..config.process_count {
            if index != config.worker_index {
                if let Some(port) = worker_port(config.base_port, index) {
                    seeds.push(member_name(&config.host, port));
                }
            }
        }
    }

    if let Some(pattern) = &config.host_pattern {
        for host in host_pattern::expand(pattern) {
            if host != config.host {
                seeds.push(member_name(&host, config.base_port));
            }
        }
    }

    seeds.extend(config.peers.iter().cloned());
    let mut seen = HashSet::new();
    seeds.retain(|seed| seed != local_name && seen.insert(seed.clone()));
    seeds
}

/// Binds the member listener, seeds the registry and starts the runtime.
///
/// The first gossip round runs immediately. A worker with nobody to ask
/// stabilizes on that first round.
///
/// # Errors
///
/// Fails if `base_port + worker_index` is not a valid port or the listener
/// cannot bind it on `0.0.0.0`.
pub async fn spawn_ring(config: RingConfig) -> Result<RingHandle> {
    let port = config.port().with_context(|| {
        format!(
            "worker {} has no port above base port {}",
            config.worker_index, config.base_port
        )
    })?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind member port {port}"))?;
    let local_addr = listener
        .local_addr()
        .context("member listener has no local address")?;

    let local = LocalMember::new(&config.host, local_addr.port());
    let store = open_store(config.data_dir.as_deref(), config.worker_index).await;
    info!(member = %local.name(), %local_addr, store = %store.describe(), "ring member listening");

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
    let (stable_tx, stable_rx) = watch::channel(false);

    let listener = tokio::spawn(serve_listener(listener, peer_events_tx.clone())).abort_handle();
    let registry = MemberRegistry::new(local);
    let active = ActiveSet::derive(&registry.members(), config.replicas);

    let mut ring = Ring {
        cache: LruCache::new(config.cache_size),
        heartbeat: HeartbeatMonitor::default(),
        registry,
        active,
        store,
        round: GossipRound::new(),
        pending: PendingRequests::new(),
        write_seq: 0,
        writes_in_flight: 0,
        gossip_timer: Timer::idle(),
        heartbeat_timer: Timer::idle(),
        is_stable: false,
        stable: stable_tx,
        events_tx,
        peer_events_tx,
        listener,
        started: now_micros(),
        config,
    };

    for seed in seed_names(&ring.config, ring.registry.local_name()) {
        ring.add_member(&seed);
    }
    ring.gossip_timer = Timer::every(ring.config.gossip_interval, ring.events_tx.clone(), || {
        Event::GossipTick
    });

    let name = ring.registry.local_name().to_string();
    tokio::spawn(ring.run(commands_rx, events_rx, peer_events_rx));

    Ok(RingHandle {
        commands: commands_tx,
        stable: stable_rx,
        name,
        local_addr,
    })
}

struct Ring {
    config: RingConfig,
    registry: MemberRegistry,
    /// Replaced wholesale whenever the registry or a status changes.
    active: ActiveSet,
    cache: LruCache,
    store: Arc<dyn Store>,
    round: GossipRound,
    pending: PendingRequests,
    /// Bumped by every local write; reads compare it to decide whether
    /// their result may fill the cache.
    write_seq: u64,
    writes_in_flight: usize,
    heartbeat: HeartbeatMonitor,
    gossip_timer: Timer,
    heartbeat_timer: Timer,
    is_stable: bool,
    stable: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<Event>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    listener: AbortHandle,
    started: u64,
}

impl Ring {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    // Every handle is gone.
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(event) = peer_events.recv() => self.handle_peer_event(event),
            }
        }
        info!(member = %self.registry.local_name(), "ring runtime stopped");
    }

    /// Returns false once shutdown was requested.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Get { key, reply } => self.get(key, reply),
            Command::Set { key, value, reply } => self.set(key, value, reply),
            Command::Targets { key, reply } => {
                let _ = reply.send(self.targets(&key));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.registry.roster());
            }
            Command::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::GossipTick => self.gossip_round(),
            Event::HeartbeatTick => self.send_heartbeat(),
            Event::RequestExpired(id) => self.pending.expire(id, self.config.request_timeout),
            Event::StoreRead {
                key,
                result,
                waiter,
                issued_at,
            } => {
                let value = match result {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%key, error = %err, "store read failed");
                        None
                    }
                };
                // A read that overlapped a local write may hold the old value.
                if let Some(value) = &value {
                    if issued_at == Some(self.write_seq) {
                        self.cache.set(&key, value);
                    }
                }
                self.finish_read(waiter, value);
            }
            Event::StoreWrote { key, result, waiter } => {
                self.writes_in_flight -= 1;
                let result = result.map_err(|err| {
                    warn!(%key, error = %err, "store write failed");
                    err.to_string()
                });
                match waiter {
                    WriteWaiter::Request(id) => {
                        self.pending.resolve_set(id, result);
                    }
                    WriteWaiter::Peer { from, id } => {
                        let ok = result.is_ok();
                        self.reply(&from, Message::SetReply(SetReply { id, ok }));
                    }
                }
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { member } => self.set_status(&member, Status::Up),
            PeerEvent::Failed {
                member,
                class,
                message,
            } => {
                if let Some(remote) = self.registry.remote_mut(&member) {
                    remote.errors_mut().record(class, message);
                }
                self.pending.cancel_member(&member);
                self.set_status(&member, Status::Down);
            }
            PeerEvent::ListenerFailed { class, message } => {
                warn!(%class, error = %message, "member listener accept failed");
                self.registry.local_mut().errors_mut().record(class, message);
            }
            PeerEvent::Received { from, message } => self.handle_message(from, message),
        }
    }

    fn handle_message(&mut self, from: Origin, message: Message) {
        trace!(kind = message.kind(), ?from, "received");
        match message {
            Message::RosterSync(sync) => self.on_roster_sync(&from, sync),
            Message::RosterAdd(add) => self.on_roster_add(add),
            Message::HeartbeatStart(beat) => self.reply(&from, Message::HeartbeatEnd(beat)),
            Message::HeartbeatEnd(beat) => self.on_heartbeat_end(&from, beat),
            Message::Get(GetRequest { id, key }) => {
                self.read_local(key, ReadWaiter::Peer { from, id });
            }
            Message::Set(SetRequest { id, key, value }) => {
                self.write_local(key, value, WriteWaiter::Peer { from, id });
            }
            Message::GetReply(GetReply { id, value }) => {
                self.pending.resolve_get(id, value);
            }
            Message::SetReply(SetReply { id, ok }) => {
                let result = if ok {
                    Ok(())
                } else {
                    Err("replica failed to store the value".to_string())
                };
                self.pending.resolve_set(id, result);
            }
        }
    }

    fn reply(&self, to: &Origin, message: Message) {
        let sent = match to {
            Origin::Member(name) => self
                .registry
                .remote(name)
                .is_some_and(|member| member.send(message)),
            Origin::Session { reply, .. } => reply.send(message),
        };
        if !sent {
            debug!(?to, "dropping reply for a closed session");
        }
    }

    // Membership

    /// Adds a newly learned member and starts connecting to it.
    fn add_member(&mut self, name: &str) -> bool {
        let Some((host, port)) = parse_name(name) else {
            warn!(%name, "ignoring malformed member name");
            return false;
        };
        if self.registry.contains(&member_name(&host, port)) {
            return false;
        }

        let (link, connection) =
            PeerConnection::spawn(&host, port, self.peer_events_tx.clone(), self.config.connection());
        let member = RemoteMember::new(&host, port, link).with_connection(connection.abort_handle());
        info!(member = %member.name(), "discovered member");
        self.registry.insert(member);
        self.refresh_active();
        true
    }

    fn set_status(&mut self, member: &str, status: Status) {
        if self.registry.set_status(member, status) {
            info!(%member, %status, "member status changed");
            self.refresh_active();
        }
    }

    fn refresh_active(&mut self) {
        let active = ActiveSet::derive(&self.registry.members(), self.config.replicas);
        self.registry.set_leader(active.leader());
        self.active = active;
    }

    fn gossip_round(&mut self) {
        if self.is_stable {
            return;
        }

        let request_count = self
            .registry
            .remotes()
            .filter(|member| member.status() != Status::Down)
            .count();
        let attempt = self.round.begin(request_count);
        let sync = RosterSync {
            name: self.registry.local_name().to_string(),
            attempt,
            roster: self.registry.roster(),
        };
        for member in self.registry.remotes() {
            if member.status() != Status::Down {
                member.send(Message::RosterSync(sync.clone()));
            }
        }
        debug!(attempt, request_count, "gossip round");

        if self.round.is_complete() {
            self.stabilize();
        }
    }

    fn on_roster_sync(&mut self, from: &Origin, sync: RosterSync) {
        let ours = self.registry.roster();
        let answer = gossip::answer_sync(self.registry.local_name(), &ours, &sync);
        if !answer.is_match {
            for name in gossip::unknown_names(&ours, &sync.roster) {
                self.add_member(name);
            }
        }
        self.reply(from, Message::RosterAdd(answer));
    }

    fn on_roster_add(&mut self, add: RosterAdd) {
        for name in add.add.keys() {
            self.add_member(name);
        }
        if self.is_stable {
            return;
        }
        if self.round.record_reply(add.attempt, add.is_match) && self.round.is_complete() {
            self.stabilize();
        }
    }

    fn stabilize(&mut self) {
        self.gossip_timer.cancel();
        self.refresh_active();
        self.is_stable = true;
        self.heartbeat_timer = Timer::every(
            self.config.heartbeat_interval,
            self.events_tx.clone(),
            || Event::HeartbeatTick,
        );
        self.stable.send_replace(true);
        info!(
            member = %self.registry.local_name(),
            attempt = self.round.attempt(),
            active = self.active.len(),
            leader = ?self.active.leader(),
            "ring stabilized"
        );
    }

    // Heartbeats

    fn send_heartbeat(&mut self) {
        let Some(target) = self.heartbeat.pick(&self.active) else {
            return;
        };
        if let Some(member) = self.registry.remote(&target) {
            member.send(Message::HeartbeatStart(Heartbeat { start: now_micros() }));
        }
    }

    fn on_heartbeat_end(&mut self, from: &Origin, beat: Heartbeat) {
        // Echoes come back on our own connection to the member we pinged.
        let Origin::Member(name) = from else {
            debug!(?from, "ignoring heartbeat echo on an inbound session");
            return;
        };
        let elapsed = now_micros().saturating_sub(beat.start) as i64;
        if let Some(member) = self.registry.remote_mut(name) {
            let latency = self.heartbeat.fold(member.latency(), elapsed);
            member.set_latency(latency);
            trace!(member = %name, elapsed, latency, "heartbeat");
        }
    }

    // Values

    fn targets(&self, key: &str) -> Result<Vec<String>, RingError> {
        if !self.is_stable {
            return Err(RingError::NotStable);
        }
        Ok(self.active.targets(key).into_iter().map(str::to_string).collect())
    }

    fn get(&mut self, key: String, reply: oneshot::Sender<GetResult>) {
        if !self.is_stable {
            let _ = reply.send(Err(RingError::NotStable));
            return;
        }

        let targets = self.active.targets(&key);
        let chosen = fastest(&self.registry, &targets).map(|member| (member.name().to_string(), member.is_local()));
        let Some((member, is_local)) = chosen else {
            let _ = reply.send(Err(RingError::NoReplica(key)));
            return;
        };

        if is_local {
            self.read_local(key, ReadWaiter::Caller(reply));
            return;
        }

        let id = self.pending.next_id();
        let timeout = Timer::once(
            self.config.request_timeout,
            self.events_tx.clone(),
            Event::RequestExpired(id),
        );
        self.pending.insert_get(id, &member, reply, timeout);
        let sent = self
            .registry
            .remote(&member)
            .is_some_and(|remote| remote.send(Message::Get(GetRequest { id, key })));
        if !sent {
            self.pending.cancel(id);
        }
    }

    fn set(&mut self, key: String, value: String, reply: oneshot::Sender<SetResult>) {
        if !self.is_stable {
            let _ = reply.send(Err(RingError::NotStable));
            return;
        }

        let targets: Vec<String> = self
            .active
            .targets(&key)
            .into_iter()
            .map(str::to_string)
            .collect();
        if targets.is_empty() {
            let _ = reply.send(Err(RingError::NoReplica(key)));
            return;
        }

        let latch = self.pending.begin_set(&key, targets.len(), reply);
        for target in targets {
            let id = self.pending.next_id();
            let timeout = Timer::once(
                self.config.request_timeout,
                self.events_tx.clone(),
                Event::RequestExpired(id),
            );
            self.pending.insert_set(id, latch, &target, timeout);

            if target == self.registry.local_name() {
                self.write_local(key.clone(), value.clone(), WriteWaiter::Request(id));
                continue;
            }
            let request = Message::Set(SetRequest {
                id,
                key: key.clone(),
                value: value.clone(),
            });
            let sent = self
                .registry
                .remote(&target)
                .is_some_and(|remote| remote.send(request));
            if !sent {
                self.pending.cancel(id);
            }
        }
    }

    /// Cache first, then the store; a store hit is cached on the way back.
    fn read_local(&mut self, key: String, waiter: ReadWaiter) {
        if let Some(value) = self.cache.get(&key) {
            self.finish_read(waiter, Some(value));
            return;
        }

        let issued_at = (self.writes_in_flight == 0).then_some(self.write_seq);
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = store.get(&key).await;
            let _ = events.send(Event::StoreRead {
                key,
                result,
                waiter,
                issued_at,
            });
        });
    }

    fn finish_read(&self, waiter: ReadWaiter, value: Option<String>) {
        match waiter {
            ReadWaiter::Caller(reply) => {
                let _ = reply.send(Ok(value));
            }
            ReadWaiter::Peer { from, id } => {
                self.reply(&from, Message::GetReply(GetReply { id, value }));
            }
        }
    }

    fn write_local(&mut self, key: String, value: String, waiter: WriteWaiter) {
        self.cache.set(&key, &value);
        self.write_seq += 1;
        self.writes_in_flight += 1;

        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = store.put(&key, &value).await;
            let _ = events.send(Event::StoreWrote {
                key,
                result,
                waiter,
            });
        });
    }

    fn status(&self) -> RingStatus {
        RingStatus {
            name: self.registry.local_name().to_string(),
            worker_index: self.config.worker_index,
            process_count: self.config.process_count,
            is_stable: self.is_stable,
            attempt: self.round.attempt(),
            replicas: self.config.replicas,
            leader: self.active.leader().map(str::to_string),
            active: self.active.members().to_vec(),
            members: self
                .registry
                .members()
                .into_iter()
                .map(|member| member.describe())
                .collect(),
            cache_entries: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            store: self.store.describe(),
            pending_requests: self.pending.len(),
            started: self.started,
        }
    }

    fn shutdown(&mut self) {
        info!(member = %self.registry.local_name(), "shutting down ring");
        self.gossip_timer.cancel();
        self.heartbeat_timer.cancel();
        self.listener.abort();
        for member in self.registry.remotes_mut() {
            member.disconnect();
        }
        self.pending.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn lone_config() -> RingConfig {
        RingConfig {
            host: "127.0.0.1".into(),
            base_port: 0,
            gossip_interval: Duration::from_millis(20),
            ..RingConfig::default()
        }
    }

    #[test]
    fn seeds_siblings_pattern_hosts_and_peers() {
        let config = RingConfig {
            process_count: 3,
            worker_index: 1,
            host: "ring-0".into(),
            base_port: 12300,
            host_pattern: Some("ring-(0-2)".into()),
            peers: vec!["other:9000".into(), "ring-0:12301".into()],
            ..RingConfig::default()
        };
        let seeds = seed_names(&config, "ring-0:12301");
        assert_eq!(
            seeds,
            vec!["ring-0:12300", "ring-0:12302", "ring-1:12300", "ring-2:12300", "other:9000"]
        );
    }

    #[test]
    fn client_only_skips_siblings() {
        let config = RingConfig {
            process_count: 4,
            client_only: true,
            host: "solo".into(),
            ..RingConfig::default()
        };
        assert!(seed_names(&config, "solo:12300").is_empty());
    }

    #[tokio::test]
    async fn lone_member_stabilizes_and_serves_locally() {
        let ring = spawn_ring(lone_config()).await.unwrap();
        timeout(Duration::from_secs(2), ring.wait_stable())
            .await
            .expect("lone member should stabilize on its first round")
            .unwrap();

        assert_eq!(ring.get("missing").await, Ok(None));
        let report = ring.set("k", "v").await.unwrap();
        assert_eq!(report.acked, vec![ring.name().to_string()]);
        assert!(report.is_complete());
        assert_eq!(ring.get("k").await, Ok(Some("v".to_string())));
        assert_eq!(ring.targets("k").await.unwrap(), vec![ring.name().to_string()]);

        let status = ring.status().await.unwrap();
        assert!(status.is_stable);
        assert_eq!(status.leader.as_deref(), Some(ring.name()));
        assert_eq!(status.cache_entries, 1);

        ring.shutdown().await.unwrap();
        assert_eq!(ring.get("k").await, Err(RingError::Shutdown));
    }

    #[test]
    fn repeated_seeds_are_kept_once_in_order() {
        let config = RingConfig {
            host: "solo".into(),
            client_only: true,
            host_pattern: Some("(a|b)".into()),
            peers: vec!["b:12300".into(), "c:1".into(), "a:12300".into(), "c:1".into()],
            ..RingConfig::default()
        };
        assert_eq!(seed_names(&config, "solo:12300"), vec!["a:12300", "b:12300", "c:1"]);
    }

    #[test]
    fn siblings_past_the_port_range_are_skipped() {
        let config = RingConfig {
            process_count: 3,
            host: "edge".into(),
            base_port: 65534,
            ..RingConfig::default()
        };
        assert_eq!(seed_names(&config, "edge:65534"), vec!["edge:65535"]);
    }

    #[tokio::test]
    async fn worker_index_past_the_port_range_fails_to_spawn() {
        let config = RingConfig {
            base_port: 65535,
            worker_index: 1,
            ..lone_config()
        };
        assert!(spawn_ring(config).await.is_err());
    }

    #[tokio::test]
    async fn read_racing_a_write_does_not_cache_the_old_value() {
        let ring = spawn_ring(RingConfig {
            cache_size: 1,
            ..lone_config()
        })
        .await
        .unwrap();
        timeout(Duration::from_secs(2), ring.wait_stable())
            .await
            .unwrap()
            .unwrap();

        ring.set("k", "v1").await.unwrap();
        // Push "k" out of the one-entry cache so the next read hits the store.
        ring.set("other", "x").await.unwrap();

        let (_, written) = tokio::join!(ring.get("k"), ring.set("k", "v2"));
        assert!(written.unwrap().is_complete());
        assert_eq!(ring.get("k").await, Ok(Some("v2".to_string())));
        assert_eq!(ring.get("k").await, Ok(Some("v2".to_string())));

        ring.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn operations_wait_for_stability() {
        // A seed that accepts connections but never answers keeps every
        // round open.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed = format!("127.0.0.1:{}", silent.local_addr().unwrap().port());
        let config = RingConfig {
            peers: vec![seed.clone()],
            ..lone_config()
        };
        let ring = spawn_ring(config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!ring.is_stable());
        assert_eq!(ring.get("k").await, Err(RingError::NotStable));
        assert_eq!(ring.set("k", "v").await, Err(RingError::NotStable));
        assert_eq!(ring.targets("k").await, Err(RingError::NotStable));

        let roster = ring.roster().await.unwrap();
        assert!(roster.contains_key(&seed));
        ring.shutdown().await.unwrap();
    }
}

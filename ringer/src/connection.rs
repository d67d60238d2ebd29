//! TCP sessions between ring members.
//!
//! - [`PeerConnection`] is the outbound session this process keeps to each
//!   remote member. It reconnects forever and reports state changes to the
//!   ring runtime as [`PeerEvent`]s.
//! - [`serve_listener`] accepts sessions opened by other members. Requests
//!   that arrive on an accepted session are answered on that same session.
//!
//! Both directions share the same framing: complete lines are decoded into
//! [`Message`]s and malformed lines are logged and dropped without closing
//! the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream, lookup_host, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::errors::ErrorClass;
use crate::frame::{FrameBuffer, FrameError, write_frame};
use crate::message::Message;

const READ_CHUNK: usize = 16 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Sending half of a session's outbound queue.
///
/// Messages sent while the session is not connected wait in the queue and
/// are written in order once it is.
#[derive(Debug, Clone)]
pub struct Link {
    tx: mpsc::UnboundedSender<Message>,
}

impl Link {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the session task is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Where an inbound message came from.
#[derive(Debug, Clone)]
pub enum Origin {
    /// Our own outbound connection to this member.
    Member(String),
    /// A session another member opened to us.
    Session { addr: SocketAddr, reply: Link },
}

#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        member: String,
    },
    Failed {
        member: String,
        class: ErrorClass,
        message: String,
    },
    Received {
        from: Origin,
        message: Message,
    },
    ListenerFailed {
        class: ErrorClass,
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub reconnect_delay: Duration,
    /// Backoff after a host fails to resolve; such hosts are treated as not
    /// yet provisioned rather than dead.
    pub unresolved_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug)]
struct Failure {
    class: ErrorClass,
    message: String,
}

impl Failure {
    fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    fn io(error: std::io::Error) -> Self {
        Self::new(ErrorClass::classify(&error), error.to_string())
    }
}

pub struct PeerConnection {
    member: String,
    host: String,
    port: u16,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<PeerEvent>,
    config: ConnectionConfig,
    state: ConnectionState,
}

impl PeerConnection {
    /// Starts the session task for `host:port` and returns its queue.
    ///
    /// The task stops when every [`Link`] clone is dropped or when its
    /// handle is aborted.
    pub fn spawn(
        host: &str,
        port: u16,
        events: mpsc::UnboundedSender<PeerEvent>,
        config: ConnectionConfig,
    ) -> (Link, JoinHandle<()>) {
        let (link, outbound) = Link::channel();
        let connection = PeerConnection {
            member: format!("{host}:{port}"),
            host: host.to_string(),
            port,
            outbound,
            events,
            config,
            state: ConnectionState::Connecting,
        };
        let handle = tokio::spawn(connection.run());
        (link, handle)
    }

    async fn run(mut self) {
        loop {
            self.transition(ConnectionState::Connecting);
            let failure = match self.connect().await {
                Ok(stream) => {
                    self.transition(ConnectionState::Connected);
                    if !self.notify(PeerEvent::Connected {
                        member: self.member.clone(),
                    }) {
                        return;
                    }
                    match self.serve(stream).await {
                        Some(failure) => failure,
                        None => return,
                    }
                }
                Err(failure) => failure,
            };

            debug!(member = %self.member, class = %failure.class, error = %failure.message, "peer connection failed");
            let delay = match failure.class {
                ErrorClass::Unresolved => self.config.unresolved_delay,
                _ => self.config.reconnect_delay,
            };
            if !self.notify(PeerEvent::Failed {
                member: self.member.clone(),
                class: failure.class,
                message: failure.message,
            }) {
                return;
            }

            self.transition(ConnectionState::Reconnecting);
            sleep(delay).await;
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        trace!(member = %self.member, from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }

    /// Returns false once the ring runtime has gone away.
    fn notify(&self, event: PeerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    async fn connect(&self) -> Result<TcpStream, Failure> {
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|error| Failure::new(ErrorClass::Unresolved, error.to_string()))?;
        let addr = addrs.next().ok_or_else(|| {
            Failure::new(ErrorClass::Unresolved, format!("no addresses for {}", self.host))
        })?;

        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(error)) => Err(Failure::io(error)),
            Err(_) => Err(Failure::new(
                ErrorClass::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }

    /// Pumps the session until it fails; `None` means the queue was closed.
    async fn serve(&mut self, stream: TcpStream) -> Option<Failure> {
        let (mut reader, mut writer) = stream.into_split();
        let mut frames = FrameBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            select! {
                outbound = self.outbound.recv() => {
                    let message = outbound?;
                    if let Err(error) = send_message(&mut writer, &message).await {
                        return Some(Failure::io(error));
                    }
                }
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        return Some(Failure::new(ErrorClass::Reset, "connection closed by peer"));
                    }
                    Ok(n) => {
                        for message in decode_lines(frames.push(&chunk[..n]), &self.member) {
                            let event = PeerEvent::Received {
                                from: Origin::Member(self.member.clone()),
                                message,
                            };
                            if !self.notify(event) {
                                return None;
                            }
                        }
                    }
                    Err(error) => return Some(Failure::io(error)),
                }
            }
        }
    }
}

async fn send_message(writer: &mut OwnedWriteHalf, message: &Message) -> std::io::Result<()> {
    trace!(kind = message.kind(), "sending frame");
    write_frame(writer, &message.to_frame()).await
}

fn decode_lines(lines: Vec<Result<String, FrameError>>, peer: &str) -> Vec<Message> {
    lines
        .into_iter()
        .filter_map(|line| match line.and_then(|line| Message::parse(&line)) {
            Ok(message) => Some(message),
            Err(error) => {
                warn!(%peer, %error, "dropping malformed frame");
                None
            }
        })
        .collect()
}

/// Accepts sessions from other members until the task is aborted.
///
/// Accepted sessions live in a [`JoinSet`] owned by this task, so aborting
/// the listener also tears down every session it accepted.
pub async fn serve_listener(listener: TcpListener, events: mpsc::UnboundedSender<PeerEvent>) {
    let mut sessions = JoinSet::new();

    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted member session");
                    sessions.spawn(run_session(stream, addr, events.clone()));
                }
                Err(error) => {
                    let event = PeerEvent::ListenerFailed {
                        class: ErrorClass::classify(&error),
                        message: error.to_string(),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                    sleep(ACCEPT_RETRY).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn run_session(stream: TcpStream, addr: SocketAddr, events: mpsc::UnboundedSender<PeerEvent>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (reply, mut outbound) = Link::channel();
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let peer = addr.to_string();

    loop {
        select! {
            Some(message) = outbound.recv() => {
                if let Err(error) = send_message(&mut writer, &message).await {
                    debug!(%addr, %error, "member session write failed");
                    break;
                }
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(%addr, "member session closed");
                    break;
                }
                Ok(n) => {
                    for message in decode_lines(frames.push(&chunk[..n]), &peer) {
                        let event = PeerEvent::Received {
                            from: Origin::Session { addr, reply: reply.clone() },
                            message,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    debug!(%addr, %error, "member session read failed");
                    break;
                }
            }
        }
    }

    info!(%addr, "member session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Heartbeat;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const WAIT: Duration = Duration::from_secs(3);

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(50),
            unresolved_delay: Duration::from_secs(60),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_after_reconnect() {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = vacant.local_addr().unwrap().port();
        drop(vacant);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (link, handle) = PeerConnection::spawn("127.0.0.1", port, events_tx, config());

        match next_event(&mut events).await {
            PeerEvent::Failed { class, .. } => assert_eq!(class, ErrorClass::Refused),
            other => panic!("expected refused connection, got {other:?}"),
        }

        for start in 1..=3 {
            assert!(link.send(Message::HeartbeatStart(Heartbeat { start })));
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        loop {
            if let PeerEvent::Connected { member } = next_event(&mut events).await {
                assert_eq!(member, format!("127.0.0.1:{port}"));
                break;
            }
        }

        let mut lines = BufReader::new(stream).lines();
        for start in 1..=3 {
            let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
            assert_eq!(line, format!("heartbeat:start~{{\"start\":{start}}}"));
        }

        handle.abort();
    }

    #[tokio::test]
    async fn unresolved_host_backs_off_with_the_long_delay() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_link, handle) = PeerConnection::spawn("no-such-host.invalid", 12300, events_tx, config());

        match timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(PeerEvent::Failed { member, class, .. })) => {
                assert_eq!(member, "no-such-host.invalid:12300");
                assert_eq!(class, ErrorClass::Unresolved);
            }
            other => panic!("expected an unresolved failure, got {other:?}"),
        }

        // Several reconnect delays pass without a second attempt.
        let retry = timeout(config().reconnect_delay * 6, events.recv()).await;
        assert!(retry.is_err(), "retried too soon: {retry:?}");

        handle.abort();
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_session_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_link, handle) = PeerConnection::spawn("127.0.0.1", port, events_tx, config());
        let (mut stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, PeerEvent::Connected { .. }));

        stream
            .write_all(b"set~{broken\nno-such-type~1\nheartbeat:end~{\"start\":5}\n")
            .await
            .unwrap();

        match next_event(&mut events).await {
            PeerEvent::Received { from, message } => {
                assert!(matches!(from, Origin::Member(name) if name == format!("127.0.0.1:{port}")));
                assert_eq!(message, Message::HeartbeatEnd(Heartbeat { start: 5 }));
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn peer_hangup_is_reported_as_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_link, handle) = PeerConnection::spawn("127.0.0.1", port, events_tx, config());
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, PeerEvent::Connected { .. }));

        drop(stream);
        match next_event(&mut events).await {
            PeerEvent::Failed { class, .. } => assert_eq!(class, ErrorClass::Reset),
            other => panic!("expected reset, got {other:?}"),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn accepted_sessions_reply_on_the_same_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve_listener(listener, events_tx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"heartbeat:start~{\"start\":9}\n").await.unwrap();

        let reply = match next_event(&mut events).await {
            PeerEvent::Received {
                from: Origin::Session { reply, .. },
                message: Message::HeartbeatStart(beat),
            } => {
                assert_eq!(beat.start, 9);
                reply
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert!(reply.send(Message::HeartbeatEnd(Heartbeat { start: 9 })));

        let mut lines = BufReader::new(client).lines();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
        assert_eq!(line, "heartbeat:end~{\"start\":9}");

        server.abort();
    }
}

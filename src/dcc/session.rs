//! Per-transfer DCC state machine.
//!
//! ```text
//! Init ──connect()──► Connecting ──writable──► Connected ◄──────────┐
//!  │  └─listen()──► InitPassive ──accept──────►    │ data           │ ack sent
//!  └─request_resume()─► WaitingForResumeAck        ▼                │
//!        └──ACCEPT──► Init                    ConfirmingSize ───────┘
//! any error / completion / cancel ──► Removed
//! ```
//!
//! A session never touches the download file itself. Everything it learns is
//! reported through [`SessionSink`], which the orchestrator implements.

use crate::dcc::error::{DccError, Result};
use crate::dcc::mux::{Interest, Readiness};
use crate::dcc::parser::{DccOffer, DccRequest, ResumeKey, ResumePosition, RESUME_FILENAME};
use crate::dcc::transport::{Endpoint, ReadOutcome, Transport, WriteOutcome};
use rustls::ClientConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

pub type SessionId = u64;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Connected,
    ConfirmingSize,
    WaitingForResumeAck,
    InitPassive,
    Removed,
}

#[derive(Debug)]
pub enum SessionEvent<'a> {
    Connected,
    DataReceived(&'a [u8]),
    Completed,
    Failed(DccError),
    ResumeAck(u64),
}

/// Receiver of session events. An error returned for `DataReceived` or
/// `ResumeAck` fails the session.
pub trait SessionSink {
    fn on_event(&mut self, id: SessionId, event: SessionEvent<'_>) -> Result<()>;
}

/// Offset confirmation in flight; survives partial writes.
#[derive(Debug)]
struct PendingAck {
    bytes: [u8; 4],
    written: usize,
    offset: u64,
}

impl PendingAck {
    fn new(offset: u64) -> Self {
        // The wire value is 32 bits; larger offsets wrap like every other client.
        Self {
            bytes: (offset as u32).to_be_bytes(),
            written: 0,
            offset,
        }
    }
}

#[derive(Debug)]
pub struct DccSession {
    id: SessionId,
    nick: String,
    filename: String,
    state: SessionState,
    endpoint: Option<Endpoint>,
    remote: Option<SocketAddrV4>,
    remote_port: u16,
    passive_token: Option<u64>,
    secure: bool,
    tls_config: Option<Arc<ClientConfig>>,
    confirm_offsets: bool,
    expected_size: u64,
    received_size: u64,
    confirmed_offset: u64,
    pending_ack: Option<PendingAck>,
    buf: Box<[u8]>,
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Kick off a non-blocking connect; completion shows up as write readiness.
fn start_connect(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SocketAddr::V4(addr).into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    TcpStream::from_std(std::net::TcpStream::from(socket))
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    socket.listen(1)
}

impl DccSession {
    pub fn new(id: SessionId, nick: &str, offer: &DccOffer, confirm_offsets: bool) -> Self {
        let passive = offer.is_passive();
        Self {
            id,
            nick: nick.to_string(),
            filename: offer.filename.clone(),
            state: SessionState::Init,
            endpoint: None,
            remote: (!passive).then(|| SocketAddrV4::new(offer.ip, offer.port)),
            remote_port: offer.port,
            passive_token: if passive { offer.token } else { None },
            secure: offer.secure,
            tls_config: None,
            confirm_offsets,
            expected_size: offer.size,
            received_size: 0,
            confirmed_offset: 0,
            pending_ack: None,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_removed(&self) -> bool {
        self.state == SessionState::Removed
    }

    pub fn is_passive(&self) -> bool {
        self.passive_token.is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn passive_token(&self) -> Option<u64> {
        self.passive_token
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn received_size(&self) -> u64 {
        self.received_size
    }

    pub fn confirmed_offset(&self) -> u64 {
        self.confirmed_offset
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Port for active transfers, token for passive ones.
    pub fn resume_key(&self) -> ResumeKey {
        match self.passive_token {
            Some(token) => ResumeKey::Token(token),
            None => ResumeKey::Port(self.remote_port),
        }
    }

    fn transport(&self) -> Option<&Transport> {
        match &self.endpoint {
            Some(Endpoint::Stream(transport)) => Some(transport),
            _ => None,
        }
    }

    fn transport_mut(&mut self) -> Option<&mut Transport> {
        match &mut self.endpoint {
            Some(Endpoint::Stream(transport)) => Some(transport),
            _ => None,
        }
    }

    pub fn has_buffered_plaintext(&self) -> bool {
        self.transport().is_some_and(Transport::has_buffered_plaintext)
    }

    /// What the socket should be watched for, derived from the state alone
    /// (plus queued TLS records while connected).
    pub fn interest(&self) -> Interest {
        match self.state {
            SessionState::Connecting | SessionState::ConfirmingSize => Interest::WRITE,
            SessionState::Connected => {
                if self.transport().is_some_and(Transport::wants_write) {
                    Interest::READ_WRITE
                } else {
                    Interest::READ
                }
            }
            SessionState::InitPassive => Interest::READ,
            SessionState::Init | SessionState::WaitingForResumeAck | SessionState::Removed => {
                Interest::NONE
            }
        }
    }

    /// Start the outbound connection of an active transfer.
    pub fn connect(&mut self, tls_config: Option<Arc<ClientConfig>>, sink: &mut dyn SessionSink) {
        if self.state != SessionState::Init {
            debug!("session {}: connect ignored in state {:?}", self.id, self.state);
            return;
        }
        let Some(addr) = self.remote else {
            self.fail(sink, DccError::Protocol("passive transfer cannot connect".into()));
            return;
        };
        self.tls_config = tls_config;
        match start_connect(addr) {
            Ok(stream) => {
                trace!("session {}: connecting to {}", self.id, addr);
                self.endpoint = Some(Endpoint::Stream(Transport::Plain(stream)));
                self.state = SessionState::Connecting;
            }
            Err(source) => self.fail(
                sink,
                DccError::Connect {
                    addr: addr.to_string(),
                    source,
                },
            ),
        }
    }

    /// Bind the listener of a passive transfer and return the `DCC SEND`
    /// that tells the peer where to connect.
    pub fn listen(
        &mut self,
        listen_ip: Ipv4Addr,
        listen_port: u16,
        sink: &mut dyn SessionSink,
    ) -> Option<DccRequest> {
        if self.state != SessionState::Init {
            debug!("session {}: listen ignored in state {:?}", self.id, self.state);
            return None;
        }
        let bound = bind_listener(listen_port).and_then(|l| Ok((l.local_addr()?.port(), l)));
        match bound {
            Ok((port, listener)) => {
                debug!("session {}: listening on port {}", self.id, port);
                self.endpoint = Some(Endpoint::Listener(listener));
                self.state = SessionState::InitPassive;
                Some(DccRequest::Send(DccOffer {
                    filename: self.filename.clone(),
                    ip: listen_ip,
                    port,
                    size: self.expected_size,
                    token: self.passive_token,
                    secure: false,
                }))
            }
            Err(source) => {
                self.fail(
                    sink,
                    DccError::Connect {
                        addr: format!("0.0.0.0:{}", listen_port),
                        source,
                    },
                );
                None
            }
        }
    }

    /// Ask the sender to continue from `position`.
    pub fn request_resume(&mut self, position: u64) -> Option<DccRequest> {
        if self.state != SessionState::Init {
            return None;
        }
        self.state = SessionState::WaitingForResumeAck;
        Some(DccRequest::Resume(ResumePosition {
            filename: RESUME_FILENAME.to_string(),
            key: self.resume_key(),
            position,
        }))
    }

    /// Handle the sender's `DCC ACCEPT`. Back in `Init` afterwards, ready to
    /// connect or listen as if freshly accepted.
    pub fn resume_acknowledged(&mut self, position: u64, sink: &mut dyn SessionSink) -> Result<()> {
        if self.state != SessionState::WaitingForResumeAck {
            return Err(DccError::ResumeMismatch(self.resume_key().to_string()));
        }
        if self.expected_size > 0 && position > self.expected_size {
            self.fail(
                sink,
                DccError::Protocol(format!(
                    "resume position {} is past the end of {}",
                    position, self.filename
                )),
            );
            return Ok(());
        }
        self.received_size = position;
        self.confirmed_offset = position;
        self.state = SessionState::Init;
        if let Err(e) = sink.on_event(self.id, SessionEvent::ResumeAck(position)) {
            self.fail(sink, e);
        }
        Ok(())
    }

    /// Finish a transfer whose bytes are all on disk already.
    pub fn complete_without_transfer(&mut self, sink: &mut dyn SessionSink) {
        self.received_size = self.expected_size;
        self.confirmed_offset = self.expected_size;
        self.complete(sink);
    }

    /// Drop the session on external request. Idempotent.
    pub fn cancel(&mut self, sink: &mut dyn SessionSink) {
        self.fail(sink, DccError::Cancelled);
    }

    /// Tear down with an error found outside the session, such as a local
    /// file problem.
    pub fn fail_with(&mut self, error: DccError, sink: &mut dyn SessionSink) {
        self.fail(sink, error);
    }

    pub fn on_ready(&mut self, readiness: Readiness, sink: &mut dyn SessionSink) {
        match readiness {
            Readiness::Failed(source) => {
                let error = match (self.state, self.remote) {
                    (SessionState::Connecting, Some(addr)) => DccError::Connect {
                        addr: addr.to_string(),
                        source,
                    },
                    _ => DccError::Io(source),
                };
                self.fail(sink, error);
            }
            Readiness::Incoming(stream) => self.accept_incoming(stream, sink),
            Readiness::Io { readable, writable } => match self.state {
                SessionState::Connecting if writable => self.finish_connect(sink),
                SessionState::Connected => {
                    if writable && self.transport().is_some_and(Transport::wants_write) {
                        self.flush_transport(sink);
                    }
                    if readable && self.state == SessionState::Connected {
                        self.receive(sink);
                    }
                }
                SessionState::ConfirmingSize if writable => self.send_confirmation(sink),
                _ => {}
            },
        }
    }

    fn finish_connect(&mut self, sink: &mut dyn SessionSink) {
        let Some(addr) = self.remote else { return };
        let checked = match self.transport() {
            Some(transport) => match transport.stream().take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => transport.stream().peer_addr().map(|_| ()),
            },
            None => return,
        };
        if let Err(source) = checked {
            self.fail(
                sink,
                DccError::Connect {
                    addr: addr.to_string(),
                    source,
                },
            );
            return;
        }

        if self.secure {
            let Some(Endpoint::Stream(Transport::Plain(stream))) = self.endpoint.take() else {
                return;
            };
            let Some(config) = self.tls_config.clone() else {
                self.fail(sink, DccError::Tls("no TLS configuration for SSEND".into()));
                return;
            };
            match Transport::tls(stream, config, *addr.ip()) {
                Ok(transport) => self.endpoint = Some(Endpoint::Stream(transport)),
                Err(e) => {
                    self.fail(sink, e);
                    return;
                }
            }
        }

        self.state = SessionState::Connected;
        let _ = sink.on_event(self.id, SessionEvent::Connected);
        // Get the ClientHello on the wire without waiting a tick.
        if self.secure {
            self.flush_transport(sink);
        }
    }

    fn accept_incoming(&mut self, stream: TcpStream, sink: &mut dyn SessionSink) {
        if self.state != SessionState::InitPassive {
            return;
        }
        if let Ok(SocketAddr::V4(peer)) = stream.peer_addr() {
            self.remote = Some(peer);
        }
        // Replacing the listener closes it; only one peer is ever accepted.
        self.endpoint = Some(Endpoint::Stream(Transport::Plain(stream)));
        self.state = SessionState::Connected;
        let _ = sink.on_event(self.id, SessionEvent::Connected);
    }

    fn flush_transport(&mut self, sink: &mut dyn SessionSink) {
        if let Some(Err(e)) = self.transport_mut().map(Transport::flush) {
            self.fail(sink, e);
        }
    }

    fn receive(&mut self, sink: &mut dyn SessionSink) {
        loop {
            let outcome = match self.endpoint.as_mut() {
                Some(Endpoint::Stream(transport)) => transport.read(&mut self.buf),
                _ => return,
            };
            let n = match outcome {
                Ok(ReadOutcome::Data(n)) => n,
                Ok(ReadOutcome::WouldBlock) => return,
                Ok(ReadOutcome::WantWrite) => {
                    self.state = SessionState::ConfirmingSize;
                    return;
                }
                Ok(ReadOutcome::Closed) => {
                    self.peer_closed(sink);
                    return;
                }
                Err(e) => {
                    self.io_failed(sink, e);
                    return;
                }
            };

            let received = self.received_size + n as u64;
            if self.expected_size > 0 && received > self.expected_size {
                self.fail(
                    sink,
                    DccError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("peer sent more than the offered {} bytes", self.expected_size),
                    )),
                );
                return;
            }
            self.received_size = received;
            if let Err(e) = sink.on_event(self.id, SessionEvent::DataReceived(&self.buf[..n])) {
                self.fail(sink, e);
                return;
            }

            if self.confirm_offsets {
                self.queue_confirmation();
                self.state = SessionState::ConfirmingSize;
            } else if self.is_complete() {
                self.complete(sink);
                return;
            }

            if !self.has_buffered_plaintext() {
                return;
            }
        }
    }

    fn peer_closed(&mut self, sink: &mut dyn SessionSink) {
        let sized_done = self.expected_size > 0 && self.received_size == self.expected_size;
        let unsized_done = self.expected_size == 0 && self.received_size > 0;
        if sized_done || unsized_done {
            self.complete(sink);
        } else {
            let detail = format!(
                "peer closed the connection after {} of {} bytes",
                self.received_size, self.expected_size
            );
            self.fail(
                sink,
                DccError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, detail)),
            );
        }
    }

    /// Senders of unknown-size files often reset the connection instead of
    /// closing it, leaving our last acks unread.
    fn io_failed(&mut self, sink: &mut dyn SessionSink, error: DccError) {
        let reset = matches!(
            &error,
            DccError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        );
        if reset && self.expected_size == 0 && self.received_size > 0 {
            debug!("session {}: peer reset after {} bytes", self.id, self.received_size);
            self.peer_closed(sink);
        } else {
            self.fail(sink, error);
        }
    }

    fn is_complete(&self) -> bool {
        self.expected_size > 0 && self.received_size == self.expected_size
    }

    fn queue_confirmation(&mut self) {
        if self.pending_ack.as_ref().is_some_and(|ack| ack.written > 0) {
            return;
        }
        self.pending_ack = Some(PendingAck::new(self.received_size));
    }

    fn send_confirmation(&mut self, sink: &mut dyn SessionSink) {
        // Queued TLS records (handshake or earlier acks) go first.
        let flushed = match self.transport_mut() {
            Some(transport) => transport.flush(),
            None => return,
        };
        match flushed {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.io_failed(sink, e);
                return;
            }
        }

        loop {
            let Some(mut ack) = self.pending_ack.take() else {
                self.state = SessionState::Connected;
                return;
            };
            while ack.written < ack.bytes.len() {
                let written = match self.transport_mut() {
                    Some(transport) => transport.write(&ack.bytes[ack.written..]),
                    None => return,
                };
                match written {
                    Ok(WriteOutcome::Written(n)) => ack.written += n,
                    Ok(WriteOutcome::WouldBlock) => {
                        self.pending_ack = Some(ack);
                        return;
                    }
                    Ok(WriteOutcome::WantRead) => {
                        self.pending_ack = Some(ack);
                        self.state = SessionState::Connected;
                        return;
                    }
                    Err(e) => {
                        self.io_failed(sink, e);
                        return;
                    }
                }
            }
            self.confirmed_offset = ack.offset;
            trace!("session {}: confirmed {} bytes", self.id, ack.offset);
            // More data landed while this ack was half written.
            if ack.offset < self.received_size {
                self.pending_ack = Some(PendingAck::new(self.received_size));
                continue;
            }
            break;
        }

        if self.is_complete() {
            if let Some(transport) = self.transport_mut() {
                let _ = transport.flush();
            }
            self.complete(sink);
        } else {
            self.state = SessionState::Connected;
        }
    }

    fn teardown(&mut self) {
        self.endpoint = None;
        self.pending_ack = None;
        self.state = SessionState::Removed;
    }

    fn complete(&mut self, sink: &mut dyn SessionSink) {
        if self.is_removed() {
            return;
        }
        self.teardown();
        let _ = sink.on_event(self.id, SessionEvent::Completed);
    }

    fn fail(&mut self, sink: &mut dyn SessionSink, error: DccError) {
        if self.is_removed() {
            return;
        }
        self.teardown();
        let _ = sink.on_event(self.id, SessionEvent::Failed(error));
    }
}

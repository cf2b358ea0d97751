//! Readiness multiplexer over every live session socket.
//!
//! Each poll builds one readiness future per registered session from the
//! interest its current state implies, waits for the first to fire (bounded
//! by the tick timeout) and then collects whatever else is already ready.
//! The futures only borrow the sockets and are cancel-safe, so dropping the
//! unfinished ones at the end of a poll loses nothing.

use crate::dcc::session::{DccSession, SessionId};
use crate::dcc::transport::Endpoint;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const READ_WRITE: Interest = Interest { read: true, write: true };

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }

    fn to_tokio(self) -> Option<tokio::io::Interest> {
        match (self.read, self.write) {
            (true, true) => Some(tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE),
            (true, false) => Some(tokio::io::Interest::READABLE),
            (false, true) => Some(tokio::io::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

#[derive(Debug)]
pub enum Readiness {
    Io { readable: bool, writable: bool },
    /// A passive peer connected to our listener.
    Incoming(TcpStream),
    Failed(io::Error),
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    registered: HashSet<SessionId>,
}

async fn stream_ready(stream: &TcpStream, interest: tokio::io::Interest) -> io::Result<Readiness> {
    loop {
        match stream.ready(interest).await {
            Ok(ready) => {
                return Ok(Readiness::Io {
                    readable: ready.is_readable() || ready.is_read_closed(),
                    writable: ready.is_writable() || ready.is_write_closed(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn incoming(listener: &TcpListener) -> io::Result<Readiness> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("accepted passive peer {}", peer);
                return Ok(Readiness::Incoming(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: SessionId) {
        self.registered.insert(id);
    }

    pub fn unregister(&mut self, id: SessionId) {
        self.registered.remove(&id);
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.registered.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// Wait up to `timeout` for readiness on any registered session and
    /// return everything ready, ordered by session id.
    pub async fn poll<'a, I>(&self, sessions: I, timeout: Duration) -> Vec<(SessionId, Readiness)>
    where
        I: IntoIterator<Item = &'a DccSession>,
    {
        let mut ready = Vec::new();
        let mut pending: FuturesUnordered<BoxFuture<'a, (SessionId, io::Result<Readiness>)>> =
            FuturesUnordered::new();

        for session in sessions {
            let id = session.id();
            if !self.is_registered(id) {
                continue;
            }
            let interest = session.interest();
            match session.endpoint() {
                Some(Endpoint::Stream(transport)) => {
                    if interest.read && transport.has_buffered_plaintext() {
                        ready.push((
                            id,
                            Readiness::Io {
                                readable: true,
                                writable: false,
                            },
                        ));
                        continue;
                    }
                    let Some(tokio_interest) = interest.to_tokio() else {
                        continue;
                    };
                    let stream = transport.stream();
                    pending.push(
                        async move { (id, stream_ready(stream, tokio_interest).await) }.boxed(),
                    );
                }
                Some(Endpoint::Listener(listener)) if interest.read => {
                    pending.push(async move { (id, incoming(listener).await) }.boxed());
                }
                _ => {}
            }
        }

        if ready.is_empty() {
            if pending.is_empty() {
                tokio::time::sleep(timeout).await;
                return ready;
            }
            match tokio::time::timeout(timeout, pending.next()).await {
                Ok(Some(item)) => ready.push(flatten(item)),
                Ok(None) | Err(_) => return ready,
            }
        }
        while let Some(Some(item)) = pending.next().now_or_never() {
            ready.push(flatten(item));
        }
        ready.sort_by_key(|(id, _)| *id);
        ready
    }
}

fn flatten((id, result): (SessionId, io::Result<Readiness>)) -> (SessionId, Readiness) {
    match result {
        Ok(readiness) => (id, readiness),
        Err(e) => (id, Readiness::Failed(e)),
    }
}

//! Byte transports for DCC sessions.
//!
//! Plain transfers read and write the socket directly. SSEND transfers run a
//! `rustls::ClientConnection` on top of the same non-blocking socket, so TLS
//! can hold decrypted plaintext that the socket no longer signals as readable.

use crate::dcc::error::{DccError, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Socket owned by a session: a listener while waiting for a passive peer,
/// a stream once data can flow.
#[derive(Debug)]
pub enum Endpoint {
    Listener(TcpListener),
    Stream(Transport),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    /// TLS needs to send before it can make progress.
    WantWrite,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
    /// TLS handshake still needs input from the peer.
    WantRead,
}

#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsTransport>),
}

#[derive(Debug)]
pub struct TlsTransport {
    stream: TcpStream,
    conn: ClientConnection,
    buffered: usize,
}

/// `std::io` view of a tokio socket that never blocks.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport {
    /// Start a TLS client session on an already connected socket.
    pub fn tls(stream: TcpStream, config: Arc<ClientConfig>, peer: Ipv4Addr) -> Result<Self> {
        let server_name = ServerName::from(std::net::IpAddr::V4(peer));
        let conn = ClientConnection::new(config, server_name)?;
        Ok(Transport::Tls(Box::new(TlsTransport {
            stream,
            conn,
            buffered: 0,
        })))
    }

    pub fn stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &tls.stream,
        }
    }

    /// Decrypted bytes ready without touching the socket.
    pub fn has_buffered_plaintext(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.buffered > 0,
        }
    }

    /// TLS records are queued for the peer.
    pub fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.conn.wants_write(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        match self {
            Transport::Plain(stream) => match stream.try_read(buf) {
                Ok(0) => Ok(ReadOutcome::Closed),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                Err(e) => Err(e.into()),
            },
            Transport::Tls(tls) => tls.read(buf),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<WriteOutcome> {
        match self {
            Transport::Plain(stream) => match stream.try_write(data) {
                Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => Ok(WriteOutcome::Written(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
                Err(e) => Err(e.into()),
            },
            Transport::Tls(tls) => tls.write(data),
        }
    }

    /// Push queued TLS records out. Returns `true` once nothing is left.
    pub fn flush(&mut self) -> Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::Tls(tls) => tls.flush(),
        }
    }
}

impl TlsTransport {
    fn refresh_buffered(&mut self) -> Result<()> {
        let state = self.conn.process_new_packets()?;
        self.buffered = state.plaintext_bytes_to_read();
        Ok(())
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<Option<ReadOutcome>> {
        match self.conn.reader().read(buf) {
            Ok(0) => Ok(Some(ReadOutcome::Closed)),
            Ok(n) => {
                self.refresh_buffered()?;
                Ok(Some(ReadOutcome::Data(n)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Peer dropped TCP without close_notify; bots do this routinely.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Some(ReadOutcome::Closed)),
            Err(e) => Err(e.into()),
        }
    }

    fn stalled(&self) -> ReadOutcome {
        if self.conn.wants_write() {
            ReadOutcome::WantWrite
        } else {
            ReadOutcome::WouldBlock
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if let Some(outcome) = self.read_plaintext(buf)? {
            return Ok(outcome);
        }
        match self.conn.read_tls(&mut SocketIo(&self.stream)) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(self.stalled()),
            Err(e) => return Err(e.into()),
        }
        self.refresh_buffered()?;
        match self.read_plaintext(buf)? {
            Some(outcome) => Ok(outcome),
            None => Ok(self.stalled()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<WriteOutcome> {
        if self.conn.is_handshaking() {
            self.flush()?;
            if self.conn.is_handshaking() {
                return Ok(WriteOutcome::WantRead);
            }
        }
        let n = self.conn.writer().write(data)?;
        self.flush()?;
        Ok(WriteOutcome::Written(n))
    }

    fn flush(&mut self) -> Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SocketIo(&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Client config for SSEND peers. Bots almost always present self-signed
/// certificates, so `accept_all_certs` skips verification entirely.
pub fn tls_client_config(accept_all_certs: bool) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(DccError::from)?;
    let config = if accept_all_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Self-signed server side for loopback SSEND tests. `max_fragment` forces
/// the sender to split its writes into several records.
#[cfg(test)]
pub(crate) fn test_server_config(max_fragment: Option<usize>) -> Arc<rustls::ServerConfig> {
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    config.max_fragment_size = max_fragment;
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    #[test]
    fn test_tls_configs_build() {
        assert!(tls_client_config(true).is_ok());
        assert!(tls_client_config(false).is_ok());
    }

    async fn plain_pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Transport::Plain(client), server)
    }

    #[tokio::test]
    async fn test_plain_read_write() {
        let (mut transport, mut server) = plain_pair().await;
        assert!(!transport.has_buffered_plaintext());
        let mut buf = [0u8; 16];
        assert_eq!(transport.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);

        server.write_all(b"hello").await.unwrap();
        transport.stream().readable().await.unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), ReadOutcome::Data(5));
        assert_eq!(&buf[..5], b"hello");

        transport.stream().writable().await.unwrap();
        assert_eq!(
            transport.write(&[0, 0, 0, 5]).unwrap(),
            WriteOutcome::Written(4)
        );
        let mut ack = [0u8; 4];
        server.read_exact(&mut ack).await.unwrap();
        assert_eq!(u32::from_be_bytes(ack), 5);

        drop(server);
        transport.stream().readable().await.unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn test_plain_reset_is_io_error() {
        let (mut transport, server) = plain_pair().await;
        socket2::SockRef::from(&server)
            .set_linger(Some(std::time::Duration::ZERO))
            .unwrap();
        drop(server);

        let mut buf = [0u8; 16];
        transport.stream().readable().await.unwrap();
        match transport.read(&mut buf) {
            Err(DccError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected a reset, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tls_drains_buffered_plaintext() {
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(test_server_config(Some(128)));
        let sent = payload.clone();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(sock).await.unwrap();
            tls.write_all(&sent).await.unwrap();
            tls.flush().await.unwrap();
            let mut ack = [0u8; 4];
            tls.read_exact(&mut ack).await.unwrap();
            u32::from_be_bytes(ack)
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let config = tls_client_config(true).unwrap();
        let mut transport = Transport::tls(stream, config, Ipv4Addr::LOCALHOST).unwrap();
        assert!(transport.wants_write());

        let mut received = Vec::new();
        let mut buf = [0u8; 8];
        let mut saw_buffered = false;
        while received.len() < payload.len() {
            if !transport.flush().unwrap() {
                transport.stream().writable().await.unwrap();
                continue;
            }
            match transport.read(&mut buf).unwrap() {
                ReadOutcome::Data(n) => {
                    received.extend_from_slice(&buf[..n]);
                    saw_buffered |= transport.has_buffered_plaintext();
                }
                ReadOutcome::WouldBlock => transport.stream().readable().await.unwrap(),
                ReadOutcome::WantWrite => transport.stream().writable().await.unwrap(),
                ReadOutcome::Closed => panic!("closed after {} bytes", received.len()),
            }
        }
        assert_eq!(received, payload);
        assert!(saw_buffered);
        assert!(!transport.has_buffered_plaintext());

        let ack = (payload.len() as u32).to_be_bytes();
        assert_eq!(transport.write(&ack).unwrap(), WriteOutcome::Written(4));
        while !transport.flush().unwrap() {
            transport.stream().writable().await.unwrap();
        }
        assert_eq!(server.await.unwrap(), 600);
    }
}

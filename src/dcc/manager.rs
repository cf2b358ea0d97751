//! DCC download orchestrator.
//!
//! Owns every [`DccSession`] of the run together with its download file,
//! turns incoming CTCP requests into sessions, drives the multiplexer once
//! per [`DccManager::tick`] and keeps score of how the run is going.
//! Outgoing CTCP strings are queued as [`Action`]s for the IRC side.

use crate::app::action::Action;
use crate::config::DccSettings;
use crate::dcc::checksum::{self, ChecksumJob};
use crate::dcc::error::{DccError, Result};
use crate::dcc::mux::Multiplexer;
use crate::dcc::parser::{self, DccOffer, DccRequest, ResumePosition};
use crate::dcc::progress::DownloadProgress;
use crate::dcc::security;
use crate::dcc::session::{DccSession, SessionEvent, SessionId, SessionSink, SessionState};
use crate::dcc::throttle::ThrottleState;
use crate::dcc::transport;
use rustls::ClientConfig;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a finished run with checksum verification enabled waits for the
/// bot to announce a checksum.
const CHECKSUM_GRACE: Duration = Duration::from_secs(30);

/// What to do with the local file before any socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalFile {
    Fresh,
    Resume(u64),
    AlreadyComplete,
}

fn inspect_local_file(path: &Path, expected_size: u64) -> Result<LocalFile> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LocalFile::Fresh),
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        return Ok(LocalFile::Fresh);
    }
    if expected_size == 0 || len < expected_size {
        return Ok(LocalFile::Resume(len));
    }
    if len == expected_size {
        return Ok(LocalFile::AlreadyComplete);
    }
    Err(DccError::LocalFileConflict {
        path: path.to_path_buf(),
        local: len,
        offered: expected_size,
    })
}

/// Progress plus the open output file of one session.
#[derive(Debug)]
pub struct DownloadContext {
    pub progress: DownloadProgress,
    file: Option<BufWriter<File>>,
}

impl DownloadContext {
    fn open(path: PathBuf, expected_size: u64, plan: LocalFile) -> io::Result<Self> {
        let file = match plan {
            LocalFile::Fresh => Some(File::create(&path)?),
            LocalFile::Resume(_) => Some(OpenOptions::new().write(true).open(&path)?),
            LocalFile::AlreadyComplete => None,
        };
        Ok(Self {
            progress: DownloadProgress::new(path, expected_size),
            file: file.map(BufWriter::new),
        })
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("download file already closed"))?;
        file.write_all(chunk)?;
        self.progress.record_chunk(chunk.len());
        Ok(())
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
        }
        self.progress.resume_at(offset);
        Ok(())
    }

    /// Flush and close the file. Later calls are no-ops.
    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.progress.path()
    }
}

/// Sink handed to sessions: writes data to the right file and records how
/// each session ended.
struct TransferSink<'a> {
    contexts: &'a mut HashMap<SessionId, DownloadContext>,
    finished: &'a mut Vec<(SessionId, bool)>,
}

impl SessionSink for TransferSink<'_> {
    fn on_event(&mut self, id: SessionId, event: SessionEvent<'_>) -> Result<()> {
        let context = self.contexts.get_mut(&id);
        match event {
            SessionEvent::Connected => {
                if let Some(ctx) = context {
                    info!("Transfer {} connected, receiving {}", id, ctx.path().display());
                }
            }
            SessionEvent::DataReceived(chunk) => {
                let ctx = context.ok_or_else(|| io::Error::other("no download file"))?;
                ctx.write_chunk(chunk)?;
            }
            SessionEvent::ResumeAck(offset) => {
                if let Some(ctx) = context {
                    info!("Resuming {} at byte {}", ctx.path().display(), offset);
                    ctx.seek_to(offset)?;
                }
            }
            SessionEvent::Completed => {
                let mut ok = true;
                if let Some(ctx) = context {
                    match ctx.close() {
                        Ok(()) => info!("Download completed: {}", ctx.path().display()),
                        Err(e) => {
                            error!("Could not finish writing {}: {}", ctx.path().display(), e);
                            ok = false;
                        }
                    }
                }
                self.finished.push((id, ok));
            }
            SessionEvent::Failed(e) => {
                match context {
                    Some(ctx) => {
                        let _ = ctx.close();
                        error!("Download of {} failed: {}", ctx.path().display(), e);
                    }
                    None => error!("Transfer {} failed: {}", id, e),
                }
                self.finished.push((id, false));
            }
        }
        Ok(())
    }
}

pub struct DccManager {
    settings: DccSettings,
    sessions: BTreeMap<SessionId, DccSession>,
    contexts: HashMap<SessionId, DownloadContext>,
    mux: Multiplexer,
    throttle: ThrottleState,
    tls_config: Option<Arc<ClientConfig>>,
    next_session_id: SessionId,
    expected_downloads: usize,
    succeeded: usize,
    failed: usize,
    finished: Vec<(SessionId, bool)>,
    finished_at: Option<Instant>,
    actions: Vec<Action>,
    last_completed: Option<PathBuf>,
    pending_md5: Option<String>,
    verified: Vec<(PathBuf, String)>,
    checksum_jobs: Vec<JoinHandle<bool>>,
    last_report: Instant,
    paused_until: Option<Instant>,
}

impl DccManager {
    pub fn new(settings: DccSettings, expected_downloads: usize) -> Self {
        let throttle = ThrottleState::new(settings.max_speed);
        Self {
            settings,
            sessions: BTreeMap::new(),
            contexts: HashMap::new(),
            mux: Multiplexer::new(),
            throttle,
            tls_config: None,
            next_session_id: 1,
            expected_downloads,
            succeeded: 0,
            failed: 0,
            finished: Vec::new(),
            finished_at: None,
            actions: Vec::new(),
            last_completed: None,
            pending_md5: None,
            verified: Vec::new(),
            checksum_jobs: Vec::new(),
            last_report: Instant::now(),
            paused_until: None,
        }
    }

    fn allocate_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&DccSession> {
        self.sessions.get(&id)
    }

    pub fn context(&self, id: SessionId) -> Option<&DownloadContext> {
        self.contexts.get(&id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_removed()).count()
    }

    /// Outgoing IRC traffic produced since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Route a CTCP `DCC ...` body from `nick`. Untrusted senders are ignored.
    pub fn handle_ctcp(&mut self, nick: &str, ctcp: &str, trusted: bool) -> Result<Option<SessionId>> {
        if !trusted {
            warn!("Ignoring DCC request from untrusted nick {}: {}", nick, ctcp);
            return Ok(None);
        }
        match parser::parse(ctcp)? {
            DccRequest::Send(offer) if offer.is_passive() => {
                self.submit_passive_request(nick, offer).map(Some)
            }
            DccRequest::Send(offer) => self.submit_active_request(nick, offer).map(Some),
            DccRequest::Accept(ack) => self.accept_resume(&ack).map(Some),
            DccRequest::Resume(_) => {
                warn!("{} asked to resume a transfer, but this client never sends files", nick);
                Ok(None)
            }
        }
    }

    /// Accept an offer where the sender listens and we connect.
    pub fn submit_active_request(&mut self, nick: &str, offer: DccOffer) -> Result<SessionId> {
        if offer.is_passive() {
            return Err(DccError::Protocol(format!(
                "passive offer for {} submitted as active",
                offer.filename
            )));
        }
        self.start_transfer(nick, offer)
    }

    /// Accept a reverse offer where we listen and the sender connects.
    pub fn submit_passive_request(&mut self, nick: &str, offer: DccOffer) -> Result<SessionId> {
        let Some(token) = offer.token.filter(|_| offer.is_passive()) else {
            return Err(DccError::Protocol(format!(
                "offer for {} is not a passive offer",
                offer.filename
            )));
        };
        if offer.secure {
            return Err(DccError::Protocol(format!(
                "reverse TLS offer for {} is not supported",
                offer.filename
            )));
        }
        let in_use = self
            .sessions
            .values()
            .any(|s| !s.is_removed() && s.passive_token() == Some(token));
        if in_use {
            return Err(DccError::DuplicateToken(token));
        }
        self.start_transfer(nick, offer)
    }

    fn start_transfer(&mut self, nick: &str, offer: DccOffer) -> Result<SessionId> {
        let path = security::download_path(&self.settings.download_dir, &offer.filename)?;
        security::ensure_download_dir(&self.settings.download_dir)?;

        let id = self.allocate_session_id();
        info!(
            "{} offers {} ({} bytes, {}{})",
            nick,
            offer.filename,
            offer.size,
            if offer.is_passive() { "passive" } else { "active" },
            if offer.secure { ", TLS" } else { "" },
        );
        self.sessions.insert(
            id,
            DccSession::new(id, nick, &offer, self.settings.confirm_offsets),
        );
        self.mux.register(id);

        let opened = inspect_local_file(&path, offer.size).and_then(|plan| {
            let context = DownloadContext::open(path, offer.size, plan)?;
            Ok((plan, context))
        });
        let plan = match opened {
            Ok((plan, context)) => {
                self.contexts.insert(id, context);
                plan
            }
            Err(e) => {
                self.with_session(id, |session, sink| session.fail_with(e, sink));
                self.settle();
                return Ok(id);
            }
        };

        match plan {
            LocalFile::Fresh => self.proceed(id),
            LocalFile::Resume(position) => {
                info!("Found partial {} ({} bytes), requesting resume", offer.filename, position);
                let request = self
                    .sessions
                    .get_mut(&id)
                    .and_then(|session| session.request_resume(position));
                if let Some(request) = request {
                    self.send_ctcp(nick, request);
                }
            }
            LocalFile::AlreadyComplete => {
                info!("{} is already complete, nothing to download", offer.filename);
                self.with_session(id, |session, sink| session.complete_without_transfer(sink));
            }
        }
        self.settle();
        Ok(id)
    }

    /// Match a `DCC ACCEPT` to the session waiting for it and carry on.
    pub fn accept_resume(&mut self, ack: &ResumePosition) -> Result<SessionId> {
        let id = self
            .sessions
            .values()
            .find(|s| s.state() == SessionState::WaitingForResumeAck && s.resume_key() == ack.key)
            .map(DccSession::id)
            .ok_or_else(|| DccError::ResumeMismatch(ack.key.to_string()))?;

        self.with_session(id, |session, sink| {
            session.resume_acknowledged(ack.position, sink)
        })
        .transpose()?;
        if self.sessions.get(&id).map(DccSession::state) == Some(SessionState::Init) {
            self.proceed(id);
        }
        self.settle();
        Ok(id)
    }

    /// Connect (active) or listen and advertise (passive).
    fn proceed(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else { return };
        let nick = session.nick().to_string();
        let (passive, secure) = (session.is_passive(), session.is_secure());

        if passive {
            let (ip, port) = (self.settings.listen_ip, self.settings.listen_port);
            let advert = self
                .with_session(id, |session, sink| session.listen(ip, port, sink))
                .flatten();
            if let Some(advert) = advert {
                self.send_ctcp(&nick, advert);
            }
            return;
        }

        let tls_config = if secure {
            match self.tls_config() {
                Ok(config) => Some(config),
                Err(e) => {
                    self.with_session(id, |session, sink| session.fail_with(e, sink));
                    return;
                }
            }
        } else {
            None
        };
        self.with_session(id, |session, sink| session.connect(tls_config, sink));
    }

    fn tls_config(&mut self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = &self.tls_config {
            return Ok(config.clone());
        }
        let config = transport::tls_client_config(self.settings.accept_all_certs)?;
        self.tls_config = Some(config.clone());
        Ok(config)
    }

    fn send_ctcp(&mut self, nick: &str, request: DccRequest) {
        debug!("-> {}: {}", nick, request);
        self.actions.push(Action::SendCtcp {
            target: nick.to_string(),
            command: request.to_string(),
        });
    }

    fn with_session<R>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut DccSession, &mut TransferSink<'_>) -> R,
    ) -> Option<R> {
        let session = self.sessions.get_mut(&id)?;
        let mut sink = TransferSink {
            contexts: &mut self.contexts,
            finished: &mut self.finished,
        };
        Some(f(session, &mut sink))
    }

    /// Book-keep sessions that ended since the last call.
    fn settle(&mut self) {
        for (id, ok) in std::mem::take(&mut self.finished) {
            self.mux.unregister(id);
            if !ok {
                self.failed += 1;
                continue;
            }
            self.succeeded += 1;
            let Some(path) = self.contexts.get(&id).map(|c| c.path().to_path_buf()) else {
                continue;
            };
            if let Some(md5) = self.pending_md5.take() {
                self.verify(path.clone(), md5);
            }
            self.last_completed = Some(path);
        }
        if self.finished_at.is_none() && self.is_run_finished() {
            self.finished_at = Some(Instant::now());
        }
    }

    /// A single-download run checks any advertised checksum. Runs with
    /// several downloads only do so when asked.
    fn verifies_checksums(&self) -> bool {
        self.expected_downloads == 1 || self.settings.verify_checksums
    }

    fn verify(&mut self, path: PathBuf, md5: String) {
        let key = (path, md5);
        if self.verified.contains(&key) {
            debug!("md5 {} already checked for {}", key.1, key.0.display());
            return;
        }
        self.checksum_jobs
            .push(ChecksumJob::new(key.0.clone(), key.1.clone()).spawn());
        self.verified.push(key);
    }

    /// Look for a checksum in a NOTICE from a bot.
    pub fn handle_notice(&mut self, text: &str) {
        let Some(md5) = checksum::extract_md5(text) else {
            return;
        };
        debug!("Found md5 checksum {}", md5);
        match self.last_completed.clone() {
            Some(path) if self.verifies_checksums() => self.verify(path, md5),
            Some(_) => {}
            None if self.expected_downloads == 1 => {
                info!("Remembering md5 checksum {} for the download", md5);
                self.pending_md5 = Some(md5);
            }
            None => {}
        }
    }

    fn purge_removed(&mut self) {
        let removed: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_removed())
            .map(DccSession::id)
            .collect();
        for id in removed {
            self.sessions.remove(&id);
            self.mux.unregister(id);
            if let Some(mut ctx) = self.contexts.remove(&id) {
                let _ = ctx.close();
            }
        }
    }

    /// One turn of the transfer loop: finish any throttle pause, wait for
    /// socket readiness (at most one tick interval), advance the ready
    /// sessions and report progress when the interval has elapsed.
    ///
    /// Cancel-safe. The throttle pause is kept as a deadline, so a tick
    /// dropped mid-pause makes the next one wait out the rest.
    pub async fn tick(&mut self) {
        if let Some(until) = self.paused_until {
            tokio::time::sleep_until(tokio::time::Instant::from_std(until)).await;
            self.paused_until = None;
        }
        self.purge_removed();
        let ready = self
            .mux
            .poll(self.sessions.values(), self.settings.tick_interval)
            .await;
        for (id, readiness) in ready {
            self.with_session(id, move |session, sink| session.on_ready(readiness, sink));
        }
        self.settle();

        if self.last_report.elapsed() >= self.settings.tick_interval {
            self.last_report = Instant::now();
            let speed = self.sample_progress();
            self.throttle.adjust(speed);
        }

        let pause = self.throttle.sleep();
        if !pause.is_zero() {
            self.paused_until = Some(Instant::now() + pause);
        }
    }

    /// Sample every transferring session and log its progress. Returns the
    /// summed average speed.
    fn sample_progress(&mut self) -> u64 {
        let mut total = 0;
        for (id, session) in &self.sessions {
            let transferring = matches!(
                session.state(),
                SessionState::Connected | SessionState::ConfirmingSize
            );
            if !transferring {
                continue;
            }
            if let Some(ctx) = self.contexts.get_mut(id) {
                total += ctx.progress.sample();
                info!(target: "dccfetch::progress", "{}", ctx.progress.status_line());
            }
        }
        total
    }

    /// Remove every session, closing sockets and files. Idempotent.
    pub fn cancel_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.with_session(id, |session, sink| session.cancel(sink));
        }
        self.settle();
        self.purge_removed();
    }

    /// Every requested download ended successfully.
    pub fn is_run_complete(&self) -> bool {
        self.expected_downloads > 0 && self.succeeded >= self.expected_downloads
    }

    /// Every requested download ended, one way or the other.
    pub fn is_run_finished(&self) -> bool {
        self.expected_downloads > 0 && self.succeeded + self.failed >= self.expected_downloads
    }

    pub fn checksums_pending(&self) -> bool {
        self.checksum_jobs.iter().any(|job| !job.is_finished())
    }

    /// Finished and nothing left to wait for, including checksum checks.
    pub fn is_settled(&self) -> bool {
        if !self.is_run_finished() || self.checksums_pending() {
            return false;
        }
        if !self.checksum_jobs.is_empty() || !self.settings.verify_checksums {
            return true;
        }
        // Only an explicit request to verify waits for a late checksum.
        self.finished_at
            .is_some_and(|at| at.elapsed() >= CHECKSUM_GRACE)
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const FOX: &str = "The quick brown fox jumps over the lazy dog";

    fn settings(dir: &Path) -> DccSettings {
        DccSettings {
            download_dir: dir.to_path_buf(),
            listen_ip: Ipv4Addr::LOCALHOST,
            listen_port: 0,
            max_speed: 0,
            confirm_offsets: true,
            accept_all_certs: true,
            verify_checksums: false,
            tick_interval: Duration::from_millis(20),
        }
    }

    fn ctcp(request: &Action) -> &str {
        match request {
            Action::SendCtcp { command, .. } => command,
            other => panic!("expected CTCP, got {:?}", other),
        }
    }

    async fn run_until_finished(manager: &mut DccManager) {
        for _ in 0..500 {
            if manager.is_run_finished() {
                return;
            }
            manager.tick().await;
        }
        panic!("run did not finish");
    }

    async fn bot_serving(data: &'static [u8], skip: usize) -> (u16, JoinHandle<u32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&data[skip..]).await.unwrap();
            let mut last = 0;
            let mut ack = [0u8; 4];
            while sock.read_exact(&mut ack).await.is_ok() {
                last = u32::from_be_bytes(ack);
                if last as usize == data.len() {
                    break;
                }
            }
            last
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_active_download_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (port, bot) = bot_serving(b"0123456789", 0).await;
        let mut manager = DccManager::new(settings(dir.path()), 1);

        let offer = format!("DCC SEND pack.bin 2130706433 {} 10", port);
        let id = manager.handle_ctcp("Bot", &offer, true).unwrap().unwrap();
        assert_eq!(id, 1);
        run_until_finished(&mut manager).await;

        assert!(manager.is_run_complete());
        assert_eq!(bot.await.unwrap(), 10);
        assert_eq!(std::fs::read(dir.path().join("pack.bin")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_untrusted_and_malformed_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        let ignored = manager.handle_ctcp("Stranger", "DCC SEND a 1 2 3", false).unwrap();
        assert!(ignored.is_none());
        assert!(matches!(
            manager.handle_ctcp("Bot", "DCC SEND", true),
            Err(DccError::Protocol(_))
        ));
        assert_eq!(manager.active_sessions(), 0);
        assert!(manager.take_actions().is_empty());
    }

    #[tokio::test]
    async fn test_illegal_filename_is_fatal_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);
        let err = manager
            .handle_ctcp("Bot", "DCC SEND ../evil 2130706433 1 10", true)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_resume_writes_from_local_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pack.bin"), b"0123").unwrap();
        let (port, bot) = bot_serving(b"0123456789", 4).await;
        let mut manager = DccManager::new(settings(dir.path()), 1);

        let offer = format!("DCC SEND pack.bin 2130706433 {} 10", port);
        let id = manager.handle_ctcp("Bot", &offer, true).unwrap().unwrap();
        let actions = manager.take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(ctcp(&actions[0]), format!("DCC RESUME file.ext {} 4", port));
        assert_eq!(
            manager.session(id).unwrap().state(),
            SessionState::WaitingForResumeAck
        );

        let accept = format!("DCC ACCEPT file.ext {} 4", port);
        assert_eq!(manager.handle_ctcp("Bot", &accept, true).unwrap(), Some(id));
        assert_eq!(manager.context(id).unwrap().progress.received_size, 4);
        run_until_finished(&mut manager).await;

        assert!(manager.is_run_complete());
        assert_eq!(bot.await.unwrap(), 10);
        assert_eq!(std::fs::read(dir.path().join("pack.bin")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_unmatched_accept_is_resume_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);
        assert!(matches!(
            manager.handle_ctcp("Bot", "DCC ACCEPT file.ext 0 10 5", true),
            Err(DccError::ResumeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_passive_offer_advertises_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        let id = manager
            .handle_ctcp("Bot", "DCC SEND \"my file.txt\" 16909060 0 5 77", true)
            .unwrap()
            .unwrap();
        let actions = manager.take_actions();
        assert_eq!(actions.len(), 1);
        let reply = match parser::parse(ctcp(&actions[0])).unwrap() {
            DccRequest::Send(reply) => reply,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.filename, "my file.txt");
        assert_eq!(reply.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(reply.size, 5);
        assert_eq!(reply.token, Some(77));
        assert_eq!(manager.session(id).unwrap().state(), SessionState::InitPassive);

        assert!(matches!(
            manager.handle_ctcp("Bot", "DCC SEND other 16909060 0 5 77", true),
            Err(DccError::DuplicateToken(77))
        ));

        let port = reply.port;
        let peer = tokio::spawn(async move {
            let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            let mut ack = [0u8; 4];
            sock.read_exact(&mut ack).await.unwrap();
            u32::from_be_bytes(ack)
        });
        run_until_finished(&mut manager).await;

        assert!(manager.is_run_complete());
        assert_eq!(peer.await.unwrap(), 5);
        assert_eq!(std::fs::read(dir.path().join("my file.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_reverse_tls_offer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        assert!(matches!(
            manager.handle_ctcp("Bot", "DCC SSEND secret.bin 16909060 0 5 7", true),
            Err(DccError::Protocol(_))
        ));
        let offer = DccOffer {
            filename: "secret.bin".into(),
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 0,
            size: 5,
            token: Some(7),
            secure: true,
        };
        assert!(matches!(
            manager.submit_passive_request("Bot", offer),
            Err(DccError::Protocol(_))
        ));
        assert_eq!(manager.active_sessions(), 0);
        assert!(manager.take_actions().is_empty());
        assert!(!dir.path().join("secret.bin").exists());
    }

    #[tokio::test]
    async fn test_dropped_tick_keeps_throttle_pause() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);
        let pause = Duration::from_millis(150);
        manager.paused_until = Some(Instant::now() + pause);
        let started = Instant::now();

        // Interrupted the way an IRC event interrupts the driver loop.
        let interrupted = tokio::time::timeout(Duration::from_millis(20), manager.tick()).await;
        assert!(interrupted.is_err());
        assert!(manager.paused_until.is_some());

        manager.tick().await;
        assert!(started.elapsed() >= pause);
        assert!(manager.paused_until.is_none());
    }

    #[tokio::test]
    async fn test_local_file_already_complete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.bin"), b"12345").unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        manager
            .handle_ctcp("Bot", "DCC SEND done.bin 2130706433 9 5", true)
            .unwrap();
        assert!(manager.is_run_complete());
        assert!(manager.take_actions().is_empty());
    }

    #[tokio::test]
    async fn test_local_file_larger_than_offer_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), b"123456789").unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        manager
            .handle_ctcp("Bot", "DCC SEND big.bin 2130706433 9 5", true)
            .unwrap();
        assert!(manager.is_run_finished());
        assert!(!manager.is_run_complete());
        assert_eq!(manager.failed(), 1);
        assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), b"123456789");
    }

    #[tokio::test]
    async fn test_cancel_all_removes_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 2);
        manager
            .handle_ctcp("Bot", "DCC SEND a.bin 16909060 0 5 1", true)
            .unwrap();
        manager
            .handle_ctcp("Bot", "DCC SEND b.bin 16909060 0 5 2", true)
            .unwrap();
        assert_eq!(manager.active_sessions(), 2);

        manager.cancel_all();
        manager.cancel_all();
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.failed(), 2);
        assert!(manager.is_run_finished());
    }

    async fn wait_for_checksums(manager: &DccManager) {
        for _ in 0..200 {
            if !manager.checksums_pending() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.checksums_pending());
    }

    #[tokio::test]
    async fn test_single_download_checks_md5_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fox.txt"), FOX).unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        manager.handle_notice("** md5sum: 9e107d9d372bb6826bd81d3542a419d6");
        manager
            .handle_ctcp("Bot", "DCC SEND fox.txt 2130706433 9 43", true)
            .unwrap();
        assert_eq!(manager.checksum_jobs.len(), 1);

        // The bot repeating the same checksum does not start a second check.
        manager.handle_notice("** md5sum: 9e107d9d372bb6826bd81d3542a419d6");
        assert_eq!(manager.checksum_jobs.len(), 1);

        wait_for_checksums(&manager).await;
        assert!(manager.is_settled());
    }

    #[tokio::test]
    async fn test_late_checksum_checked_for_single_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fox.txt"), FOX).unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 1);

        manager
            .handle_ctcp("Bot", "DCC SEND fox.txt 2130706433 9 43", true)
            .unwrap();
        assert!(manager.checksum_jobs.is_empty());
        assert!(manager.is_settled());

        manager.handle_notice("md5: 9e107d9d372bb6826bd81d3542a419d6");
        assert_eq!(manager.checksum_jobs.len(), 1);
        wait_for_checksums(&manager).await;
    }

    #[tokio::test]
    async fn test_multi_download_checksum_needs_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fox.txt"), FOX).unwrap();
        let mut manager = DccManager::new(settings(dir.path()), 2);

        manager
            .handle_ctcp("Bot", "DCC SEND fox.txt 2130706433 9 43", true)
            .unwrap();
        manager.handle_notice("md5: 9e107d9d372bb6826bd81d3542a419d6");
        assert!(manager.checksum_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_remembered_for_single_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fox.txt"), FOX).unwrap();
        let mut s = settings(dir.path());
        s.verify_checksums = true;
        let mut manager = DccManager::new(s, 1);

        manager.handle_notice("** md5sum: 9e107d9d372bb6826bd81d3542a419d6");
        assert!(manager.pending_md5.is_some());
        manager
            .handle_ctcp("Bot", "DCC SEND fox.txt 2130706433 9 43", true)
            .unwrap();
        assert!(manager.pending_md5.is_none());
        assert_eq!(manager.checksum_jobs.len(), 1);

        wait_for_checksums(&manager).await;
        assert!(manager.is_settled());
    }
}

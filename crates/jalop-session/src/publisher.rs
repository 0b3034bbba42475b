//! Publisher transfer engine.
//!
//! Two tasks per session: a dispatcher that answers `subscribe`,
//! `journal-resume`, `digest` and `sync`, and a sender that streams records
//! from the application while digesting exactly the segment bytes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use jalop_core::{
    CoreError, DigestPair, DigestValue, Digester, Mode, Nonce, RecordInfo, RecordType, Role,
    SourceRecord, CHUNK_SIZE,
};
use jalop_wire::{
    journal_missing, DigestMessage, DigestResponse, FrameKind, Headers, JournalResume, Message,
    MessageType, RecordHeader, Subscribe, SyncMessage, WireMessage, BREAK,
};

use crate::digests::DigestTable;
use crate::error::{Result, SessionError};
use crate::session::Session;
use crate::transport::BodyWriter;

/// Publisher engine tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How long a live publisher waits before asking an empty source again.
    pub live_poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            live_poll_interval: Duration::from_millis(250),
        }
    }
}

impl PublisherConfig {
    pub fn new(live_poll_interval: Duration) -> Result<Self> {
        let config = Self { live_poll_interval };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.live_poll_interval.is_zero() {
            return Err(SessionError::InvalidArgument("live poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// Application callbacks for the publishing side of a session.
///
/// Callbacks run on the session's task; `false` returns stop sending.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// The peer asked for records. `nonce` names the last record it holds.
    async fn on_subscribe(&self, session: &Session, nonce: Option<&Nonce>, headers: &Headers) -> bool;

    /// The peer asked to continue journal record `nonce` from `offset`.
    ///
    /// Return the complete record (its payload stream starting at byte 0),
    /// or `None` if it is no longer available.
    async fn on_journal_resume(
        &self,
        session: &Session,
        nonce: &Nonce,
        offset: u64,
        headers: &Headers,
    ) -> Option<SourceRecord>;

    /// Next record to send. `Ok(None)` when nothing is available right now.
    async fn next_record(&self, session: &Session) -> std::io::Result<Option<SourceRecord>>;

    /// A record was sent and its digest computed.
    async fn notify_digest(&self, session: &Session, info: &RecordInfo, digest: &DigestValue) -> bool;

    /// The peer reported its digest for a record.
    async fn notify_peer_digest(&self, session: &Session, pair: &DigestPair, headers: &Headers);

    /// The peer stored a confirmed record.
    async fn on_sync(&self, _session: &Session, _nonce: &Nonce, _headers: &Headers) {}
}

/// A record the sender should start with instead of asking the source.
struct Resume {
    record: SourceRecord,
    offset: u64,
}

/// Outcome classes of one record transfer.
enum SendError {
    /// The record failed; the session carries on.
    Record(String),
    /// The session cannot continue.
    Fatal(SessionError),
}

/// Run the publishing side of `session` until it closes.
pub async fn run_publisher(
    session: Arc<Session>,
    publisher: Arc<dyn Publisher>,
    config: PublisherConfig,
) -> Result<()> {
    config.validate()?;
    if session.local_role() != Role::Publisher {
        return Err(SessionError::InvalidArgument(format!(
            "session {:016x} is not publishing",
            session.id()
        )));
    }
    let table = Arc::new(DigestTable::new());
    let mut sender: Option<JoinHandle<()>> = None;

    let result = loop {
        let message = tokio::select! {
            m = session.channel().recv() => m,
            _ = session.closed() => break Ok(()),
        };
        let message = match message {
            Ok(m) => m,
            Err(SessionError::Closed) => {
                session.mark_closed();
                break Ok(());
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                session.set_errored().await;
                break Err(e);
            }
        };

        match dispatch(&session, &publisher, &config, &table, &mut sender, message).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => {
                warn!(error = %e, "publisher dispatch failed");
                session.set_errored().await;
                break Err(e);
            }
        }
    };

    if let Some(handle) = sender {
        if !session.is_ok() {
            handle.abort();
        }
        let _ = handle.await;
    }
    result
}

/// Handle one inbound frame. `Ok(false)` ends the dispatcher.
async fn dispatch(
    session: &Arc<Session>,
    publisher: &Arc<dyn Publisher>,
    config: &PublisherConfig,
    table: &Arc<DigestTable>,
    sender: &mut Option<JoinHandle<()>>,
    message: Message,
) -> Result<bool> {
    match message.kind {
        FrameKind::Nul => {
            debug!("peer ended the stream");
            session.close().await;
            return Ok(false);
        }
        FrameKind::Err => {
            warn!(reason = %message.error_reason(), "peer reported an error");
            return Ok(true);
        }
        FrameKind::Msg => {}
    }

    match message.message_type() {
        Some(MessageType::Subscribe) => {
            let sub = Subscribe::decode(&message)?;
            if sender.is_some() {
                warn!("ignoring repeated subscribe");
                return Ok(true);
            }
            if !publisher.on_subscribe(session, sub.nonce.as_ref(), &sub.other_headers).await {
                info!("subscribe refused by application");
                complete(session).await?;
                return Ok(true);
            }
            *sender = Some(spawn_sender(session, publisher, config, table, None));
        }
        Some(MessageType::JournalResume) => {
            let resume = JournalResume::decode(&message)?;
            if session.record_type() != RecordType::Journal {
                session
                    .channel()
                    .send(Message::error("journal-resume on a non-journal session"))
                    .await?;
                return Ok(true);
            }
            if sender.is_some() {
                warn!("ignoring journal-resume while sending");
                return Ok(true);
            }
            let record = publisher
                .on_journal_resume(session, &resume.nonce, resume.offset, &resume.other_headers)
                .await;
            match record {
                Some(record) if *record.nonce() == resume.nonce => {
                    info!(nonce = %resume.nonce, offset = resume.offset, "resuming journal");
                    let start = Resume {
                        record,
                        offset: resume.offset,
                    };
                    *sender = Some(spawn_sender(session, publisher, config, table, Some(start)));
                }
                _ => {
                    info!(nonce = %resume.nonce, "journal record missing");
                    session.channel().send(journal_missing(&resume.nonce)?).await?;
                }
            }
        }
        Some(MessageType::Digest) => {
            let digests = DigestMessage::decode(&message)?;
            let mut statuses = BTreeMap::new();
            for (nonce, peer) in digests.digests {
                let pair = table.reconcile(nonce.clone(), peer);
                publisher
                    .notify_peer_digest(session, &pair, &digests.other_headers)
                    .await;
                statuses.insert(nonce, pair.status);
            }
            debug!(count = statuses.len(), "answering digest batch");
            session
                .channel()
                .send(DigestResponse::new(statuses).encode()?)
                .await?;
        }
        Some(MessageType::Sync) => {
            let sync = SyncMessage::decode(&message)?;
            debug!(nonce = %sync.nonce, "peer synced record");
            publisher.on_sync(session, &sync.nonce, &sync.other_headers).await;
        }
        other => {
            return Err(SessionError::PeerError(format!(
                "unexpected message for a publisher: {other:?}"
            )));
        }
    }
    Ok(true)
}

fn spawn_sender(
    session: &Arc<Session>,
    publisher: &Arc<dyn Publisher>,
    config: &PublisherConfig,
    table: &Arc<DigestTable>,
    resume: Option<Resume>,
) -> JoinHandle<()> {
    let span = session.span().clone();
    tokio::spawn(
        send_loop(
            Arc::clone(session),
            Arc::clone(publisher),
            config.clone(),
            Arc::clone(table),
            resume,
        )
        .instrument(span),
    )
}

async fn send_loop(
    session: Arc<Session>,
    publisher: Arc<dyn Publisher>,
    config: PublisherConfig,
    table: Arc<DigestTable>,
    mut resume: Option<Resume>,
) {
    while session.is_ok() {
        let (record, offset) = match resume.take() {
            Some(r) => (r.record, r.offset),
            None => match publisher.next_record(&session).await {
                Ok(Some(record)) => (record, 0),
                Ok(None) if session.mode() == Mode::Live => {
                    tokio::select! {
                        _ = tokio::time::sleep(config.live_poll_interval) => {}
                        _ = session.closed() => {}
                    }
                    continue;
                }
                Ok(None) => {
                    if let Err(e) = complete(&session).await {
                        warn!(error = %e, "failed to signal completion");
                        session.set_errored().await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "record source failed");
                    session.set_errored().await;
                    return;
                }
            },
        };

        let info = record.info.clone();
        match send_record(&session, &table, record, offset).await {
            Ok(digest) => {
                debug!(nonce = %info.nonce, digest = %digest, "record sent");
                if !publisher.notify_digest(&session, &info, &digest).await {
                    info!("application stopped sending");
                    if let Err(e) = complete(&session).await {
                        warn!(error = %e, "failed to signal completion");
                        session.set_errored().await;
                    }
                    return;
                }
            }
            Err(SendError::Record(reason)) => {
                warn!(nonce = %info.nonce, %reason, "record aborted");
            }
            Err(SendError::Fatal(e)) => {
                warn!(nonce = %info.nonce, error = %e, "record transfer failed");
                session.set_errored().await;
                return;
            }
        }
    }
}

/// Tell the peer no further records follow.
pub async fn complete(session: &Session) -> Result<()> {
    debug!("sending end of stream");
    session.channel().send(Message::nul()).await
}

/// Stream one record, returning its digest over all three segments.
///
/// With `offset > 0` the first `offset` payload bytes are digested but not
/// sent, and the payload length header covers only the suffix.
async fn send_record(
    session: &Session,
    table: &DigestTable,
    mut record: SourceRecord,
    offset: u64,
) -> std::result::Result<DigestValue, SendError> {
    let info = &record.info;
    if offset > info.payload_len {
        let reason = format!(
            "resume offset {offset} exceeds payload length {} of {}",
            info.payload_len, info.nonce
        );
        session
            .channel()
            .send(Message::error(reason.as_str()))
            .await
            .map_err(SendError::Fatal)?;
        return Err(SendError::Record(reason));
    }

    let header = RecordHeader::new(
        session.record_type(),
        RecordInfo::new(
            info.nonce.clone(),
            info.sys_metadata_len,
            info.app_metadata_len,
            info.payload_len - offset,
        ),
    );
    let headers = header.to_headers().map_err(|e| SendError::Fatal(e.into()))?;
    let mut body = session
        .channel()
        .start_body(FrameKind::Msg, headers)
        .await
        .map_err(SendError::Fatal)?;

    let mut digester = session.digest_method().digester();
    match stream_segments(&mut record, offset, &mut digester, body.as_mut()).await {
        Ok(()) => {}
        Err(SegmentError::Source(e)) => {
            let reason = format!("reading record {}: {e}", record.info.nonce);
            body.abort(&reason).await.map_err(SendError::Fatal)?;
            return Err(SendError::Record(reason));
        }
        Err(SegmentError::Channel(e)) => return Err(SendError::Fatal(e)),
    }

    // The peer may answer with a digest as soon as the frame lands, so the
    // entry must exist before the frame is released.
    let digest = digester.finish();
    let nonce = record.info.nonce.clone();
    if let Err(e) = table.add_digest(nonce.clone(), digest.clone()) {
        body.abort(&e.to_string()).await.map_err(SendError::Fatal)?;
        return Err(SendError::Fatal(e.into()));
    }
    if let Err(e) = body.finish().await {
        table.fetch_and_remove_digest(nonce.as_str());
        return Err(SendError::Fatal(e));
    }
    Ok(digest)
}

enum SegmentError {
    Source(std::io::Error),
    Channel(SessionError),
}

async fn stream_segments(
    record: &mut SourceRecord,
    offset: u64,
    digester: &mut Digester,
    body: &mut dyn BodyWriter,
) -> std::result::Result<(), SegmentError> {
    let info = record.info.clone();
    let mut buf = vec![0u8; CHUNK_SIZE];

    copy_segment(&mut record.sys_metadata, info.sys_metadata_len, digester, body, &mut buf).await?;
    body.write_all(BREAK).await.map_err(SegmentError::Channel)?;

    copy_segment(&mut record.app_metadata, info.app_metadata_len, digester, body, &mut buf).await?;
    body.write_all(BREAK).await.map_err(SegmentError::Channel)?;

    if offset > 0 {
        digester
            .absorb(&mut record.payload, offset)
            .await
            .map_err(|e| match e {
                CoreError::Io(io) => SegmentError::Source(io),
                other => SegmentError::Source(std::io::Error::other(other.to_string())),
            })?;
    }
    copy_segment(&mut record.payload, info.payload_len - offset, digester, body, &mut buf).await?;
    body.write_all(BREAK).await.map_err(SegmentError::Channel)?;
    Ok(())
}

/// Forward exactly `len` bytes from `reader` to `body`, digesting them.
async fn copy_segment<R>(
    reader: &mut R,
    len: u64,
    digester: &mut Digester,
    body: &mut dyn BodyWriter,
    buf: &mut [u8],
) -> std::result::Result<(), SegmentError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(SegmentError::Source)?;
        if n == 0 {
            return Err(SegmentError::Source(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("segment ended {remaining} bytes short of {len}"),
            )));
        }
        digester.update(&buf[..n]);
        body.write_all(&buf[..n]).await.map_err(SegmentError::Channel)?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionParams;
    use crate::transport::memory::pair;
    use crate::transport::Channel;
    use bytes::Bytes;
    use jalop_core::{record_digest, DigestMethod, DigestStatus, XmlEncoding};
    use jalop_wire::{decode_journal_missing, RecordMessage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Source {
        records: Mutex<VecDeque<(String, &'static str, &'static str, &'static str)>>,
        journal: Option<(String, &'static [u8])>,
        digests: Mutex<Vec<(Nonce, DigestValue)>>,
        peer: Mutex<Vec<DigestPair>>,
        synced: Mutex<Vec<Nonce>>,
        fail_next: Mutex<bool>,
    }

    impl Source {
        fn with(records: &[(&str, &'static str, &'static str, &'static str)]) -> Self {
            Self {
                records: Mutex::new(records.iter().map(|(n, s, a, p)| (n.to_string(), *s, *a, *p)).collect()),
                ..Self::default()
            }
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
        }
    }

    #[async_trait]
    impl Publisher for Source {
        async fn on_subscribe(&self, _s: &Session, _n: Option<&Nonce>, _h: &Headers) -> bool {
            true
        }

        async fn on_journal_resume(&self, _s: &Session, nonce: &Nonce, _o: u64, _h: &Headers) -> Option<SourceRecord> {
            let (n, payload) = self.journal.clone()?;
            (n == nonce.as_str()).then(|| SourceRecord::from_bytes(nonce.clone(), "sys", "app", payload))
        }

        async fn next_record(&self, _s: &Session) -> std::io::Result<Option<SourceRecord>> {
            let Some((n, s, a, p)) = self.records.lock().unwrap().pop_front() else {
                return Ok(None);
            };
            let mut record = SourceRecord::from_bytes(Nonce::new(n).unwrap(), s, a, p);
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                record.payload = Box::new(FailingReader);
            }
            Ok(Some(record))
        }

        async fn notify_digest(&self, _s: &Session, info: &RecordInfo, digest: &DigestValue) -> bool {
            self.digests.lock().unwrap().push((info.nonce.clone(), digest.clone()));
            true
        }

        async fn notify_peer_digest(&self, _s: &Session, pair: &DigestPair, _h: &Headers) {
            self.peer.lock().unwrap().push(pair.clone());
        }

        async fn on_sync(&self, _s: &Session, nonce: &Nonce, _h: &Headers) {
            self.synced.lock().unwrap().push(nonce.clone());
        }
    }

    fn session(record_type: RecordType, mode: Mode) -> (Arc<Session>, crate::transport::memory::MemoryChannel) {
        let (local, peer) = pair("subscriber", "publisher");
        let session = Session::new(
            SessionParams {
                record_type,
                role: Role::Subscriber,
                mode,
                digest_method: DigestMethod::Sha256,
                xml_encoding: XmlEncoding::none(),
                initiator: false,
                peer_agent: None,
            },
            Arc::new(local),
        );
        session.activate().unwrap();
        (Arc::new(session), peer)
    }

    fn nonce(s: &str) -> Nonce {
        Nonce::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_archive_stream_then_complete() {
        let (session, peer) = session(RecordType::Log, Mode::Archive);
        let source = Arc::new(Source::with(&[("1", "<s1/>", "", "one"), ("2", "<s2/>", "<a/>", "two")]));
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source.clone(), PublisherConfig::default()));

        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        let first = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        let second = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(first.header.info.nonce, nonce("1"));
        assert_eq!(&second.payload[..], b"two");
        assert_eq!(peer.recv().await.unwrap().kind, FrameKind::Nul);

        let digests = source.digests.lock().unwrap().clone();
        assert_eq!(digests[1].1, record_digest(DigestMethod::Sha256, b"<s2/>", b"<a/>", b"two"));

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_digest_exchange_and_sync() {
        let (session, peer) = session(RecordType::Audit, Mode::Archive);
        let source = Arc::new(Source::with(&[("7", "s", "a", "<audit/>")]));
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source.clone(), PublisherConfig::default()));

        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        let rec = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(peer.recv().await.unwrap().kind, FrameKind::Nul);

        let good = record_digest(DigestMethod::Sha256, &rec.sys_metadata, &rec.app_metadata, &rec.payload);
        let mut batch = BTreeMap::new();
        batch.insert(nonce("7"), good);
        batch.insert(nonce("8"), DigestMethod::Sha256.digest(b"never sent"));
        peer.send(DigestMessage::new(batch).encode().unwrap()).await.unwrap();

        let resp = DigestResponse::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(resp.statuses[&nonce("7")], DigestStatus::Confirmed);
        assert_eq!(resp.statuses[&nonce("8")], DigestStatus::Unknown);

        peer.send(SyncMessage::new(nonce("7")).encode().unwrap()).await.unwrap();
        peer.send(Message::nul()).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(*source.synced.lock().unwrap(), vec![nonce("7")]);
        assert_eq!(source.peer.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_journal_resume_digests_whole_payload() {
        let (session, peer) = session(RecordType::Journal, Mode::Archive);
        let payload: &'static [u8] = b"0123456789abcdef";
        let source = Arc::new(Source {
            journal: Some(("j1".into(), payload)),
            ..Source::default()
        });
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source.clone(), PublisherConfig::default()));

        peer.send(JournalResume::new(nonce("j1"), 10).encode().unwrap()).await.unwrap();
        let rec = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(rec.header.info.payload_len, 6);
        assert_eq!(&rec.payload[..], b"abcdef");
        assert_eq!(peer.recv().await.unwrap().kind, FrameKind::Nul);

        let digests = source.digests.lock().unwrap().clone();
        assert_eq!(digests[0].1, record_digest(DigestMethod::Sha256, b"sys", b"app", payload));

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_journal_reported() {
        let (session, peer) = session(RecordType::Journal, Mode::Archive);
        let source = Arc::new(Source::default());
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source, PublisherConfig::default()));

        peer.send(JournalResume::new(nonce("gone"), 4).encode().unwrap()).await.unwrap();
        let reply = peer.recv().await.unwrap();
        assert_eq!(decode_journal_missing(&reply), Some(nonce("gone")));
        assert!(session.is_ok());

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_source_error_aborts_only_that_record() {
        let (session, peer) = session(RecordType::Log, Mode::Archive);
        let source = Arc::new(Source::with(&[("1", "s", "a", "bad"), ("2", "s", "a", "good")]));
        *source.fail_next.lock().unwrap() = true;
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source.clone(), PublisherConfig::default()));

        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        let aborted = peer.recv().await.unwrap();
        assert_eq!(aborted.kind, FrameKind::Err);
        let rec = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(rec.header.info.nonce, nonce("2"));
        assert_eq!(peer.recv().await.unwrap().kind, FrameKind::Nul);

        peer.close().await;
        task.await.unwrap().unwrap();
        assert_eq!(source.digests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_errors_session() {
        let (session, peer) = session(RecordType::Log, Mode::Archive);
        let source = Arc::new(Source::with(&[("1", "s", "a", "x"), ("1", "s", "a", "y")]));
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source, PublisherConfig::default()));

        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        // The duplicate is withdrawn before it reaches the wire.
        let second = peer.recv().await.unwrap();
        assert_eq!(second.kind, FrameKind::Err);
        let _ = task.await.unwrap();
        session.closed().await;
        assert_eq!(session.state(), crate::SessionState::Errored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_digest_tracked_before_record_arrives() {
        let (session, peer) = session(RecordType::Log, Mode::Archive);
        let names: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let records: Vec<_> = names.iter().map(|n| (n.as_str(), "s", "a", "payload")).collect();
        let source = Arc::new(Source::with(&records));
        let task = tokio::spawn(run_publisher(Arc::clone(&session), source, PublisherConfig::default()));

        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        for _ in 0..names.len() {
            let rec = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
            let digest = record_digest(DigestMethod::Sha256, &rec.sys_metadata, &rec.app_metadata, &rec.payload);
            let mut batch = BTreeMap::new();
            batch.insert(rec.header.info.nonce.clone(), digest);
            peer.send(DigestMessage::new(batch).encode().unwrap()).await.unwrap();
        }

        let mut confirmed = 0;
        while confirmed < names.len() {
            let reply = peer.recv().await.unwrap();
            if reply.kind == FrameKind::Nul {
                continue;
            }
            let resp = DigestResponse::decode(&reply).unwrap();
            for status in resp.statuses.values() {
                assert_eq!(*status, DigestStatus::Confirmed);
                confirmed += 1;
            }
        }
        peer.send(Message::nul()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_mode_polls_empty_source() {
        let (session, peer) = session(RecordType::Log, Mode::Live);
        let source = Arc::new(Source::default());
        let task = tokio::spawn(run_publisher(
            Arc::clone(&session),
            source.clone(),
            PublisherConfig::new(Duration::from_millis(100)).unwrap(),
        ));
        peer.send(Subscribe::default().encode().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        source
            .records
            .lock()
            .unwrap()
            .push_back(("late".into(), "s", "a", "p"));
        let rec = RecordMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(rec.header.info.nonce, nonce("late"));
        assert_eq!(rec.payload, Bytes::from_static(b"p"));

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        assert!(PublisherConfig::new(Duration::ZERO).is_err());
    }
}

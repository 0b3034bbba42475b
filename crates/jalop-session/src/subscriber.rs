//! Subscriber engine and digest batching.
//!
//! The reader task receives records, hands each segment to the application
//! while digesting it, and queues the digest. A flush task ships queued
//! digests when `pending_digest_max` is reached or `pending_digest_timeout`
//! passes, whichever comes first.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn, Instrument};

use jalop_core::{
    DigestPair, DigestReader, DigestStatus, DigestValue, Digester, Nonce, RecordInfo, RecordStream,
    RecordType, Role,
};
use jalop_wire::{
    decode_journal_missing, DigestMessage, DigestResponse, FrameKind, Headers, JournalResume,
    Message, MessageType, RecordHeader, Subscribe, SyncMessage, WireError, WireMessage, BREAK,
};

use crate::digests::PendingDigests;
use crate::error::{Result, SessionError};
use crate::session::Session;
use crate::transport::{body_error, IncomingFrame};

/// Subscriber engine tuning.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Queue size that triggers an immediate flush.
    pub pending_digest_max: usize,
    /// Longest a digest waits in the queue.
    pub pending_digest_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            pending_digest_max: 128,
            pending_digest_timeout: Duration::from_secs(30),
        }
    }
}

impl SubscriberConfig {
    pub fn new(pending_digest_max: usize, pending_digest_timeout: Duration) -> Result<Self> {
        let config = Self {
            pending_digest_max,
            pending_digest_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pending_digest_max == 0 {
            return Err(SessionError::InvalidArgument("pending digest max must be positive".into()));
        }
        if self.pending_digest_timeout.is_zero() {
            return Err(SessionError::InvalidArgument(
                "pending digest timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What the subscriber asks the publisher for when a session starts.
pub struct SubscribeRequest {
    /// Last record already held, or the journal record to resume.
    pub nonce: Option<Nonce>,
    /// Journal bytes already stored. Non-zero means resume.
    pub offset: u64,
    /// The stored prefix of the journal payload, read to digest it.
    pub resume_input: Option<RecordStream>,
    pub headers: Headers,
}

impl SubscribeRequest {
    /// Start from whatever the publisher sends first.
    pub fn subscribe(nonce: Option<Nonce>) -> Self {
        Self {
            nonce,
            offset: 0,
            resume_input: None,
            headers: Headers::new(),
        }
    }

    /// Continue journal record `nonce` after `offset` stored bytes.
    pub fn resume(nonce: Nonce, offset: u64, stored_prefix: RecordStream) -> Self {
        Self {
            nonce: Some(nonce),
            offset,
            resume_input: Some(stored_prefix),
            headers: Headers::new(),
        }
    }
}

/// Application callbacks for the subscribing side of a session.
///
/// Segment callbacks receive a reader over the segment bytes; anything the
/// callback leaves unread is drained after it returns. `false` returns end
/// the session.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn get_subscribe_request(&self, session: &Session) -> std::io::Result<SubscribeRequest>;

    async fn notify_sys_metadata(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        headers: &Headers,
    ) -> bool;

    async fn notify_app_metadata(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        headers: &Headers,
    ) -> bool;

    /// For a resumed journal `info.payload_len` and `data` cover only the
    /// bytes after the resume offset.
    async fn notify_payload(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        headers: &Headers,
    ) -> bool;

    /// Digest of a fully received record, covering all three segments.
    async fn notify_digest(&self, session: &Session, info: &RecordInfo, digest: &DigestValue) -> bool;

    /// The publisher's verdicts on a digest batch, unmodified.
    async fn notify_digest_response(&self, session: &Session, pairs: &[DigestPair], headers: &Headers) -> bool;

    /// The journal record we asked to resume is gone. Return `true` to
    /// subscribe from the publisher's next record instead.
    async fn notify_journal_missing(&self, _session: &Session, _nonce: &Nonce) -> bool {
        true
    }

    /// The publisher sent its last record and every digest is settled.
    async fn on_complete(&self, _session: &Session) {}
}

struct ResumeState {
    nonce: Nonce,
    offset: u64,
    input: RecordStream,
}

#[derive(Clone, Copy)]
enum Segment {
    System,
    Application,
    Payload,
}

/// Run the subscribing side of `session` until it closes.
pub async fn run_subscriber(
    session: Arc<Session>,
    subscriber: Arc<dyn Subscriber>,
    config: SubscriberConfig,
) -> Result<()> {
    config.validate()?;
    if session.local_role() != Role::Subscriber {
        return Err(SessionError::InvalidArgument(format!(
            "session {:016x} is not subscribing",
            session.id()
        )));
    }
    let pending = Arc::new(PendingDigests::new(config.pending_digest_max)?);

    let request = match subscriber.get_subscribe_request(&session).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "no subscribe request");
            session.set_errored().await;
            return Err(e.into());
        }
    };
    let mut resume = match send_request(&session, request).await {
        Ok(r) => r,
        Err(e) => {
            session.set_errored().await;
            return Err(e);
        }
    };

    let flusher = tokio::spawn(
        flush_loop(Arc::clone(&session), Arc::clone(&pending), config.pending_digest_timeout)
            .instrument(session.span().clone()),
    );

    let mut completing = false;
    let result = loop {
        let frame = tokio::select! {
            f = session.channel().recv_streaming() => f,
            _ = session.closed() => break Ok(()),
        };
        let step = match frame {
            Ok(frame) if is_record(&frame) => {
                receive_record(&session, &*subscriber, &pending, frame, resume.take()).await
            }
            Ok(frame) => match frame.into_message().await {
                Ok(message) => {
                    handle_frame(&session, &*subscriber, &pending, &message, &mut resume, &mut completing)
                        .await
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match step {
            Ok(true) => {}
            Ok(false) => {
                info!("application ended the session");
                session.close().await;
                break Ok(());
            }
            Err(SessionError::Closed) => {
                session.mark_closed();
                break Ok(());
            }
            Err(SessionError::Io(e)) if e.kind() == ErrorKind::ConnectionAborted => {
                warn!(reason = %e, "publisher abandoned a record");
            }
            Err(e) => {
                warn!(error = %e, "subscriber failed");
                session.set_errored().await;
                break Err(e);
            }
        }

        if completing && pending.is_idle() {
            subscriber.on_complete(&session).await;
            session.close().await;
            break Ok(());
        }
    };

    let _ = flusher.await;
    result
}

async fn send_request(session: &Session, request: SubscribeRequest) -> Result<Option<ResumeState>> {
    if request.offset == 0 {
        let sub = Subscribe {
            nonce: request.nonce,
            other_headers: request.headers,
        };
        session.channel().send(sub.encode()?).await?;
        return Ok(None);
    }
    if session.record_type() != RecordType::Journal {
        return Err(SessionError::InvalidArgument(format!(
            "cannot resume a {} record",
            session.record_type()
        )));
    }
    let (Some(nonce), Some(input)) = (request.nonce, request.resume_input) else {
        return Err(SessionError::InvalidArgument(
            "journal resume needs a nonce and the stored prefix".into(),
        ));
    };
    let mut msg = JournalResume::new(nonce.clone(), request.offset);
    msg.other_headers = request.headers;
    session.channel().send(msg.encode()?).await?;
    info!(nonce = %nonce, offset = request.offset, "requested journal resume");
    Ok(Some(ResumeState {
        nonce,
        offset: request.offset,
        input,
    }))
}

fn is_record(frame: &IncomingFrame) -> bool {
    frame.kind == FrameKind::Msg
        && frame
            .message_type()
            .and_then(MessageType::record_type)
            .is_some()
}

async fn handle_frame(
    session: &Session,
    subscriber: &dyn Subscriber,
    pending: &PendingDigests,
    message: &Message,
    resume: &mut Option<ResumeState>,
    completing: &mut bool,
) -> Result<bool> {
    match message.kind {
        FrameKind::Nul => {
            debug!("publisher completed");
            *completing = true;
            pending.flush_now();
            Ok(true)
        }
        FrameKind::Err => handle_error_frame(session, subscriber, message, resume).await,
        FrameKind::Msg => handle_message(session, subscriber, pending, message).await,
    }
}

async fn handle_error_frame(
    session: &Session,
    subscriber: &dyn Subscriber,
    message: &Message,
    resume: &mut Option<ResumeState>,
) -> Result<bool> {
    let Some(nonce) = decode_journal_missing(message) else {
        warn!(reason = %message.error_reason(), "publisher reported an error");
        return Ok(true);
    };
    info!(nonce = %nonce, "journal record missing at publisher");
    *resume = None;
    if !subscriber.notify_journal_missing(session, &nonce).await {
        return Ok(false);
    }
    session.channel().send(Subscribe::default().encode()?).await?;
    Ok(true)
}

async fn handle_message(
    session: &Session,
    subscriber: &dyn Subscriber,
    pending: &PendingDigests,
    message: &Message,
) -> Result<bool> {
    match message.message_type() {
        Some(MessageType::DigestResponse) => {
            let response = DigestResponse::decode(message)?;
            let pairs = pending.reconcile(&response.statuses);
            debug!(count = pairs.len(), "digest response");
            let keep = subscriber
                .notify_digest_response(session, &pairs, &response.other_headers)
                .await;
            for pair in pairs.iter().filter(|p| p.status == DigestStatus::Confirmed) {
                session
                    .channel()
                    .send(SyncMessage::new(pair.nonce.clone()).encode()?)
                    .await?;
            }
            for pair in pairs.iter().filter(|p| p.status != DigestStatus::Confirmed) {
                warn!(nonce = %pair.nonce, status = %pair.status, "record not confirmed");
            }
            Ok(keep)
        }
        other => Err(SessionError::PeerError(format!(
            "unexpected message for a subscriber: {other:?}"
        ))),
    }
}

/// Receive one record as its body arrives, segment by segment.
///
/// A failed body read outranks whatever the application callback returned.
async fn receive_record(
    session: &Session,
    subscriber: &dyn Subscriber,
    pending: &PendingDigests,
    frame: IncomingFrame,
    resume: Option<ResumeState>,
) -> Result<bool> {
    let header = RecordHeader::from_frame(frame.kind, &frame.headers)?;
    if header.record_type != session.record_type() {
        return Err(SessionError::PeerError(format!(
            "{} record on a {} session",
            header.record_type,
            session.record_type()
        )));
    }
    let info = header.info;
    let headers = &header.other_headers;
    let mut body = frame.body;
    let mut digester = session.digest_method().digester();

    let mut keep = deliver(session, subscriber, &info, headers, Segment::System, &mut body, info.sys_metadata_len, &mut digester).await?;
    if keep {
        keep = deliver(session, subscriber, &info, headers, Segment::Application, &mut body, info.app_metadata_len, &mut digester).await?;
    }
    if !keep {
        return Ok(false);
    }

    match resume {
        Some(mut r) if r.nonce == info.nonce => {
            debug!(nonce = %info.nonce, offset = r.offset, "digesting stored prefix");
            digester.absorb(&mut r.input, r.offset).await?;
        }
        Some(r) => {
            warn!(expected = %r.nonce, got = %info.nonce, "publisher did not resume the requested record");
        }
        None => {}
    }
    if !deliver(session, subscriber, &info, headers, Segment::Payload, &mut body, info.payload_len, &mut digester).await? {
        return Ok(false);
    }

    // The frame must end right after the last break.
    let mut trailing = [0u8; 1];
    if body.read(&mut trailing).await.map_err(body_error)? != 0 {
        return Err(WireError::Malformed(format!("record {} runs past its declared length", info.nonce)).into());
    }

    let digest = digester.finish();
    debug!(nonce = %info.nonce, digest = %digest, "record received");
    let keep = subscriber.notify_digest(session, &info, &digest).await;
    pending.add_digest(info.nonce, digest)?;
    Ok(keep)
}

/// Hand one segment of `len` bytes to the application, digesting every byte
/// of it, then consume the break that follows.
#[allow(clippy::too_many_arguments)]
async fn deliver(
    session: &Session,
    subscriber: &dyn Subscriber,
    info: &RecordInfo,
    headers: &Headers,
    segment: Segment,
    body: &mut (dyn AsyncRead + Send + Unpin),
    len: u64,
    digester: &mut Digester,
) -> Result<bool> {
    let mut reader = DigestReader::new((&mut *body).take(len), digester);
    let keep = match segment {
        Segment::System => subscriber.notify_sys_metadata(session, info, &mut reader, headers).await,
        Segment::Application => subscriber.notify_app_metadata(session, info, &mut reader, headers).await,
        Segment::Payload => subscriber.notify_payload(session, info, &mut reader, headers).await,
    };
    tokio::io::copy(&mut reader, &mut tokio::io::sink())
        .await
        .map_err(body_error)?;
    if reader.into_inner().limit() > 0 {
        return Err(WireError::Malformed(format!("record {} body ends inside a segment", info.nonce)).into());
    }

    let mut marker = Vec::with_capacity(BREAK.len());
    (&mut *body)
        .take(BREAK.len() as u64)
        .read_to_end(&mut marker)
        .await
        .map_err(body_error)?;
    if marker != BREAK {
        return Err(WireError::Malformed(format!("record {} is missing a BREAK", info.nonce)).into());
    }
    Ok(keep)
}

/// Ship queued digests on size or age until the session ends.
async fn flush_loop(session: Arc<Session>, pending: Arc<PendingDigests>, timeout: Duration) {
    while session.is_ok() {
        if pending.pending_len() < pending.max() {
            tokio::select! {
                _ = pending.notified() => {}
                _ = tokio::time::sleep(timeout) => {}
                _ = session.closed() => break,
            }
        }
        let Some(batch) = pending.take_batch() else {
            continue;
        };
        let count = batch.len();
        let sent = match DigestMessage::new(batch.clone()).encode() {
            Ok(message) => session.channel().send(message).await,
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => debug!(count, "digest batch flushed"),
            Err(e) => {
                warn!(error = %e, "digest flush failed");
                pending.restore_batch(batch);
                session.set_errored().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionParams;
    use crate::transport::memory::{pair, MemoryChannel};
    use crate::transport::Channel;
    use jalop_core::{record_digest, DigestMethod, Mode, XmlEncoding};
    use bytes::Bytes;
    use jalop_wire::{journal_missing, RecordMessage};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Sink {
        resume: Mutex<Option<(String, u64, &'static [u8])>>,
        payloads: Mutex<Vec<Vec<u8>>>,
        digests: Mutex<Vec<(Nonce, DigestValue)>>,
        responses: Mutex<Vec<DigestPair>>,
        missing: Mutex<Vec<Nonce>>,
        completed: Mutex<bool>,
    }

    #[async_trait]
    impl Subscriber for Sink {
        async fn get_subscribe_request(&self, _s: &Session) -> std::io::Result<SubscribeRequest> {
            Ok(match self.resume.lock().unwrap().take() {
                Some((n, offset, prefix)) => {
                    SubscribeRequest::resume(Nonce::new(n).unwrap(), offset, Box::new(prefix))
                }
                None => SubscribeRequest::subscribe(None),
            })
        }

        async fn notify_sys_metadata(
            &self,
            _s: &Session,
            _i: &RecordInfo,
            _d: &mut (dyn AsyncRead + Send + Unpin),
            _h: &Headers,
        ) -> bool {
            // Leave the bytes unread; the engine drains them.
            true
        }

        async fn notify_app_metadata(
            &self,
            _s: &Session,
            _i: &RecordInfo,
            data: &mut (dyn AsyncRead + Send + Unpin),
            _h: &Headers,
        ) -> bool {
            let mut first = [0u8; 1];
            let _ = data.read(&mut first).await;
            true
        }

        async fn notify_payload(
            &self,
            _s: &Session,
            _i: &RecordInfo,
            data: &mut (dyn AsyncRead + Send + Unpin),
            _h: &Headers,
        ) -> bool {
            let mut buf = Vec::new();
            if data.read_to_end(&mut buf).await.is_err() {
                return false;
            }
            self.payloads.lock().unwrap().push(buf);
            true
        }

        async fn notify_digest(&self, _s: &Session, info: &RecordInfo, digest: &DigestValue) -> bool {
            self.digests.lock().unwrap().push((info.nonce.clone(), digest.clone()));
            true
        }

        async fn notify_digest_response(&self, _s: &Session, pairs: &[DigestPair], _h: &Headers) -> bool {
            self.responses.lock().unwrap().extend_from_slice(pairs);
            true
        }

        async fn notify_journal_missing(&self, _s: &Session, nonce: &Nonce) -> bool {
            self.missing.lock().unwrap().push(nonce.clone());
            true
        }

        async fn on_complete(&self, _s: &Session) {
            *self.completed.lock().unwrap() = true;
        }
    }

    fn session(record_type: RecordType) -> (Arc<Session>, MemoryChannel) {
        let (local, peer) = pair("publisher", "subscriber");
        let session = Session::new(
            SessionParams {
                record_type,
                role: Role::Subscriber,
                mode: Mode::Archive,
                digest_method: DigestMethod::Sha256,
                xml_encoding: XmlEncoding::none(),
                initiator: true,
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

    fn record(rt: RecordType, n: &str, sys: &'static str, app: &'static str, payload: &'static str) -> Message {
        RecordMessage {
            header: RecordHeader::new(rt, RecordInfo::new(nonce(n), 0, 0, 0)),
            sys_metadata: Bytes::from_static(sys.as_bytes()),
            app_metadata: Bytes::from_static(app.as_bytes()),
            payload: Bytes::from_static(payload.as_bytes()),
        }
        .encode()
        .unwrap()
    }

    fn config(max: usize, secs: u64) -> SubscriberConfig {
        SubscriberConfig::new(max, Duration::from_secs(secs)).unwrap()
    }

    #[test]
    fn test_config_rejects_non_positive() {
        assert!(SubscriberConfig::new(0, Duration::from_secs(1)).is_err());
        assert!(SubscriberConfig::new(1, Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_max_without_waiting() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(3, 3600)));

        assert_eq!(peer.recv().await.unwrap().message_type(), Some(MessageType::Subscribe));
        for n in ["1", "2", "3"] {
            peer.send(record(RecordType::Log, n, "s", "a", "p")).await.unwrap();
        }
        let batch = tokio::time::timeout(Duration::from_secs(1), peer.recv())
            .await
            .expect("flush must not wait for the timeout")
            .unwrap();
        assert_eq!(DigestMessage::decode(&batch).unwrap().digests.len(), 3);

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_timeout_below_max() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(100, 1)));

        peer.recv().await.unwrap();
        let start = tokio::time::Instant::now();
        peer.send(record(RecordType::Log, "only", "s", "a", "p")).await.unwrap();
        let batch = peer.recv().await.unwrap();
        let waited = start.elapsed();
        assert!(waited <= Duration::from_millis(1100), "waited {waited:?}");
        let digests = DigestMessage::decode(&batch).unwrap().digests;
        assert_eq!(
            digests[&nonce("only")],
            record_digest(DigestMethod::Sha256, b"s", b"a", b"p")
        );

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_reconciled_and_synced() {
        let (session, peer) = session(RecordType::Audit);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(1, 60)));

        peer.recv().await.unwrap();
        peer.send(record(RecordType::Audit, "12345", "s", "a", "<audit/>")).await.unwrap();
        let batch = DigestMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert!(batch.digests.contains_key("12345"));

        let statuses: BTreeMap<_, _> = [
            (nonce("12345"), DigestStatus::Confirmed),
            (nonce("12346"), DigestStatus::Invalid),
            (nonce("12347"), DigestStatus::Unknown),
        ]
        .into_iter()
        .collect();
        peer.send(DigestResponse::new(statuses.clone()).encode().unwrap()).await.unwrap();

        let sync = SyncMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(sync.nonce, nonce("12345"));

        peer.send(Message::nul()).await.unwrap();
        task.await.unwrap().unwrap();

        let responses = sink.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 3);
        for pair in responses {
            assert_eq!(pair.status, statuses[&pair.nonce]);
        }
        assert!(*sink.completed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_response_still_completes() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(10, 60)));

        peer.recv().await.unwrap();
        peer.send(record(RecordType::Log, "1", "s", "a", "one")).await.unwrap();
        peer.send(record(RecordType::Log, "2", "s", "a", "two")).await.unwrap();
        peer.send(Message::nul()).await.unwrap();
        let batch = DigestMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(batch.digests.len(), 2);

        let statuses: BTreeMap<_, _> = [(nonce("1"), DigestStatus::Confirmed)].into_iter().collect();
        peer.send(DigestResponse::new(statuses).encode().unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        let responses = sink.responses.lock().unwrap().clone();
        let missing = responses.iter().find(|p| p.nonce == nonce("2")).unwrap();
        assert_eq!(missing.status, DigestStatus::Unknown);
        assert!(*sink.completed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_digests_stored_prefix() {
        let (session, peer) = session(RecordType::Journal);
        let sink = Arc::new(Sink::default());
        *sink.resume.lock().unwrap() = Some(("j1".into(), 4, b"0123"));
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(1, 60)));

        let resume = JournalResume::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!((resume.nonce.as_str(), resume.offset), ("j1", 4));

        peer.send(record(RecordType::Journal, "j1", "sys", "app", "456789")).await.unwrap();
        DigestMessage::decode(&peer.recv().await.unwrap()).unwrap();

        assert_eq!(sink.payloads.lock().unwrap()[0], b"456789");
        assert_eq!(
            sink.digests.lock().unwrap()[0].1,
            record_digest(DigestMethod::Sha256, b"sys", b"app", b"0123456789")
        );

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_missing_resubscribes() {
        let (session, peer) = session(RecordType::Journal);
        let sink = Arc::new(Sink::default());
        *sink.resume.lock().unwrap() = Some(("j9".into(), 2, b"ab"));
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(1, 60)));

        peer.recv().await.unwrap();
        peer.send(journal_missing(&nonce("j9")).unwrap()).await.unwrap();
        let next = peer.recv().await.unwrap();
        assert_eq!(next.message_type(), Some(MessageType::Subscribe));
        assert_eq!(*sink.missing.lock().unwrap(), vec![nonce("j9")]);

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_record_errors_session() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink, config(1, 60)));

        peer.recv().await.unwrap();
        let mut bad = record(RecordType::Log, "1", "s", "a", "p");
        bad.body = Bytes::from_static(b"truncated");
        peer.send(bad).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert_eq!(session.state(), crate::SessionState::Errored);
    }

    fn streamed_log_headers(n: &str, payload_len: u64) -> Headers {
        RecordHeader::new(RecordType::Log, RecordInfo::new(nonce(n), 1, 1, payload_len))
            .to_headers()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_record_skipped() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(1, 60)));
        peer.recv().await.unwrap();

        let mut body = peer.start_body(FrameKind::Msg, streamed_log_headers("1", 4)).await.unwrap();
        body.write_all(b"sBREAKaBREAK01").await.unwrap();
        body.abort("source failed").await.unwrap();
        peer.send(record(RecordType::Log, "2", "s", "a", "p")).await.unwrap();

        let batch = DigestMessage::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(batch.digests.len(), 1);
        assert!(batch.digests.contains_key("2"));
        assert_eq!(*sink.payloads.lock().unwrap(), vec![b"p".to_vec()]);
        assert!(session.is_ok());

        peer.close().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_inside_record_ends_session() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink.clone(), config(1, 60)));
        peer.recv().await.unwrap();

        let mut body = peer.start_body(FrameKind::Msg, streamed_log_headers("1", 4)).await.unwrap();
        body.write_all(b"sBREAKaBREAK01").await.unwrap();
        tokio::task::yield_now().await;
        peer.close().await;

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        assert!(sink.digests.lock().unwrap().is_empty());
        assert!(sink.payloads.lock().unwrap().is_empty());
        drop(body);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_flush_loop_promptly() {
        let (session, peer) = session(RecordType::Log);
        let sink = Arc::new(Sink::default());
        let task = tokio::spawn(run_subscriber(Arc::clone(&session), sink, config(10, 3600)));
        peer.recv().await.unwrap();
        session.set_errored().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("engine must stop without waiting out the flush timeout")
            .unwrap()
            .unwrap();
    }
}

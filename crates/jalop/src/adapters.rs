//! Publisher and subscriber applications backed by a record store.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use jalop_core::{DigestPair, DigestStatus, DigestValue, Nonce, RecordInfo, RecordType, SourceRecord};
use jalop_session::{Publisher, Session, SessionId, SubscribeRequest, Subscriber};
use jalop_store::{InsertResult, RecordSink, RecordSource, StoredRecord};
use jalop_wire::Headers;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves records from a [`RecordSource`] in store order.
///
/// Each session keeps its own cursor, starting after the nonce the peer
/// named in `subscribe`.
pub struct StorePublisher<S> {
    source: Arc<S>,
    cursors: Mutex<HashMap<SessionId, Option<Nonce>>>,
}

impl<S: RecordSource> StorePublisher<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }
}

#[async_trait]
impl<S: RecordSource + 'static> Publisher for StorePublisher<S> {
    async fn on_subscribe(&self, session: &Session, nonce: Option<&Nonce>, _headers: &Headers) -> bool {
        lock(&self.cursors).insert(session.id(), nonce.cloned());
        true
    }

    async fn on_journal_resume(
        &self,
        session: &Session,
        nonce: &Nonce,
        _offset: u64,
        _headers: &Headers,
    ) -> Option<SourceRecord> {
        match self.source.get_record(RecordType::Journal, nonce).await {
            Ok(Some(record)) => {
                lock(&self.cursors).insert(session.id(), Some(nonce.clone()));
                Some(record.into_source())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(nonce = %nonce, error = %e, "journal lookup failed");
                None
            }
        }
    }

    async fn next_record(&self, session: &Session) -> std::io::Result<Option<SourceRecord>> {
        let cursor = lock(&self.cursors).get(&session.id()).cloned().flatten();
        let record = self
            .source
            .next_record(session.record_type(), cursor.as_ref())
            .await
            .map_err(std::io::Error::other)?;
        Ok(record.map(|r| {
            lock(&self.cursors).insert(session.id(), Some(r.nonce.clone()));
            r.into_source()
        }))
    }

    async fn notify_digest(&self, session: &Session, info: &RecordInfo, digest: &DigestValue) -> bool {
        if let Err(e) = self.source.set_digest(session.record_type(), &info.nonce, digest).await {
            warn!(nonce = %info.nonce, error = %e, "could not store digest");
        }
        true
    }

    async fn notify_peer_digest(&self, _session: &Session, pair: &DigestPair, _headers: &Headers) {
        match pair.status {
            DigestStatus::Confirmed => debug!(nonce = %pair.nonce, "peer confirmed digest"),
            status => warn!(nonce = %pair.nonce, %status, "peer digest mismatch"),
        }
    }

    async fn on_sync(&self, session: &Session, nonce: &Nonce, _headers: &Headers) {
        if let Err(e) = self.source.mark_synced(session.record_type(), nonce).await {
            warn!(nonce = %nonce, error = %e, "could not mark record synced");
        }
    }
}

#[derive(Default)]
struct Assembly {
    sys_metadata: Bytes,
    app_metadata: Bytes,
    payload: BytesMut,
}

/// Stores every received record in a [`RecordSink`].
///
/// Journal sessions resume the oldest partial journal in the sink; other
/// sessions subscribe after the newest stored record.
pub struct StoreSubscriber<K> {
    sink: Arc<K>,
    assemblies: Mutex<HashMap<SessionId, Assembly>>,
    prefixes: Mutex<HashMap<SessionId, (Nonce, Bytes)>>,
}

impl<K: RecordSink> StoreSubscriber<K> {
    pub fn new(sink: Arc<K>) -> Self {
        Self {
            sink,
            assemblies: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &Arc<K> {
        &self.sink
    }

    /// Read a whole segment. On failure, returns what arrived before it.
    async fn read_segment(
        data: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
    ) -> Result<Bytes, (Bytes, std::io::Error)> {
        let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        match data.read_to_end(&mut buf).await {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) => {
                warn!(error = %e, received = buf.len(), "segment read failed");
                Err((Bytes::from(buf), e))
            }
        }
    }

    /// Keep the journal bytes that did arrive so the next session resumes
    /// after them instead of starting over.
    async fn save_partial(&self, session: &Session, info: &RecordInfo, received: Bytes) {
        let prefix = self.take_prefix(session, &info.nonce);
        let Some(assembly) = lock(&self.assemblies).remove(&session.id()) else {
            return;
        };
        let mut payload = BytesMut::from(&prefix.unwrap_or_default()[..]);
        payload.extend_from_slice(&received);
        if payload.is_empty() {
            return;
        }
        let record = StoredRecord::new(
            RecordType::Journal,
            info.nonce.clone(),
            assembly.sys_metadata,
            assembly.app_metadata,
            payload.freeze(),
        );
        match self.sink.insert_partial(&record).await {
            Ok(()) => info!(nonce = %info.nonce, stored = record.payload.len(), "partial journal saved"),
            Err(e) => warn!(nonce = %info.nonce, error = %e, "could not save partial journal"),
        }
    }

    fn take_prefix(&self, session: &Session, nonce: &Nonce) -> Option<Bytes> {
        match lock(&self.prefixes).remove(&session.id()) {
            Some((n, prefix)) if n == *nonce => Some(prefix),
            _ => None,
        }
    }
}

#[async_trait]
impl<K: RecordSink + 'static> Subscriber for StoreSubscriber<K> {
    async fn get_subscribe_request(&self, session: &Session) -> std::io::Result<SubscribeRequest> {
        let record_type = session.record_type();
        if record_type == RecordType::Journal {
            if let Some(partial) = self.sink.partial_journal().await.map_err(std::io::Error::other)? {
                if !partial.payload.is_empty() {
                    info!(nonce = %partial.nonce, offset = partial.payload.len(), "resuming partial journal");
                    lock(&self.prefixes)
                        .insert(session.id(), (partial.nonce.clone(), partial.payload.clone()));
                    return Ok(SubscribeRequest::resume(
                        partial.nonce,
                        partial.payload.len() as u64,
                        Box::new(Cursor::new(partial.payload)),
                    ));
                }
            }
        }
        let last = self.sink.last_nonce(record_type).await.map_err(std::io::Error::other)?;
        Ok(SubscribeRequest::subscribe(last))
    }

    async fn notify_sys_metadata(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        _headers: &Headers,
    ) -> bool {
        let Ok(bytes) = Self::read_segment(data, info.sys_metadata_len).await else {
            return false;
        };
        lock(&self.assemblies).insert(
            session.id(),
            Assembly {
                sys_metadata: bytes,
                ..Assembly::default()
            },
        );
        true
    }

    async fn notify_app_metadata(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        _headers: &Headers,
    ) -> bool {
        let Ok(bytes) = Self::read_segment(data, info.app_metadata_len).await else {
            return false;
        };
        lock(&self.assemblies).entry(session.id()).or_default().app_metadata = bytes;
        true
    }

    async fn notify_payload(
        &self,
        session: &Session,
        info: &RecordInfo,
        data: &mut (dyn AsyncRead + Send + Unpin),
        _headers: &Headers,
    ) -> bool {
        let bytes = match Self::read_segment(data, info.payload_len).await {
            Ok(bytes) => bytes,
            Err((received, _)) => {
                if session.record_type() == RecordType::Journal {
                    self.save_partial(session, info, received).await;
                }
                return false;
            }
        };
        let prefix = self.take_prefix(session, &info.nonce);
        let mut assemblies = lock(&self.assemblies);
        let assembly = assemblies.entry(session.id()).or_default();
        assembly.payload.clear();
        if let Some(prefix) = prefix {
            assembly.payload.extend_from_slice(&prefix);
        }
        assembly.payload.extend_from_slice(&bytes);
        true
    }

    async fn notify_digest(&self, session: &Session, info: &RecordInfo, digest: &DigestValue) -> bool {
        let assembly = lock(&self.assemblies).remove(&session.id());
        let Some(assembly) = assembly else {
            warn!(nonce = %info.nonce, "digest for a record that was never assembled");
            return false;
        };
        let record = StoredRecord::new(
            session.record_type(),
            info.nonce.clone(),
            assembly.sys_metadata,
            assembly.app_metadata,
            assembly.payload.freeze(),
        );
        match self.sink.insert_record(&record, Some(digest)).await {
            Ok(InsertResult::Inserted) => {
                debug!(nonce = %info.nonce, "record stored");
                true
            }
            Ok(InsertResult::AlreadyExists) => {
                debug!(nonce = %info.nonce, "record already stored");
                true
            }
            Err(e) => {
                warn!(nonce = %info.nonce, error = %e, "could not store record");
                false
            }
        }
    }

    async fn notify_digest_response(&self, session: &Session, pairs: &[DigestPair], _headers: &Headers) -> bool {
        for pair in pairs {
            if let Err(e) = self.sink.set_status(session.record_type(), &pair.nonce, pair.status).await {
                warn!(nonce = %pair.nonce, error = %e, "could not store digest status");
            }
        }
        true
    }

    async fn notify_journal_missing(&self, session: &Session, nonce: &Nonce) -> bool {
        lock(&self.prefixes).remove(&session.id());
        if let Err(e) = self.sink.remove_partial(nonce).await {
            warn!(nonce = %nonce, error = %e, "could not drop partial journal");
        }
        true
    }

    async fn on_complete(&self, session: &Session) {
        lock(&self.assemblies).remove(&session.id());
        info!(record_type = %session.record_type(), "publisher finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jalop_core::{record_digest, DigestMethod, Mode, Role, XmlEncoding};
    use jalop_session::{transport::memory::pair, SessionParams};
    use jalop_store::{MemoryRecordStore, RecordSource};

    fn session(record_type: RecordType) -> Session {
        let (a, _b) = pair("x", "y");
        Session::new(
            SessionParams {
                record_type,
                role: Role::Subscriber,
                mode: Mode::Archive,
                digest_method: DigestMethod::Sha256,
                xml_encoding: XmlEncoding::none(),
                initiator: true,
                peer_agent: None,
            },
            Arc::new(a),
        )
    }

    fn nonce(s: &str) -> Nonce {
        Nonce::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_publisher_cursor_follows_subscribe_nonce() {
        let store = Arc::new(MemoryRecordStore::new());
        for n in ["1", "2", "3"] {
            let r = StoredRecord::new(RecordType::Log, nonce(n), "s", "a", "p");
            store.insert_record(&r, None).await.unwrap();
        }
        let publisher = StorePublisher::new(Arc::clone(&store));
        let session = session(RecordType::Log);
        assert!(publisher.on_subscribe(&session, Some(&nonce("1")), &Headers::new()).await);
        let next = publisher.next_record(&session).await.unwrap().unwrap();
        assert_eq!(next.nonce().as_str(), "2");
        let next = publisher.next_record(&session).await.unwrap().unwrap();
        assert_eq!(next.nonce().as_str(), "3");
        assert!(publisher.next_record(&session).await.unwrap().is_none());

        publisher.on_sync(&session, &nonce("3"), &Headers::new()).await;
        assert!(store.record_state(RecordType::Log, &nonce("3")).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_subscriber_resumes_partial_journal() {
        let store = Arc::new(MemoryRecordStore::new());
        let partial = StoredRecord::new(RecordType::Journal, nonce("j"), "s", "a", "0123");
        store.insert_partial(&partial).await.unwrap();
        let subscriber = StoreSubscriber::new(Arc::clone(&store));
        let session = session(RecordType::Journal);

        let request = subscriber.get_subscribe_request(&session).await.unwrap();
        assert_eq!(request.nonce, Some(nonce("j")));
        assert_eq!(request.offset, 4);

        let info = RecordInfo::new(nonce("j"), 1, 1, 2);
        let h = Headers::new();
        assert!(subscriber.notify_sys_metadata(&session, &info, &mut &b"s"[..], &h).await);
        assert!(subscriber.notify_app_metadata(&session, &info, &mut &b"a"[..], &h).await);
        assert!(subscriber.notify_payload(&session, &info, &mut &b"45"[..], &h).await);
        let digest = record_digest(DigestMethod::Sha256, b"s", b"a", b"012345");
        assert!(subscriber.notify_digest(&session, &info, &digest).await);

        let stored = store.get_record(RecordType::Journal, &nonce("j")).await.unwrap().unwrap();
        assert_eq!(&stored.payload[..], b"012345");
        assert!(store.partial_journal().await.unwrap().is_none());
    }

    struct Interrupted;

    impl AsyncRead for Interrupted {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "channel closed mid-frame",
            )))
        }
    }

    #[tokio::test]
    async fn test_interrupted_journal_kept_as_partial() {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .insert_partial(&StoredRecord::new(RecordType::Journal, nonce("j"), "s", "a", "01"))
            .await
            .unwrap();
        let subscriber = StoreSubscriber::new(Arc::clone(&store));
        let session = session(RecordType::Journal);
        subscriber.get_subscribe_request(&session).await.unwrap();

        let info = RecordInfo::new(nonce("j"), 1, 1, 8);
        let h = Headers::new();
        assert!(subscriber.notify_sys_metadata(&session, &info, &mut &b"s"[..], &h).await);
        assert!(subscriber.notify_app_metadata(&session, &info, &mut &b"a"[..], &h).await);
        let mut cut = (&b"23"[..]).chain(Interrupted);
        assert!(!subscriber.notify_payload(&session, &info, &mut cut, &h).await);

        let partial = store.partial_journal().await.unwrap().unwrap();
        assert_eq!(partial.nonce, nonce("j"));
        assert_eq!(&partial.payload[..], b"0123");
        assert_eq!(&partial.sys_metadata[..], b"s");
        assert!(store.get_record(RecordType::Journal, &nonce("j")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_log_record_not_kept() {
        let store = Arc::new(MemoryRecordStore::new());
        let subscriber = StoreSubscriber::new(Arc::clone(&store));
        let session = session(RecordType::Log);
        let info = RecordInfo::new(nonce("l"), 1, 1, 8);
        let h = Headers::new();
        assert!(subscriber.notify_sys_metadata(&session, &info, &mut &b"s"[..], &h).await);
        assert!(subscriber.notify_app_metadata(&session, &info, &mut &b"a"[..], &h).await);
        let mut cut = (&b"23"[..]).chain(Interrupted);
        assert!(!subscriber.notify_payload(&session, &info, &mut cut, &h).await);
        assert!(store.record_state(RecordType::Log, &nonce("l")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_continues_after_last_record() {
        let store = Arc::new(MemoryRecordStore::new());
        let r = StoredRecord::new(RecordType::Audit, nonce("7"), "s", "a", "p");
        store.insert_record(&r, None).await.unwrap();
        let subscriber = StoreSubscriber::new(Arc::clone(&store));
        let request = subscriber.get_subscribe_request(&session(RecordType::Audit)).await.unwrap();
        assert_eq!(request.nonce, Some(nonce("7")));
        assert_eq!(request.offset, 0);
    }
}

//! Channel abstraction for JALoP sessions.
//!
//! A channel carries frames in both directions between two peers. Record
//! bodies may be large, so outgoing bodies are written through a
//! [`BodyWriter`] that can be aborted half way, and incoming bodies can be
//! read as they arrive through [`Channel::recv_streaming`]. Implementations
//! may sit on TCP, HTTP or anything else.

use std::io::{Cursor, ErrorKind};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use jalop_wire::{FrameKind, Headers, Message, MessageType};

use crate::error::{Result, SessionError};

/// Process-unique channel identifier.
pub type ChannelId = u64;

/// A bidirectional frame channel to one peer.
///
/// Implementations must be thread-safe: a session's reader and writer tasks
/// share one channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Address of the remote peer, used for policy checks and logs.
    fn peer_addr(&self) -> &str;

    /// False once either end has closed the channel.
    fn is_active(&self) -> bool;

    /// Send one complete frame.
    async fn send(&self, message: Message) -> Result<()>;

    /// Begin a frame whose body is written incrementally.
    async fn start_body(&self, kind: FrameKind, headers: Headers) -> Result<Box<dyn BodyWriter>>;

    /// Receive the next frame.
    ///
    /// Fails with [`SessionError::Closed`] once the channel is closed and no
    /// frames remain queued.
    async fn recv(&self) -> Result<Message>;

    /// Receive the next frame as soon as its headers are in.
    ///
    /// The body must be read to the end (or dropped) before the next call.
    async fn recv_streaming(&self) -> Result<IncomingFrame> {
        Ok(IncomingFrame::buffered(self.recv().await?))
    }

    /// Receive with timeout. Returns `None` if it expires first.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>>;

    /// Close both directions. Idempotent.
    async fn close(&self);
}

/// Incremental writer for one outgoing frame body.
#[async_trait]
pub trait BodyWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Complete the frame.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Abandon the frame and send an `ERR` reply with `reason` instead.
    async fn abort(self: Box<Self>, reason: &str) -> Result<()>;
}

/// A received frame whose body may still be in transit.
///
/// Reading `body` fails with [`ErrorKind::ConnectionAborted`] when the
/// sender abandoned the frame, and with [`ErrorKind::UnexpectedEof`] when
/// the channel went away before the frame ended.
pub struct IncomingFrame {
    pub kind: FrameKind,
    pub headers: Headers,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl IncomingFrame {
    /// Wrap a frame that has already arrived in full.
    pub fn buffered(message: Message) -> Self {
        Self {
            kind: message.kind,
            headers: message.headers,
            body: Box::new(Cursor::new(message.body)),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.headers.get(jalop_wire::names::MESSAGE).and_then(MessageType::parse)
    }

    /// Wait for the whole body. An abandoned frame reads as the `ERR` frame
    /// the sender replaced it with.
    pub async fn into_message(mut self) -> Result<Message> {
        let mut body = Vec::new();
        match self.body.read_to_end(&mut body).await {
            Ok(_) => Ok(Message {
                kind: self.kind,
                headers: self.headers,
                body: Bytes::from(body),
            }),
            Err(e) if e.kind() == ErrorKind::ConnectionAborted => Ok(Message::error(e.to_string())),
            Err(e) => Err(body_error(e)),
        }
    }
}

/// Map a failed body read: losing the channel mid-frame is a close.
pub(crate) fn body_error(e: std::io::Error) -> SessionError {
    match e.kind() {
        ErrorKind::UnexpectedEof => SessionError::Closed,
        _ => SessionError::Io(e),
    }
}

/// In-memory channels for tests and single-process deployments.
///
/// Frames are serialized to bytes and parsed again on receipt so the full
/// wire format is exercised. Streamed bodies travel through an in-memory
/// pipe, so the receiver sees them while the sender is still writing.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::task::{Context, Poll};

    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::sync::{mpsc, watch, RwLock};

    const QUEUE_DEPTH: usize = 1024;
    const BODY_BUFFER: usize = 64 * 1024;

    static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A network of named listeners that connectors can dial.
    pub struct MemoryNetwork {
        listeners: RwLock<HashMap<String, mpsc::Sender<MemoryChannel>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Register a listener at `addr`, replacing any previous one.
        pub async fn listen(&self, addr: &str) -> MemoryListener {
            let (tx, rx) = mpsc::channel(64);
            self.listeners.write().await.insert(addr.to_string(), tx);
            MemoryListener {
                addr: addr.to_string(),
                incoming: rx,
            }
        }

        /// Open a channel from `local_addr` to the listener at `remote_addr`.
        pub async fn connect(&self, local_addr: &str, remote_addr: &str) -> Result<MemoryChannel> {
            let listener = self
                .listeners
                .read()
                .await
                .get(remote_addr)
                .cloned()
                .ok_or_else(|| SessionError::Transport(format!("no listener at {remote_addr}")))?;
            let (ours, theirs) = pair(remote_addr, local_addr);
            listener
                .send(theirs)
                .await
                .map_err(|_| SessionError::Transport(format!("listener at {remote_addr} is gone")))?;
            Ok(ours)
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                listeners: RwLock::new(HashMap::new()),
            }
        }
    }

    /// Accepting end of a [`MemoryNetwork`] address.
    pub struct MemoryListener {
        addr: String,
        incoming: mpsc::Receiver<MemoryChannel>,
    }

    impl MemoryListener {
        pub fn local_addr(&self) -> &str {
            &self.addr
        }

        /// Wait for the next inbound channel. `None` once the network is dropped.
        pub async fn accept(&mut self) -> Option<MemoryChannel> {
            self.incoming.recv().await
        }
    }

    /// Create two connected channels.
    ///
    /// `a` sees `a_peer` as its peer address and `b` sees `b_peer`.
    pub fn pair(a_peer: &str, b_peer: &str) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let a = MemoryChannel::new(a_peer, a_tx, a_rx, Arc::clone(&closed));
        let b = MemoryChannel::new(b_peer, b_tx, b_rx, closed);
        (a, b)
    }

    /// What travels through the queue: a whole frame, or a frame head
    /// whose body follows through a pipe.
    enum Piece {
        Frame(Bytes),
        Streamed { head: Bytes, body: MemoryBodyReader },
    }

    /// One end of an in-memory channel.
    pub struct MemoryChannel {
        id: ChannelId,
        peer_addr: String,
        tx: Mutex<Option<mpsc::Sender<Piece>>>,
        rx: tokio::sync::Mutex<mpsc::Receiver<Piece>>,
        closed: Arc<watch::Sender<bool>>,
    }

    impl MemoryChannel {
        fn new(
            peer_addr: &str,
            tx: mpsc::Sender<Piece>,
            rx: mpsc::Receiver<Piece>,
            closed: Arc<watch::Sender<bool>>,
        ) -> Self {
            Self {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr: peer_addr.to_string(),
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed,
            }
        }

        fn sender(&self) -> Result<mpsc::Sender<Piece>> {
            if *self.closed.borrow() {
                return Err(SessionError::Closed);
            }
            lock(&self.tx).clone().ok_or(SessionError::Closed)
        }
    }

    async fn deliver(tx: &mpsc::Sender<Piece>, piece: Piece) -> Result<()> {
        tx.send(piece)
            .await
            .map_err(|_| SessionError::Transport("peer disconnected".into()))
    }

    #[async_trait]
    impl Channel for MemoryChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn peer_addr(&self) -> &str {
            &self.peer_addr
        }

        fn is_active(&self) -> bool {
            !*self.closed.borrow()
        }

        async fn send(&self, message: Message) -> Result<()> {
            let tx = self.sender()?;
            deliver(&tx, Piece::Frame(message.to_bytes())).await
        }

        async fn start_body(&self, kind: FrameKind, headers: Headers) -> Result<Box<dyn BodyWriter>> {
            let tx = self.sender()?;
            let (reader, writer) = tokio::io::duplex(BODY_BUFFER);
            let end = Arc::new(Mutex::new(BodyEnd::Open));
            let body = MemoryBodyReader::new(reader, Arc::clone(&end), self.closed.subscribe());
            let head = Message::head_bytes(kind, &headers).freeze();
            deliver(&tx, Piece::Streamed { head, body }).await?;
            Ok(Box::new(MemoryBodyWriter {
                pipe: writer,
                end,
                closed: Arc::clone(&self.closed),
            }))
        }

        async fn recv(&self) -> Result<Message> {
            self.recv_streaming().await?.into_message().await
        }

        async fn recv_streaming(&self) -> Result<IncomingFrame> {
            let mut closed = self.closed.subscribe();
            let mut rx = self.rx.lock().await;
            // Queued frames are still delivered after close.
            let piece = tokio::select! {
                biased;
                piece = rx.recv() => piece,
                _ = closed.wait_for(|c| *c) => rx.try_recv().ok(),
            };
            match piece {
                Some(Piece::Frame(bytes)) => Ok(IncomingFrame::buffered(Message::parse(bytes)?)),
                Some(Piece::Streamed { head, body }) => {
                    let head = Message::parse(head)?;
                    Ok(IncomingFrame {
                        kind: head.kind,
                        headers: head.headers,
                        body: Box::new(body),
                    })
                }
                None => Err(SessionError::Closed),
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
            match tokio::time::timeout(timeout, self.recv()).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            }
        }

        async fn close(&self) {
            self.closed.send_replace(true);
            lock(&self.tx).take();
        }
    }

    /// How the sending side left a streamed body.
    enum BodyEnd {
        Open,
        Finished,
        Aborted(String),
    }

    struct MemoryBodyReader {
        pipe: DuplexStream,
        end: Arc<Mutex<BodyEnd>>,
        /// Resolves when the channel closes. `None` once it has.
        closed: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    }

    impl MemoryBodyReader {
        fn new(pipe: DuplexStream, end: Arc<Mutex<BodyEnd>>, mut closed: watch::Receiver<bool>) -> Self {
            Self {
                pipe,
                end,
                closed: Some(Box::pin(async move {
                    let _ = closed.wait_for(|c| *c).await;
                })),
            }
        }
    }

    impl AsyncRead for MemoryBodyReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let this = &mut *self;
            let before = buf.filled().len();
            match Pin::new(&mut this.pipe).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => {
                    // The writer is gone; how it left decides what EOF means.
                    Poll::Ready(match &*lock(&this.end) {
                        BodyEnd::Finished => Ok(()),
                        BodyEnd::Aborted(reason) => {
                            Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone()))
                        }
                        BodyEnd::Open => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "frame abandoned before its end",
                        )),
                    })
                }
                Poll::Pending => {
                    let closed = match this.closed.as_mut() {
                        Some(closed) => closed.as_mut().poll(cx).is_ready(),
                        None => true,
                    };
                    if !closed {
                        return Poll::Pending;
                    }
                    this.closed = None;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed mid-frame",
                    )))
                }
                ready => ready,
            }
        }
    }

    struct MemoryBodyWriter {
        pipe: DuplexStream,
        end: Arc<Mutex<BodyEnd>>,
        closed: Arc<watch::Sender<bool>>,
    }

    impl MemoryBodyWriter {
        fn check_open(&self) -> Result<()> {
            if *self.closed.borrow() {
                return Err(SessionError::Closed);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BodyWriter for MemoryBodyWriter {
        async fn write_all(&mut self, data: &[u8]) -> Result<()> {
            let mut closed = self.closed.subscribe();
            tokio::select! {
                written = self.pipe.write_all(data) => {
                    written.map_err(|_| SessionError::Transport("peer stopped reading the frame".into()))
                }
                _ = closed.wait_for(|c| *c) => Err(SessionError::Closed),
            }
        }

        async fn finish(self: Box<Self>) -> Result<()> {
            self.check_open()?;
            *lock(&self.end) = BodyEnd::Finished;
            Ok(())
        }

        async fn abort(self: Box<Self>, reason: &str) -> Result<()> {
            self.check_open()?;
            *lock(&self.end) = BodyEnd::Aborted(reason.to_string());
            Ok(())
        }
    }
}

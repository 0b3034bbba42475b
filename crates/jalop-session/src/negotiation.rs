//! Channel negotiation: `init` followed by `init-ack` or `init-nack`.
//!
//! The listening side intersects the peer's preference lists with its own
//! capabilities, asks the application's [`ConnectionHandler`] for a verdict
//! and either builds an active [`Session`] or replies with every applicable
//! rejection. The connecting side sends `init` and waits for the reply.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use jalop_core::{ConnectError, DigestMethod, Mode, RecordType, Role, XmlEncoding};
use jalop_wire::{
    FrameKind, Headers, InitAck, InitMessage, InitNack, Message, MessageType, WireMessage,
    PROTOCOL_VERSION,
};

use crate::error::{Result, SessionError};
use crate::session::{Session, SessionParams};
use crate::transport::Channel;

/// Protocol versions this node accepts in `init`.
pub const SUPPORTED_VERSIONS: &[&str] = &[PROTOCOL_VERSION];

/// Local negotiation capabilities and preferences.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Supported encodings, most preferred first.
    pub encodings: Vec<XmlEncoding>,
    /// Supported digests, most preferred first.
    pub digests: Vec<DigestMethod>,
    /// Sent as `JAL-Agent` when initiating.
    pub agent: Option<String>,
    /// How long an initiator waits for the reply to `init`.
    pub message_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            encodings: vec![XmlEncoding::none()],
            digests: vec![DigestMethod::Sha256],
            agent: None,
            message_timeout: Duration::from_secs(30),
        }
    }
}

impl NegotiationConfig {
    /// Check the lists are non-empty and the timeout positive.
    pub fn validate(&self) -> Result<()> {
        if self.encodings.is_empty() {
            return Err(SessionError::InvalidArgument("no encodings configured".into()));
        }
        if self.digests.is_empty() {
            return Err(SessionError::InvalidArgument("no digests configured".into()));
        }
        if self.message_timeout.is_zero() {
            return Err(SessionError::InvalidArgument("message timeout must be positive".into()));
        }
        Ok(())
    }
}

/// A peer's negotiation proposal as seen by the connection policy.
///
/// `role` and `mode` are what the peer asked for: a `Subscriber` role means
/// the peer wants to subscribe from us.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub peer_addr: String,
    pub record_type: RecordType,
    pub version: String,
    /// The peer's encodings in its order of preference.
    pub encodings: Vec<String>,
    /// The peer's digests in its order of preference.
    pub digests: Vec<String>,
    pub role: Role,
    pub mode: Mode,
    pub agent: Option<String>,
    pub other_headers: Headers,
    selected_encoding: Option<XmlEncoding>,
    selected_digest: Option<DigestMethod>,
    reject: bool,
}

impl ConnectionRequest {
    /// A request from `peer_addr` at the current protocol version with
    /// default encoding and digest proposals.
    pub fn new(peer_addr: impl Into<String>, role: Role, mode: Mode, record_type: RecordType) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            record_type,
            version: PROTOCOL_VERSION.to_string(),
            encodings: vec![XmlEncoding::DEFAULT.to_string()],
            digests: vec![DigestMethod::Sha256.name().to_string()],
            role,
            mode,
            agent: None,
            other_headers: Headers::new(),
            selected_encoding: None,
            selected_digest: None,
            reject: false,
        }
    }

    fn from_init(init: &InitMessage, peer_addr: &str) -> Self {
        Self {
            peer_addr: peer_addr.to_string(),
            record_type: init.record_type,
            version: init.version.clone(),
            encodings: init.accept_encodings.clone(),
            digests: init.accept_digests.clone(),
            role: init.role,
            mode: init.mode,
            agent: init.agent.clone(),
            other_headers: init.other_headers.clone(),
            selected_encoding: None,
            selected_digest: None,
            reject: false,
        }
    }

    pub fn selected_encoding(&self) -> Option<&XmlEncoding> {
        self.selected_encoding.as_ref()
    }

    pub fn selected_digest(&self) -> Option<DigestMethod> {
        self.selected_digest
    }

    /// True when the engine already found a reason to reject.
    pub fn reject(&self) -> bool {
        self.reject
    }

    /// Override the encoding. It must be one the peer proposed.
    pub fn set_selected_encoding(&mut self, encoding: XmlEncoding) -> Result<()> {
        if !self.encodings.iter().any(|e| e.eq_ignore_ascii_case(encoding.as_str())) {
            return Err(SessionError::InvalidArgument(format!(
                "encoding {encoding} was not proposed by the peer"
            )));
        }
        self.selected_encoding = Some(encoding);
        Ok(())
    }

    /// Override the digest. It must be one the peer proposed.
    pub fn set_selected_digest(&mut self, digest: DigestMethod) -> Result<()> {
        if !self.digests.iter().any(|d| digest.matches(d)) {
            return Err(SessionError::InvalidArgument(format!(
                "digest {digest} was not proposed by the peer"
            )));
        }
        self.selected_digest = Some(digest);
        Ok(())
    }
}

/// Application connection policy.
///
/// Evaluation is synchronous and must be bounded. The handler may override
/// the selected encoding or digest. Returning anything besides an empty set
/// or `{Accept}` rejects the connection.
pub trait ConnectionHandler: Send + Sync {
    fn handle_connection_request(&self, request: &mut ConnectionRequest) -> BTreeSet<ConnectError>;
}

/// Accept whatever the engine could match.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ConnectionHandler for AcceptAll {
    fn handle_connection_request(&self, _request: &mut ConnectionRequest) -> BTreeSet<ConnectError> {
        BTreeSet::new()
    }
}

/// Runs both sides of the `init` exchange.
pub struct Negotiator {
    config: NegotiationConfig,
    handler: Arc<dyn ConnectionHandler>,
    local_roles: Vec<Role>,
}

impl Negotiator {
    /// `local_roles` are the roles the application registered handlers for.
    pub fn new(
        config: NegotiationConfig,
        handler: Arc<dyn ConnectionHandler>,
        local_roles: Vec<Role>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handler,
            local_roles,
        })
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    /// Answer the peer's `init` on a freshly accepted channel.
    ///
    /// Malformed `init` gets an `ERR` reply. A rejection gets an `init-nack`
    /// and returns [`SessionError::Rejected`].
    pub async fn accept(&self, channel: Arc<dyn Channel>) -> Result<Arc<Session>> {
        let Some(message) = channel.recv_timeout(self.config.message_timeout).await? else {
            warn!(peer = %channel.peer_addr(), "no init before timeout");
            channel.close().await;
            return Err(SessionError::Timeout("waiting for init".into()));
        };
        let init = match InitMessage::decode(&message) {
            Ok(init) => init,
            Err(e) => {
                warn!(peer = %channel.peer_addr(), error = %e, "malformed init");
                channel.send(Message::error(e.to_string())).await?;
                return Err(e.into());
            }
        };

        let mut request = ConnectionRequest::from_init(&init, channel.peer_addr());
        let errors = self.evaluate(&mut request);

        if ConnectError::rejects(&errors) {
            let errors: BTreeSet<_> = errors.into_iter().filter(|e| *e != ConnectError::Accept).collect();
            info!(
                peer = %request.peer_addr,
                record_type = %request.record_type,
                ?errors,
                "rejecting connection"
            );
            channel.send(InitNack::new(errors.clone())?.encode()?).await?;
            return Err(SessionError::Rejected(errors));
        }

        let (Some(digest), Some(encoding)) = (request.selected_digest, request.selected_encoding.clone()) else {
            return Err(SessionError::InvalidArgument("negotiation left no selection".into()));
        };
        channel.send(InitAck::new(digest, encoding.clone()).encode()?).await?;

        let session = Session::new(
            SessionParams {
                record_type: init.record_type,
                role: init.role,
                mode: init.mode,
                digest_method: digest,
                xml_encoding: encoding,
                initiator: false,
                peer_agent: init.agent,
            },
            channel,
        );
        session.activate()?;
        info!(parent: session.span(), digest = %digest, encoding = %session.xml_encoding(), "session accepted");
        Ok(Arc::new(session))
    }

    /// Compute the rejection set for a request, consulting the handler.
    fn evaluate(&self, request: &mut ConnectionRequest) -> BTreeSet<ConnectError> {
        let mut errors = BTreeSet::new();

        let needed = request.role.opposite();
        if !self.local_roles.contains(&needed) {
            errors.insert(ConnectError::UnsupportedMode);
        }
        if !SUPPORTED_VERSIONS.contains(&request.version.as_str()) {
            errors.insert(ConnectError::UnsupportedVersion);
        }

        request.selected_encoding = request.encodings.iter().find_map(|proposed| {
            self.config
                .encodings
                .iter()
                .find(|local| local.as_str().eq_ignore_ascii_case(proposed))
                .cloned()
        });
        if request.selected_encoding.is_none() {
            errors.insert(ConnectError::UnsupportedEncoding);
        }

        request.selected_digest = request
            .digests
            .iter()
            .find_map(|proposed| self.config.digests.iter().copied().find(|local| local.matches(proposed)));
        if request.selected_digest.is_none() {
            errors.insert(ConnectError::UnsupportedDigest);
        }

        request.reject = !errors.is_empty();
        debug!(
            peer = %request.peer_addr,
            encoding = ?request.selected_encoding,
            digest = ?request.selected_digest,
            "matched proposal"
        );

        let handler = Arc::clone(&self.handler);
        match catch_unwind(AssertUnwindSafe(|| handler.handle_connection_request(request))) {
            Ok(verdict) => errors.extend(verdict),
            Err(_) => {
                warn!(peer = %request.peer_addr, "connection handler panicked; rejecting");
                errors.insert(ConnectError::UnauthorizedMode);
            }
        }
        if request.selected_encoding.is_none() {
            errors.insert(ConnectError::UnsupportedEncoding);
        }
        if request.selected_digest.is_none() {
            errors.insert(ConnectError::UnsupportedDigest);
        }
        errors
    }

    /// Send `init` for `record_type` as `role` and wait for the reply.
    pub async fn connect(
        &self,
        channel: Arc<dyn Channel>,
        role: Role,
        mode: Mode,
        record_type: RecordType,
    ) -> Result<Arc<Session>> {
        let init = InitMessage::new(
            role,
            mode,
            record_type,
            self.config.encodings.iter().map(|e| e.as_str().to_string()).collect(),
            self.config.digests.iter().map(|d| d.name().to_string()).collect(),
            self.config.agent.clone(),
        )?;
        channel.send(init.encode()?).await?;

        let reply = channel
            .recv_timeout(self.config.message_timeout)
            .await?
            .ok_or_else(|| SessionError::Timeout("waiting for init reply".into()))?;

        if reply.kind == FrameKind::Err {
            return Err(SessionError::PeerError(reply.error_reason()));
        }
        match reply.message_type() {
            Some(MessageType::InitAck) => {}
            Some(MessageType::InitNack) => {
                let nack = InitNack::decode(&reply)?;
                info!(peer = %channel.peer_addr(), errors = ?nack.errors, "connection rejected by peer");
                return Err(SessionError::Rejected(nack.errors));
            }
            other => {
                return Err(SessionError::PeerError(format!(
                    "expected init-ack or init-nack, got {other:?}"
                )));
            }
        }

        let ack = InitAck::decode(&reply)?;
        if !self.config.digests.contains(&ack.digest) {
            return Err(SessionError::PeerError(format!("peer selected unoffered digest {}", ack.digest)));
        }
        if !self.config.encodings.contains(&ack.encoding) {
            return Err(SessionError::PeerError(format!(
                "peer selected unoffered encoding {}",
                ack.encoding
            )));
        }

        let session = Session::new(
            SessionParams {
                record_type,
                role,
                mode,
                digest_method: ack.digest,
                xml_encoding: ack.encoding,
                initiator: true,
                peer_agent: None,
            },
            channel,
        );
        session.activate()?;
        info!(parent: session.span(), "session established");
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::transport::memory::pair;
    use jalop_wire::names;

    fn negotiator(encodings: &[&str], digests: &[DigestMethod], roles: Vec<Role>) -> Negotiator {
        negotiator_with(encodings, digests, roles, Arc::new(AcceptAll))
    }

    fn negotiator_with(
        encodings: &[&str],
        digests: &[DigestMethod],
        roles: Vec<Role>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Negotiator {
        let config = NegotiationConfig {
            encodings: encodings.iter().map(|e| XmlEncoding::new(*e).unwrap()).collect(),
            digests: digests.to_vec(),
            ..NegotiationConfig::default()
        };
        Negotiator::new(config, handler, roles).unwrap()
    }

    fn init(role: Role, mode: Mode, rt: RecordType, enc: &[&str], dig: &[&str]) -> Message {
        InitMessage::new(
            role,
            mode,
            rt,
            enc.iter().map(|s| s.to_string()).collect(),
            dig.iter().map(|s| s.to_string()).collect(),
            None,
        )
        .unwrap()
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_init() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none", "binary"], &[DigestMethod::Sha256], vec![Role::Publisher, Role::Subscriber]);
        peer.send(init(Role::Subscriber, Mode::Live, RecordType::Log, &["binary"], &["sha256"]))
            .await
            .unwrap();

        let session = n.accept(Arc::new(local)).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.role(), Role::Subscriber);
        assert_eq!(session.mode(), Mode::Live);
        assert_eq!(session.record_type(), RecordType::Log);
        assert_eq!(session.local_role(), Role::Publisher);

        let reply = peer.recv().await.unwrap();
        let ack = InitAck::decode(&reply).unwrap();
        assert_eq!(ack.digest, DigestMethod::Sha256);
        assert_eq!(ack.encoding.as_str(), "binary");
    }

    #[tokio::test]
    async fn test_digest_follows_peer_preference() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none"], &[DigestMethod::Sha384, DigestMethod::Sha256], vec![Role::Publisher]);
        peer.send(init(Role::Subscriber, Mode::Archive, RecordType::Audit, &[], &["sha512", "sha256"]))
            .await
            .unwrap();
        let session = n.accept(Arc::new(local)).await.unwrap();
        assert_eq!(session.digest_method(), DigestMethod::Sha256);
    }

    #[tokio::test]
    async fn test_rejection_lists_every_error() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Subscriber]);
        peer.send(init(Role::Subscriber, Mode::Live, RecordType::Journal, &["xml"], &["md5"]))
            .await
            .unwrap();
        let err = n.accept(Arc::new(local)).await.unwrap_err();
        let expected: BTreeSet<_> = [
            ConnectError::UnsupportedEncoding,
            ConnectError::UnsupportedDigest,
            ConnectError::UnsupportedMode,
        ]
        .into_iter()
        .collect();
        assert!(matches!(&err, SessionError::Rejected(e) if *e == expected));

        let nack = InitNack::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(nack.errors, expected);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher]);
        let mut msg = init(Role::Subscriber, Mode::Live, RecordType::Log, &[], &[]);
        msg.headers.insert(names::VERSION, "9.9").unwrap();
        peer.send(msg).await.unwrap();
        let err = n.accept(Arc::new(local)).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(e) if e.contains(&ConnectError::UnsupportedVersion)));
    }

    struct Panicky;

    impl ConnectionHandler for Panicky {
        fn handle_connection_request(&self, _request: &mut ConnectionRequest) -> BTreeSet<ConnectError> {
            panic!("policy bug");
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_rejection() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator_with(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher], Arc::new(Panicky));
        peer.send(init(Role::Subscriber, Mode::Live, RecordType::Log, &[], &[]))
            .await
            .unwrap();
        let err = n.accept(Arc::new(local)).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(e) if e.contains(&ConnectError::UnauthorizedMode)));
    }

    struct PreferBinary;

    impl ConnectionHandler for PreferBinary {
        fn handle_connection_request(&self, request: &mut ConnectionRequest) -> BTreeSet<ConnectError> {
            let mut out = BTreeSet::new();
            if request.set_selected_encoding(XmlEncoding::new("binary").unwrap()).is_err() {
                out.insert(ConnectError::UnsupportedEncoding);
            }
            // Not proposed, must be refused.
            assert!(request.set_selected_digest(DigestMethod::Sha512).is_err());
            out.insert(ConnectError::Accept);
            out
        }
    }

    #[tokio::test]
    async fn test_handler_overrides_selection() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator_with(
            &["none", "binary"],
            &[DigestMethod::Sha256],
            vec![Role::Subscriber],
            Arc::new(PreferBinary),
        );
        peer.send(init(Role::Publisher, Mode::Archive, RecordType::Log, &["none", "binary"], &["sha256"]))
            .await
            .unwrap();
        let session = n.accept(Arc::new(local)).await.unwrap();
        assert_eq!(session.xml_encoding().as_str(), "binary");
        assert_eq!(session.local_role(), Role::Subscriber);
    }

    #[tokio::test]
    async fn test_malformed_init_gets_error_frame() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher]);
        let mut msg = Message::new(MessageType::Init);
        msg.headers.insert(names::DATA_CLASS, "log").unwrap();
        peer.send(msg).await.unwrap();
        assert!(matches!(n.accept(Arc::new(local)).await, Err(SessionError::Wire(_))));
        assert_eq!(peer.recv().await.unwrap().kind, FrameKind::Err);
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (client, server) = pair("server", "client");
        let client_side = negotiator(&["none"], &[DigestMethod::Sha512, DigestMethod::Sha256], vec![Role::Publisher]);
        let server_side = negotiator(&["none"], &[DigestMethod::Sha256, DigestMethod::Sha512], vec![Role::Subscriber]);

        let server = tokio::spawn(async move { server_side.accept(Arc::new(server)).await });
        let session = client_side
            .connect(Arc::new(client), Role::Publisher, Mode::Archive, RecordType::Journal)
            .await
            .unwrap();
        let remote = server.await.unwrap().unwrap();

        assert_eq!(session.digest_method(), DigestMethod::Sha512);
        assert_eq!(remote.digest_method(), DigestMethod::Sha512);
        assert_eq!(session.local_role(), Role::Publisher);
        assert_eq!(remote.local_role(), Role::Subscriber);
    }

    #[tokio::test]
    async fn test_connect_sees_rejection() {
        let (client, server) = pair("server", "client");
        let client_side = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher]);
        let server_side = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher]);
        let server = tokio::spawn(async move { server_side.accept(Arc::new(server)).await });
        let err = client_side
            .connect(Arc::new(client), Role::Publisher, Mode::Live, RecordType::Audit)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Rejected(e) if e.contains(&ConnectError::UnsupportedMode)));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let (client, _server) = pair("server", "client");
        let n = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Publisher]);
        let err = n
            .connect(Arc::new(client), Role::Publisher, Mode::Live, RecordType::Log)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_times_out_on_silent_peer() {
        let (local, peer) = pair("peer", "local");
        let n = negotiator(&["none"], &[DigestMethod::Sha256], vec![Role::Subscriber]);
        let deadline = n.config().message_timeout * 10;
        let err = tokio::time::timeout(deadline, n.accept(Arc::new(local)))
            .await
            .expect("accept must give up on a silent peer")
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(!peer.is_active());
    }
}

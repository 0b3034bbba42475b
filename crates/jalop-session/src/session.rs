//! Negotiated sessions.
//!
//! A session is one logical channel carrying one record type between two
//! peers. Everything negotiated at handshake time is fixed for its lifetime;
//! only the state moves:
//!
//! ```text
//! Negotiating --activate--> Active --set_errored--> Errored
//!      |                      |
//!      +------ mark_closed ---+-------------------> Closed
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info_span, Span};

use jalop_core::{DigestMethod, Mode, RecordType, Role, XmlEncoding};

use crate::error::{Result, SessionError};
use crate::transport::{Channel, ChannelId};

/// Random identifier for one session, used in logs.
pub type SessionId = u64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Active,
    Errored,
    Closed,
}

impl SessionState {
    /// True for `Errored` and `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Errored | SessionState::Closed)
    }
}

/// Parameters settled by negotiation.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub record_type: RecordType,
    /// Role named by the negotiated `JAL-Mode`, i.e. the initiator's role.
    pub role: Role,
    pub mode: Mode,
    pub digest_method: DigestMethod,
    pub xml_encoding: XmlEncoding,
    /// True on the side that sent `init`.
    pub initiator: bool,
    pub peer_agent: Option<String>,
}

/// One negotiated session.
pub struct Session {
    id: SessionId,
    params: SessionParams,
    channel: Arc<dyn Channel>,
    state: watch::Sender<SessionState>,
    span: Span,
}

impl Session {
    /// Create a session in the `Negotiating` state.
    pub fn new(params: SessionParams, channel: Arc<dyn Channel>) -> Self {
        let id = rand::random::<SessionId>();
        let span = info_span!(
            "session",
            id = %format!("{id:016x}"),
            record_type = %params.record_type,
            role = %params.role,
            local_role = %local_role(&params),
            peer = %channel.peer_addr(),
        );
        let (state, _) = watch::channel(SessionState::Negotiating);
        Self {
            id,
            params,
            channel,
            state,
            span,
        }
    }

    /// Move from `Negotiating` to `Active`.
    ///
    /// Fails if the mode is still unset, the channel is gone or the session
    /// already left `Negotiating`.
    pub fn activate(&self) -> Result<()> {
        if !self.params.mode.is_set() {
            return Err(SessionError::InvalidArgument(
                "session mode must be set before activation".into(),
            ));
        }
        if !self.channel.is_active() {
            return Err(SessionError::Closed);
        }
        let mut moved = false;
        self.state.send_if_modified(|s| {
            if *s == SessionState::Negotiating {
                *s = SessionState::Active;
                moved = true;
            }
            moved
        });
        if moved {
            Ok(())
        } else {
            Err(SessionError::InvalidArgument(format!(
                "cannot activate a session in state {:?}",
                self.state()
            )))
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn record_type(&self) -> RecordType {
        self.params.record_type
    }

    /// Role named by the negotiated mode.
    pub fn role(&self) -> Role {
        self.params.role
    }

    /// Role this side plays: the negotiated role if we initiated, otherwise
    /// its opposite.
    pub fn local_role(&self) -> Role {
        local_role(&self.params)
    }

    pub fn is_initiator(&self) -> bool {
        self.params.initiator
    }

    pub fn mode(&self) -> Mode {
        self.params.mode
    }

    pub fn digest_method(&self) -> DigestMethod {
        self.params.digest_method
    }

    pub fn xml_encoding(&self) -> &XmlEncoding {
        &self.params.xml_encoding
    }

    pub fn peer_agent(&self) -> Option<&str> {
        self.params.peer_agent.as_deref()
    }

    pub fn peer_addr(&self) -> &str {
        self.channel.peer_addr()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The single liveness check every per-record operation makes.
    pub fn is_ok(&self) -> bool {
        self.state() == SessionState::Active && self.channel.is_active()
    }

    /// Tracing span carrying this session's identity.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Mark the session failed and close its channel. One way.
    pub async fn set_errored(&self) {
        let changed = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = SessionState::Errored;
                true
            }
        });
        if changed {
            tracing::warn!(parent: &self.span, "session errored");
        }
        self.channel.close().await;
    }

    /// Record transport teardown. An errored session stays errored.
    pub fn mark_closed(&self) {
        let changed = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = SessionState::Closed;
                true
            }
        });
        if changed {
            tracing::debug!(parent: &self.span, "session closed");
        }
    }

    /// Close the channel and mark the session closed.
    pub async fn close(&self) {
        self.channel.close().await;
        self.mark_closed();
    }

    /// Resolves once the session reaches `Errored` or `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only ends by matching.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

fn local_role(params: &SessionParams) -> Role {
    if params.initiator {
        params.role
    } else {
        params.role.opposite()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &format_args!("{:016x}", self.id))
            .field("record_type", &self.params.record_type)
            .field("role", &self.params.role)
            .field("mode", &self.params.mode)
            .field("digest", &self.params.digest_method)
            .field("encoding", &self.params.xml_encoding)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::memory::pair;

    pub(crate) fn params(role: Role, mode: Mode, initiator: bool) -> SessionParams {
        SessionParams {
            record_type: RecordType::Log,
            role,
            mode,
            digest_method: DigestMethod::Sha256,
            xml_encoding: XmlEncoding::none(),
            initiator,
            peer_agent: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (a, _b) = pair("x", "y");
        let session = Session::new(params(Role::Subscriber, Mode::Live, false), Arc::new(a));
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(!session.is_ok());

        session.activate().unwrap();
        assert!(session.is_ok());
        assert!(session.activate().is_err());

        session.set_errored().await;
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!session.is_ok());
        assert!(!session.channel().is_active());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_activation_requires_mode_and_channel() {
        let (a, b) = pair("x", "y");
        let unset = Session::new(params(Role::Publisher, Mode::Unset, true), Arc::new(a));
        assert!(matches!(unset.activate(), Err(SessionError::InvalidArgument(_))));

        b.close().await;
        let session = Session::new(params(Role::Publisher, Mode::Archive, true), Arc::new(b));
        assert!(matches!(session.activate(), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_local_role() {
        let (a, b) = pair("x", "y");
        let listener = Session::new(params(Role::Subscriber, Mode::Live, false), Arc::new(a));
        let initiator = Session::new(params(Role::Subscriber, Mode::Live, true), Arc::new(b));
        assert_eq!(listener.role(), Role::Subscriber);
        assert_eq!(listener.local_role(), Role::Publisher);
        assert_eq!(initiator.local_role(), Role::Subscriber);
    }

    #[tokio::test]
    async fn test_closed_resolves_on_teardown() {
        let (a, _b) = pair("x", "y");
        let session = Arc::new(Session::new(params(Role::Publisher, Mode::Live, true), Arc::new(a)));
        session.activate().unwrap();
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };
        session.close().await;
        waiter.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}

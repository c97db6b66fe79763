//! Per-session state tracking
//!
//! Both roles walk the same linear sequence of states:
//!
//! ```text
//! Init -> ParametersReady -> PublicKeysExchanged -> KeyDerived
//!      -> FilenameExchanged -> TransferInProgress -> Complete
//! ```
//!
//! Any state may drop straight to `Failed`. `Complete` and `Failed` are
//! terminal; a session that reaches either is done and its socket is
//! closed when the owning task returns.

use std::fmt;
use std::net::SocketAddr;

use tracing::debug;

use crate::error::ProtocolError;

/// Which half of the protocol a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ParametersReady,
    PublicKeysExchanged,
    KeyDerived,
    FilenameExchanged,
    TransferInProgress,
    Complete,
    Failed,
}

impl SessionState {
    /// The state that follows on success, if any
    pub fn next(self) -> Option<SessionState> {
        use SessionState::*;
        match self {
            Init => Some(ParametersReady),
            ParametersReady => Some(PublicKeysExchanged),
            PublicKeysExchanged => Some(KeyDerived),
            KeyDerived => Some(FilenameExchanged),
            FilenameExchanged => Some(TransferInProgress),
            TransferInProgress => Some(Complete),
            Complete | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == SessionState::Failed || self.next() == Some(to)
    }
}

/// State of one session, owned by the task that drives it
#[derive(Debug)]
pub struct SessionProgress {
    role: Role,
    peer: SocketAddr,
    state: SessionState,
}

impl SessionProgress {
    pub fn new(role: Role, peer: SocketAddr) -> Self {
        Self {
            role,
            peer,
            state: SessionState::Init,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `to`, which must be the direct successor of the current state
    pub fn advance(&mut self, to: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(to) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("[{} {}] {:?} -> {:?}", self.role, self.peer, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Abandon the session. Has no effect once terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!("[{} {}] {:?} -> Failed", self.role, self.peer, self.state);
            self.state = SessionState::Failed;
        }
    }
}

//! Client session state machine
//!
//! ```text
//!            begin            opened (data op)
//!   Idle ──────────▶ Opening ─────────────────▶ Transferring ──┐ advance
//!    ▲                  │  opened (one-shot op)      │ ◀───────┘
//!    │                  ▼                            │ finish_transfer
//!    │ reset         Closing ◀──────────────────────┘
//!    │                  │ closed
//!    │                  ▼
//!    └─────────── Completed / Failed(kind)   (fail from any live state)
//! ```
//!
//! Transitions are explicit; an event that does not apply to the current
//! state is rejected with [`TransitionError`] and leaves the state untouched.

use thiserror::Error;
use tracing::trace;

use skylink_core::FtpResult;

/// Kind of client operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Download,
    Upload,
    ListDirectory,
    RemoveFile,
    RemoveDirectory,
    CreateDirectory,
    Rename,
    CalcFileCrc32,
    ResetSessions,
}

impl OperationKind {
    /// Operations with a data phase after the open
    pub fn has_data_phase(self) -> bool {
        matches!(
            self,
            OperationKind::Download | OperationKind::Upload | OperationKind::ListDirectory
        )
    }
}

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Transferring,
    Closing,
    Completed,
    Failed(FtpResult),
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Opening => "Opening",
            SessionState::Transferring => "Transferring",
            SessionState::Closing => "Closing",
            SessionState::Completed => "Completed",
            SessionState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

/// Rejected transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition: {event} in state {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

/// One in-flight client operation
#[derive(Debug, Clone)]
pub struct Session {
    kind: OperationKind,
    path: String,
    state: SessionState,
    session_id: Option<u8>,
    offset: u32,
    bytes_transferred: u64,
    total_bytes: Option<u64>,
}

impl Session {
    pub fn new(kind: OperationKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            state: SessionState::Idle,
            session_id: None,
            offset: 0,
            bytes_transferred: 0,
            total_bytes: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Responder-assigned handle, once opened
    pub fn session_id(&self) -> Option<u8> {
        self.session_id
    }

    /// Next expected offset (entry index for listings)
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    fn reject(&self, event: &'static str) -> TransitionError {
        TransitionError {
            from: self.state.name(),
            event,
        }
    }

    fn set(&mut self, next: SessionState) {
        trace!(kind = ?self.kind, from = self.state.name(), to = next.name(), "session transition");
        self.state = next;
    }

    /// Idle -> Opening
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        if self.state != SessionState::Idle {
            return Err(self.reject("begin"));
        }
        self.set(SessionState::Opening);
        Ok(())
    }

    /// Opening -> Transferring (data ops) or Closing (one-shot ops)
    pub fn opened(
        &mut self,
        session_id: Option<u8>,
        total_bytes: Option<u64>,
    ) -> Result<(), TransitionError> {
        if self.state != SessionState::Opening {
            return Err(self.reject("opened"));
        }
        self.session_id = session_id;
        self.total_bytes = total_bytes;
        if self.kind.has_data_phase() {
            self.set(SessionState::Transferring);
        } else {
            self.set(SessionState::Closing);
        }
        Ok(())
    }

    /// Transferring -> Transferring, moving the cursor
    pub fn advance(&mut self, offset_delta: u32, bytes: u64) -> Result<(), TransitionError> {
        if self.state != SessionState::Transferring {
            return Err(self.reject("advance"));
        }
        self.offset = self.offset.saturating_add(offset_delta);
        self.bytes_transferred += bytes;
        Ok(())
    }

    /// Transferring -> Closing
    pub fn finish_transfer(&mut self) -> Result<(), TransitionError> {
        if self.state != SessionState::Transferring {
            return Err(self.reject("finish_transfer"));
        }
        self.set(SessionState::Closing);
        Ok(())
    }

    /// Closing -> Completed
    ///
    /// The session id is released whether or not the peer acknowledged the
    /// terminate.
    pub fn closed(&mut self) -> Result<(), TransitionError> {
        if self.state != SessionState::Closing {
            return Err(self.reject("closed"));
        }
        self.session_id = None;
        self.set(SessionState::Completed);
        Ok(())
    }

    /// Any live state -> Failed(kind)
    pub fn fail(&mut self, kind: FtpResult) -> Result<(), TransitionError> {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            return Err(self.reject("fail"));
        }
        self.set(SessionState::Failed(kind));
        Ok(())
    }

    /// Completed/Failed -> Idle, clearing all per-operation data
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if !self.state.is_terminal() {
            return Err(self.reject("reset"));
        }
        self.session_id = None;
        self.offset = 0;
        self.bytes_transferred = 0;
        self.total_bytes = None;
        self.set(SessionState::Idle);
        Ok(())
    }

    /// Terminal result: Success for Completed, the failure kind otherwise
    pub fn result(&self) -> Option<FtpResult> {
        match self.state {
            SessionState::Completed => Some(FtpResult::Success),
            SessionState::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}

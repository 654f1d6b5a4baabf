use crate::core::model::{ErrorCode, InstallRequest, ResolutionIntent, SessionId, SessionStatus};
use std::collections::BTreeSet;

/// Snapshot of one request's lifecycle.
///
/// Values are never mutated in place: every transition builds a new state
/// that replaces the one held by the owning task. A `FAILED` state always
/// carries an error code other than `NO_ERROR`, and every other status
/// carries `NO_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    session_id: SessionId,
    status: SessionStatus,
    error_code: ErrorCode,
    bytes_downloaded: u64,
    total_bytes_to_download: u64,
    modules: BTreeSet<String>,
    languages: BTreeSet<String>,
    resolution_intent: Option<ResolutionIntent>,
}

impl SessionState {
    pub fn pending(request: &InstallRequest) -> Self {
        Self {
            session_id: 0,
            status: SessionStatus::Pending,
            error_code: ErrorCode::NoError,
            bytes_downloaded: 0,
            total_bytes_to_download: 0,
            modules: request.modules().clone(),
            languages: request.languages().clone(),
            resolution_intent: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn total_bytes_to_download(&self) -> u64 {
        self.total_bytes_to_download
    }

    pub fn modules(&self) -> &BTreeSet<String> {
        &self.modules
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        &self.languages
    }

    pub fn resolution_intent(&self) -> Option<&ResolutionIntent> {
        self.resolution_intent.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn with_session_id(&self, session_id: SessionId) -> Self {
        Self { session_id, ..self.clone() }
    }

    /// Moves to a non-failure status. `Failed` is routed through [`Self::failed`].
    pub fn with_status(&self, status: SessionStatus) -> Self {
        if status == SessionStatus::Failed {
            return self.failed(ErrorCode::InternalError);
        }
        Self {
            status,
            error_code: ErrorCode::NoError,
            resolution_intent: None,
            ..self.clone()
        }
    }

    /// Byte counters never move backwards within a download phase.
    pub fn with_progress(&self, status: SessionStatus, downloaded: u64, total: u64) -> Self {
        let next = self.with_status(status);
        Self {
            bytes_downloaded: downloaded.max(self.bytes_downloaded),
            total_bytes_to_download: total.max(self.total_bytes_to_download),
            ..next
        }
    }

    pub fn requiring_confirmation(&self, intent: ResolutionIntent) -> Self {
        Self {
            resolution_intent: Some(intent),
            ..self.with_status(SessionStatus::RequiresUserConfirmation)
        }
    }

    pub fn failed(&self, code: ErrorCode) -> Self {
        let error_code = match code {
            ErrorCode::NoError => ErrorCode::InternalError,
            c => c,
        };
        Self {
            status: SessionStatus::Failed,
            error_code,
            resolution_intent: None,
            ..self.clone()
        }
    }
}

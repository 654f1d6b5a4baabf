use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub type SessionId = i32;
pub type DownloadId = SessionId;

/// Session id reported for requests that had nothing to do.
pub const NO_OP_SESSION_ID: SessionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Unknown,
    Pending,
    RequiresUserConfirmation,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Uninstalling,
    Uninstalled,
    Failed,
    Canceling,
    Canceled,
}

impl SessionStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::Downloading => 2,
            Self::Downloaded => 3,
            Self::Installing => 4,
            Self::Installed => 5,
            Self::Failed => 6,
            Self::Canceled => 7,
            Self::RequiresUserConfirmation => 8,
            Self::Canceling => 9,
            Self::Uninstalling => 10,
            Self::Uninstalled => 11,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Installed | Self::Uninstalled | Self::Canceled | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Pending => "PENDING",
            Self::RequiresUserConfirmation => "REQUIRES_USER_CONFIRMATION",
            Self::Downloading => "DOWNLOADING",
            Self::Downloaded => "DOWNLOADED",
            Self::Installing => "INSTALLING",
            Self::Installed => "INSTALLED",
            Self::Uninstalling => "UNINSTALLING",
            Self::Uninstalled => "UNINSTALLED",
            Self::Failed => "FAILED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ActiveSessionsLimitExceeded,
    ModuleUnavailable,
    InvalidRequest,
    SessionNotFound,
    ApiNotAvailable,
    NetworkError,
    ServiceDied,
    InsufficientStorage,
    RequireInstallConfirm,
    InternalError,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::ActiveSessionsLimitExceeded => -1,
            Self::ModuleUnavailable => -2,
            Self::InvalidRequest => -3,
            Self::SessionNotFound => -4,
            Self::ApiNotAvailable => -5,
            Self::NetworkError => -6,
            Self::ServiceDied => -9,
            Self::InsufficientStorage => -10,
            Self::RequireInstallConfirm => -16,
            Self::InternalError => -100,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoError => "NO_ERROR",
            Self::ActiveSessionsLimitExceeded => "ACTIVE_SESSIONS_LIMIT_EXCEEDED",
            Self::ModuleUnavailable => "MODULE_UNAVAILABLE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::ApiNotAvailable => "API_NOT_AVAILABLE",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ServiceDied => "SERVICE_DIED",
            Self::InsufficientStorage => "INSUFFICIENT_STORAGE",
            Self::RequireInstallConfirm => "REQUIRE_INSTALL_CONFIRM",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// Opaque handle a UI hands back to the platform to ask the user for consent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionIntent {
    pub id: Uuid,
    pub session_id: SessionId,
}

impl ResolutionIntent {
    pub fn new(session_id: SessionId) -> Self {
        Self { id: Uuid::new_v4(), session_id }
    }
}

/// One install or uninstall request. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallRequest {
    modules: BTreeSet<String>,
    languages: BTreeSet<String>,
    is_uninstall: bool,
    include_missing_base_splits: bool,
}

impl InstallRequest {
    pub fn builder() -> InstallRequestBuilder {
        InstallRequestBuilder::default()
    }

    pub fn modules(&self) -> &BTreeSet<String> {
        &self.modules
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        &self.languages
    }

    pub fn is_uninstall(&self) -> bool {
        self.is_uninstall
    }

    pub fn include_missing_base_splits(&self) -> bool {
        self.include_missing_base_splits
    }

    /// True when the request asks for nothing at all.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
            && self.languages.is_empty()
            && !self.is_uninstall
            && !self.include_missing_base_splits
    }

    /// Whether this request's module and language sets both contain `other`'s.
    pub fn covers(&self, other: &InstallRequest) -> bool {
        self.modules.is_superset(&other.modules) && self.languages.is_superset(&other.languages)
    }
}

#[derive(Debug, Default)]
pub struct InstallRequestBuilder {
    request: InstallRequest,
}

impl InstallRequestBuilder {
    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.request.modules.insert(name.into());
        self
    }

    pub fn modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.modules.extend(names.into_iter().map(Into::into));
        self
    }

    /// Accepts `fr`, `fr-CA` or `fr_CA`; only the lower-cased primary tag is kept.
    pub fn language(mut self, locale: &str) -> Self {
        if let Some(tag) = language_tag(locale) {
            self.request.languages.insert(tag);
        }
        self
    }

    pub fn languages<'a, I>(self, locales: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        locales.into_iter().fold(self, |b, l| b.language(l))
    }

    pub fn uninstall(mut self, yes: bool) -> Self {
        self.request.is_uninstall = yes;
        self
    }

    pub fn include_missing_base_splits(mut self, yes: bool) -> Self {
        self.request.include_missing_base_splits = yes;
        self
    }

    pub fn build(self) -> InstallRequest {
        self.request
    }
}

pub fn language_tag(locale: &str) -> Option<String> {
    let primary = locale.trim().split(['-', '_']).next()?.to_ascii_lowercase();
    if primary.is_empty() || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(primary)
}

/// Status reported by an artifact download. Exactly one terminal variant ends a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Enqueued { id: DownloadId },
    Pending,
    Running { downloaded: u64, total: u64 },
    Paused,
    Unknown,
    Successful { path: PathBuf, total: u64 },
    Failed { code: ErrorCode, reason: String },
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful { .. } | Self::Failed { .. } | Self::Canceled)
    }
}

/// Status reported by the installer for one install or uninstall call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Pending,
    Installing,
    Uninstalling,
    RequiresUserPermission { intent: ResolutionIntent },
    Installed,
    Uninstalled,
    Failed { code: ErrorCode, reason: String },
    Canceled,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_tags_are_lowercased_primary_subtags() {
        assert_eq!(language_tag("fr-CA").as_deref(), Some("fr"));
        assert_eq!(language_tag("PT_br").as_deref(), Some("pt"));
        assert_eq!(language_tag("en").as_deref(), Some("en"));
        assert_eq!(language_tag(""), None);
        assert_eq!(language_tag("1x"), None);
    }

    #[test]
    fn builder_dedupes_languages_by_primary_tag() {
        let req = InstallRequest::builder()
            .module("camera")
            .languages(["fr-FR", "fr-CA", "de"])
            .build();
        assert_eq!(req.languages().len(), 2);
        assert!(req.languages().contains("fr"));
        assert!(!req.is_empty());
    }

    #[test]
    fn empty_request_detection() {
        assert!(InstallRequest::builder().build().is_empty());
        assert!(!InstallRequest::builder().uninstall(true).build().is_empty());
        assert!(!InstallRequest::builder().include_missing_base_splits(true).build().is_empty());
    }

    #[test]
    fn covers_checks_both_sets() {
        let big = InstallRequest::builder().modules(["a", "b"]).language("en").build();
        let small = InstallRequest::builder().module("a").build();
        assert!(big.covers(&small));
        assert!(!small.covers(&big));
        assert!(big.covers(&big));
    }

    #[test]
    fn terminal_statuses() {
        for s in [
            SessionStatus::Installed,
            SessionStatus::Uninstalled,
            SessionStatus::Canceled,
            SessionStatus::Failed,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        assert!(!SessionStatus::RequiresUserConfirmation.is_terminal());
        assert!(!SessionStatus::Canceling.is_terminal());
        assert!(!SessionStatus::Unknown.is_terminal());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::NoError.code(), 0);
        assert_eq!(ErrorCode::NetworkError.code(), -6);
        assert_eq!(ErrorCode::InternalError.code(), -100);
        assert_eq!(ErrorCode::ModuleUnavailable.to_string(), "MODULE_UNAVAILABLE");
    }
}

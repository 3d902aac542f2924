use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// States a request moves through from creation to termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Initialized,
    AudioActivating,
    AudioOn,
    Transmitting,
    AudioDeactivating,
    Succeeded,
    Failed,
    Canceled,
}

impl RequestState {
    /// Terminal states cannot be left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Canceled
        )
    }
}

/// States of the audio gate deciding when capture bytes are accepted.
/// Text-only requests never leave `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioGateState {
    #[default]
    Off,
    Activating,
    On,
    Deactivating,
}

/// Why a request was cancelled. Distinct from failure: cancellation fires
/// its own event and records no error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller no longer wants the result.
    UserRequested,
    /// An external deadline expired.
    Timeout,
    /// A newer request replaced this one.
    Superseded,
    /// The owning connection is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "deadline expired"),
            CancelReason::Superseded => write!(f, "superseded by a newer request"),
            CancelReason::Shutdown => write!(f, "connection shutting down"),
        }
    }
}

/// What a request is able to do, composed into the one lifecycle machine
/// instead of being spread over a subclass hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct RequestProfile {
    /// The request streams captured audio after an activation handshake.
    pub has_audio: bool,
    /// Intermediate results are decoded and surfaced before the final one.
    pub partial_results: bool,
}

impl RequestProfile {
    pub fn text() -> Self {
        Self {
            has_audio: false,
            partial_results: true,
        }
    }

    pub fn audio() -> Self {
        Self {
            has_audio: true,
            partial_results: true,
        }
    }
}

/// Audio capture collaborator, injected by the embedding application.
///
/// The lifecycle only tells the source when to run; samples come back in
/// through `RequestLifecycle::write_audio`.
pub trait AudioSource: Send + Sync {
    /// Whether capture can start right now. Checked before activation; a
    /// source that is not ready fails the whole request.
    fn ready(&self) -> bool;
    /// Capture should begin delivering samples.
    fn start(&self);
    /// Capture should stop.
    fn stop(&self);
}

/// Configuration for one request.
pub struct RequestOptions {
    /// Initial JSON body describing the query.
    pub payload: Value,
    pub profile: RequestProfile,
    /// Caller-assigned request id; the dispatcher assigns one when absent.
    pub request_id: Option<String>,
    /// Capture source, required when the profile has audio.
    pub audio_source: Option<Arc<dyn AudioSource>>,
}

impl RequestOptions {
    /// Text-only query with the given body.
    pub fn text(payload: Value) -> Self {
        Self {
            payload,
            profile: RequestProfile::text(),
            request_id: None,
            audio_source: None,
        }
    }

    /// Audio query; `source` supplies the capture control seam.
    pub fn audio(payload: Value, source: Arc<dyn AudioSource>) -> Self {
        Self {
            payload,
            profile: RequestProfile::audio(),
            request_id: None,
            audio_source: Some(source),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Accumulated outcome of a request, readable at any point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestResults {
    /// Most recent result data (partial until finalization).
    pub data: Option<Value>,
    /// Failure description, set when the request failed.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Succeeded.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Canceled.is_terminal());
        assert!(!RequestState::Created.is_terminal());
        assert!(!RequestState::Transmitting.is_terminal());
        assert!(!RequestState::AudioOn.is_terminal());
    }

    #[test]
    fn test_cancel_reason_display() {
        assert_eq!(CancelReason::UserRequested.to_string(), "cancelled by caller");
        assert_eq!(CancelReason::Timeout.to_string(), "deadline expired");
    }
}

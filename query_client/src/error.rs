use thiserror::Error;

/// Errors surfaced to request observers through the failure callback.
///
/// Codec-level damage never appears here: the decoder repairs the stream
/// locally. Cancellation is not an error either; it travels through the
/// dedicated cancellation event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Connection-level failure (drop, send failure). Fails every request
    /// pending on the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Single-request failure: missing required input, invalid state
    /// transition, or an error reported by the remote service.
    #[error("request error: {0}")]
    Request(String),
}

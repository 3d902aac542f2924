//! # Query Client
//!
//! Client-side request stack for the streaming NLP query service: a
//! request lifecycle state machine with a nested audio gate, plus the
//! per-connection dispatcher that routes decoded chunks to the request
//! that owns them.
//!
//! ## Example Usage
//!
//! ```rust
//! use query_client::{MockTransport, RequestDispatcher, RequestLifecycle, RequestOptions};
//! use serde_json::json;
//!
//! let transport = MockTransport::new();
//! let dispatcher = RequestDispatcher::new(transport);
//!
//! let request = RequestLifecycle::new(RequestOptions::text(json!({
//!     "query": "what's the weather like"
//! })));
//!
//! // Observe results as pure data events
//! let (tx, rx) = crossbeam_channel::unbounded();
//! request.events().forward_to_channel(tx);
//!
//! dispatcher.send(&request);
//! # drop(rx);
//! ```

mod audio_gate;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod mock;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use dispatcher::{AuthCallback, RequestDispatcher};
pub use error::QueryError;
pub use events::{ListenerId, RequestEvent, RequestEvents};
pub use lifecycle::{OutboundHandle, RequestLifecycle};
pub use mock::MockTransport;
pub use transport::{ConnectionState, FrameTransport, TcpTransport, TransportConfig};
pub use types::{
    AudioGateState, AudioSource, CancelReason, RequestOptions, RequestProfile, RequestResults,
    RequestState,
};

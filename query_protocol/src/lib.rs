//! # Query Protocol
//!
//! Chunk framing codec for the streaming NLP query service.
//!
//! A chunk multiplexes a JSON control/metadata segment with an opaque
//! binary segment (audio PCM in practice) over a single byte stream.
//! This crate provides:
//! - Chunk and header types with bit-exact encoding
//! - A stateful streaming decoder that tolerates arbitrary fragmentation
//!
//! ## Example Usage
//!
//! ```rust
//! use query_protocol::{Chunk, ChunkDecoder};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Encode a query chunk
//! let chunk = Chunk::from_json(json!({"text": "hello"}))?;
//! let bytes = chunk.to_bytes()?;
//!
//! // Decode it back, possibly across several reads
//! let mut decoder = ChunkDecoder::new();
//! let decoded = decoder.decode(&bytes);
//! assert_eq!(decoded.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod protocol;

// Re-export commonly used types
pub use protocol::{
    Chunk, ChunkDecoder, ChunkHeader, JsonSegment, ProtocolError, FLAG_BINARY, FLAG_JSON,
    HEADER_SIZE, MAX_SEGMENT_SIZE,
};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("segment length {got} exceeds maximum {max}")]
    SegmentTooLarge { got: u64, max: u64 },

    #[error("{segment} segment length {len} without presence flag")]
    LengthWithoutFlag { segment: &'static str, len: u64 },

    #[error("refusing to encode a chunk with no payload")]
    EmptyChunk,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Flag bit marking a binary segment as present.
pub const FLAG_BINARY: u8 = 0b0000_0001;
/// Flag bit marking a JSON segment as present.
pub const FLAG_JSON: u8 = 0b0000_0010;
const RESERVED_MASK: u8 = !(FLAG_BINARY | FLAG_JSON);

/// Fixed header size: flags byte + JSON length + binary length.
pub const HEADER_SIZE: usize = 1 + 8 + 8;

/// Segment lengths must fit a 32-bit signed count.
pub const MAX_SEGMENT_SIZE: u64 = i32::MAX as u64;

fn read_u64_le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Fixed-size prefix of every chunk:
/// `[1 byte flags][8 bytes JSON length, LE][8 bytes binary length, LE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub json_len: u64,
    pub binary_len: u64,
}

impl ChunkHeader {
    /// Parse and validate a complete header.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let flags = bytes[0];
        let json_len = read_u64_le(&bytes[1..9]);
        let binary_len = read_u64_le(&bytes[9..17]);

        if flags & RESERVED_MASK != 0 {
            return Err(ProtocolError::ReservedFlags(flags));
        }
        if json_len > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                got: json_len,
                max: MAX_SEGMENT_SIZE,
            });
        }
        if binary_len > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                got: binary_len,
                max: MAX_SEGMENT_SIZE,
            });
        }
        if json_len > 0 && flags & FLAG_JSON == 0 {
            return Err(ProtocolError::LengthWithoutFlag {
                segment: "JSON",
                len: json_len,
            });
        }
        if binary_len > 0 && flags & FLAG_BINARY == 0 {
            return Err(ProtocolError::LengthWithoutFlag {
                segment: "binary",
                len: binary_len,
            });
        }

        Ok(Self {
            flags,
            json_len,
            binary_len,
        })
    }
}

/// JSON portion of a chunk: the parsed tree together with the exact text
/// it was decoded from (or will be encoded as).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSegment {
    pub tree: Value,
    pub text: String,
}

impl JsonSegment {
    pub fn new(tree: Value) -> Result<Self, ProtocolError> {
        let text = serde_json::to_string(&tree)?;
        Ok(Self { tree, text })
    }
}

/// One complete unit of wire data: optional JSON metadata plus an optional
/// opaque binary payload. A chunk always carries at least one of the two.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub json: Option<JsonSegment>,
    pub binary: Vec<u8>,
}

impl Chunk {
    pub fn new(json: Option<Value>, binary: Vec<u8>) -> Result<Self, ProtocolError> {
        let json = match json {
            Some(tree) => Some(JsonSegment::new(tree)?),
            None => None,
        };
        let chunk = Self { json, binary };
        if chunk.is_empty() {
            return Err(ProtocolError::EmptyChunk);
        }
        Ok(chunk)
    }

    /// Pure-JSON chunk.
    pub fn from_json(tree: Value) -> Result<Self, ProtocolError> {
        Self::new(Some(tree), Vec::new())
    }

    /// Pure-binary chunk.
    pub fn from_binary(binary: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::new(None, binary)
    }

    fn is_empty(&self) -> bool {
        let json_empty = match &self.json {
            Some(segment) => segment.text.is_empty(),
            None => true,
        };
        json_empty && self.binary.is_empty()
    }

    /// Serialize to wire bytes:
    /// `[flags][JSON length][binary length][JSON bytes][binary bytes]`
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let json_bytes: &[u8] = match &self.json {
            Some(segment) => segment.text.as_bytes(),
            None => &[],
        };
        if json_bytes.is_empty() && self.binary.is_empty() {
            return Err(ProtocolError::EmptyChunk);
        }
        if json_bytes.len() as u64 > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                got: json_bytes.len() as u64,
                max: MAX_SEGMENT_SIZE,
            });
        }
        if self.binary.len() as u64 > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                got: self.binary.len() as u64,
                max: MAX_SEGMENT_SIZE,
            });
        }

        let mut flags = 0u8;
        if !self.binary.is_empty() {
            flags |= FLAG_BINARY;
        }
        if !json_bytes.is_empty() {
            flags |= FLAG_JSON;
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + json_bytes.len() + self.binary.len());
        bytes.push(flags);
        bytes.extend_from_slice(&(json_bytes.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.binary.len() as u64).to_le_bytes());
        bytes.extend_from_slice(json_bytes);
        bytes.extend_from_slice(&self.binary);

        Ok(bytes)
    }
}

#[derive(Debug)]
struct PendingChunk {
    json_buf: Vec<u8>,
    json_needed: usize,
    binary_buf: Vec<u8>,
    binary_needed: usize,
}

impl PendingChunk {
    fn is_complete(&self) -> bool {
        self.json_buf.len() == self.json_needed && self.binary_buf.len() == self.binary_needed
    }
}

/// Streaming decoder for one connection's inbound byte stream.
///
/// Not thread-safe: the decode state belongs to the single inbound delivery
/// path of its connection.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    header_buf: Vec<u8>,
    pending: Option<PendingChunk>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially accumulated chunk.
    pub fn reset(&mut self) {
        self.header_buf.clear();
        self.pending = None;
    }

    /// Feed a buffer of received bytes, returning every chunk it completes.
    ///
    /// Accepts arbitrary fragmentation: sub-header slivers, partial
    /// segments, exactly one chunk, or many chunks packed back-to-back.
    /// A malformed header is not fatal: the rest of the buffer is
    /// reinterpreted as a binary payload and the stream continues.
    pub fn decode(&mut self, mut data: &[u8]) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        while !data.is_empty() {
            if self.pending.is_none() {
                let needed = HEADER_SIZE - self.header_buf.len();
                let take = needed.min(data.len());
                self.header_buf.extend_from_slice(&data[..take]);
                data = &data[take..];

                if self.header_buf.len() < HEADER_SIZE {
                    break; // await more data
                }

                let mut header_bytes = [0u8; HEADER_SIZE];
                header_bytes.copy_from_slice(&self.header_buf);
                self.header_buf.clear();

                match ChunkHeader::parse(&header_bytes) {
                    Ok(header) => {
                        self.pending = Some(PendingChunk {
                            json_buf: Vec::with_capacity(header.json_len as usize),
                            json_needed: header.json_len as usize,
                            binary_buf: Vec::with_capacity(header.binary_len as usize),
                            binary_needed: header.binary_len as usize,
                        });
                    }
                    Err(e) => {
                        warn!(
                            "⚠️ Invalid chunk header ({}), treating {} remaining bytes as binary payload",
                            e,
                            data.len()
                        );
                        self.pending = Some(PendingChunk {
                            json_buf: Vec::new(),
                            json_needed: 0,
                            binary_buf: Vec::with_capacity(data.len()),
                            binary_needed: data.len(),
                        });
                    }
                }
            }

            if let Some(pending) = self.pending.as_mut() {
                // JSON fills before binary
                let missing = pending.json_needed - pending.json_buf.len();
                let take = missing.min(data.len());
                pending.json_buf.extend_from_slice(&data[..take]);
                data = &data[take..];

                let missing = pending.binary_needed - pending.binary_buf.len();
                let take = missing.min(data.len());
                pending.binary_buf.extend_from_slice(&data[..take]);
                data = &data[take..];

                if pending.is_complete() {
                    if let Some(chunk) = self.finish_pending() {
                        chunks.push(chunk);
                    }
                }
            }
        }

        chunks
    }

    fn finish_pending(&mut self) -> Option<Chunk> {
        let pending = self.pending.take()?;

        let json = if pending.json_buf.is_empty() {
            None
        } else {
            match String::from_utf8(pending.json_buf) {
                Ok(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(tree) => Some(JsonSegment { tree, text }),
                    Err(e) => {
                        warn!(
                            "⚠️ Dropping unparseable JSON segment ({} bytes): {}",
                            text.len(),
                            e
                        );
                        None
                    }
                },
                Err(e) => {
                    warn!("⚠️ Dropping non-UTF-8 JSON segment: {}", e);
                    None
                }
            }
        };

        if json.is_none() && pending.binary_buf.is_empty() {
            debug!("Skipping chunk with no payload");
            return None;
        }

        Some(Chunk {
            json,
            binary: pending.binary_buf,
        })
    }
}

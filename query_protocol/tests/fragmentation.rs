//! Fragmentation tests for the chunk decoder.
//!
//! The transport delivers whatever byte windows the network hands it, so
//! the decoder must produce identical chunks no matter how an encoded
//! stream is split across calls.

use query_protocol::{Chunk, ChunkDecoder, HEADER_SIZE};
use serde_json::json;

fn decode_in_slices(bytes: &[u8], slice_len: usize) -> Vec<Chunk> {
    let mut decoder = ChunkDecoder::new();
    let mut decoded = Vec::new();
    for slice in bytes.chunks(slice_len) {
        decoded.extend(decoder.decode(slice));
    }
    decoded
}

#[test]
fn test_every_split_point_yields_same_chunk() {
    env_logger::try_init().ok();

    let chunk = Chunk::new(
        Some(json!({"query": "turn on the lights", "room": "kitchen"})),
        vec![0xAB; 48],
    )
    .expect("chunk");
    let bytes = chunk.to_bytes().expect("encode");

    for split in 1..bytes.len() {
        let mut decoder = ChunkDecoder::new();
        let mut decoded = decoder.decode(&bytes[..split]);
        decoded.extend(decoder.decode(&bytes[split..]));

        assert_eq!(decoded, vec![chunk.clone()], "split at byte {}", split);
    }
}

#[test]
fn test_three_byte_increments_two_chunks() {
    env_logger::try_init().ok();

    // One pure-binary chunk (16 bytes) and one pure-JSON chunk,
    // concatenated and fed in 3-byte increments.
    let binary_chunk = Chunk::from_binary((0u8..16).collect()).expect("binary chunk");
    let json_chunk = Chunk::from_json(json!({"ok": true})).expect("json chunk");

    let mut bytes = binary_chunk.to_bytes().expect("encode");
    bytes.extend_from_slice(&json_chunk.to_bytes().expect("encode"));

    let decoded = decode_in_slices(&bytes, 3);

    assert_eq!(decoded, vec![binary_chunk, json_chunk]);
}

#[test]
fn test_fragmentation_invariance_across_slice_sizes() {
    env_logger::try_init().ok();

    let chunks = vec![
        Chunk::from_json(json!({"request_id": "q-1", "data": {"transcript": "what time"}}))
            .expect("chunk"),
        Chunk::from_binary(vec![0x55; 100]).expect("chunk"),
        Chunk::new(Some(json!({"request_id": "q-2", "final": true})), vec![1, 2, 3])
            .expect("chunk"),
    ];
    let mut bytes = Vec::new();
    for chunk in &chunks {
        bytes.extend_from_slice(&chunk.to_bytes().expect("encode"));
    }

    let whole = ChunkDecoder::new().decode(&bytes);
    assert_eq!(whole, chunks);

    for slice_len in [1, 2, 5, 7, 17, 64, bytes.len()] {
        assert_eq!(
            decode_in_slices(&bytes, slice_len),
            chunks,
            "slice length {}",
            slice_len
        );
    }
}

#[test]
fn test_segment_boundary_at_call_boundary() {
    env_logger::try_init().ok();

    let chunk = Chunk::new(Some(json!({"n": 1})), vec![9; 8]).expect("chunk");
    let bytes = chunk.to_bytes().expect("encode");
    let json_len = chunk.json.as_ref().expect("json").text.len();

    let mut decoder = ChunkDecoder::new();
    // Header exactly, then the JSON segment exactly, then the binary segment.
    assert!(decoder.decode(&bytes[..HEADER_SIZE]).is_empty());
    assert!(decoder
        .decode(&bytes[HEADER_SIZE..HEADER_SIZE + json_len])
        .is_empty());
    let decoded = decoder.decode(&bytes[HEADER_SIZE + json_len..]);

    assert_eq!(decoded, vec![chunk]);
}

#[test]
fn test_buffer_ending_mid_header_of_next_chunk() {
    env_logger::try_init().ok();

    let first = Chunk::from_json(json!({"seq": 1})).expect("chunk");
    let second = Chunk::from_binary(vec![3; 24]).expect("chunk");

    let mut bytes = first.to_bytes().expect("encode");
    bytes.extend_from_slice(&second.to_bytes().expect("encode"));

    // First call carries chunk one plus 5 bytes of chunk two's header.
    let cut = first.to_bytes().expect("encode").len() + 5;
    let mut decoder = ChunkDecoder::new();
    let decoded = decoder.decode(&bytes[..cut]);
    assert_eq!(decoded, vec![first]);

    let decoded = decoder.decode(&bytes[cut..]);
    assert_eq!(decoded, vec![second]);
}

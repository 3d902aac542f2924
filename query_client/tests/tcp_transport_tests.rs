//! Loopback test for the TCP transport: a minimal in-test query server
//! accepts one connection, decodes the outbound chunk, and answers with a
//! final result.

use query_client::{
    RequestDispatcher, RequestEvent, RequestLifecycle, RequestOptions, RequestState,
    TcpTransport, TransportConfig,
};
use query_protocol::{Chunk, ChunkDecoder};
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_query_roundtrip_over_tcp() {
    env_logger::try_init().ok();

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");

        let mut decoder = ChunkDecoder::new();
        let mut buf = [0u8; 1024];
        let request_id = loop {
            let n = stream.read(&mut buf).expect("server read");
            if n == 0 {
                panic!("client closed before sending a chunk");
            }
            if let Some(chunk) = decoder.decode(&buf[..n]).into_iter().next() {
                let segment = chunk.json.expect("query json");
                assert_eq!(segment.tree["query"], "meaning of life");
                break segment.tree["request_id"]
                    .as_str()
                    .expect("request id")
                    .to_string();
            }
        };

        let reply = Chunk::from_json(json!({
            "request_id": request_id,
            "final": true,
            "data": {"answer": 42}
        }))
        .expect("reply chunk")
        .to_bytes()
        .expect("encode reply");
        stream.write_all(&reply).expect("server write");
        stream.flush().expect("server flush");
    });

    let config = TransportConfig {
        address,
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_secs(5),
    };
    let transport = TcpTransport::connect(&config).expect("connect");
    let dispatcher = Arc::new(RequestDispatcher::new(transport.clone()));
    let reader = transport
        .spawn_reader(Arc::clone(&dispatcher))
        .expect("spawn reader");

    let request =
        RequestLifecycle::new(RequestOptions::text(json!({"query": "meaning of life"})));
    let (tx, rx) = crossbeam_channel::unbounded();
    request.events().forward_to_channel(tx);

    dispatcher.send(&request);

    // The reply arrives on the reader thread; wait for the final event
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut final_data = None;
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(RequestEvent::Final(data)) => {
                final_data = Some(data);
                break;
            }
            Ok(_) => continue,
            Err(_) => continue,
        }
    }

    assert_eq!(final_data, Some(json!({"answer": 42})));
    assert_eq!(request.state(), RequestState::Succeeded);
    assert_eq!(dispatcher.pending_requests(), 0);

    server.join().expect("server thread");
    transport.shutdown();
    reader.join().expect("reader thread");
}

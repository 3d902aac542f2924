//! Per-connection owner of chunk decode state and the id→request routing
//! table.

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use query_protocol::{Chunk, ChunkDecoder};

use crate::error::QueryError;
use crate::lifecycle::{OutboundHandle, RequestLifecycle};
use crate::transport::{ConnectionState, FrameTransport};

/// Completion handler for the authentication handshake.
pub type AuthCallback = Box<dyn FnOnce(Result<(), QueryError>) + Send>;

enum AuthState {
    /// The server needs no handshake; sends flow immediately.
    NotRequired,
    /// Handshake not performed yet; sends queue.
    Required,
    /// Handshake chunk sent; waiting for the response. Sends queue.
    InFlight(AuthCallback),
    /// Handshake completed; sends flow.
    Established,
}

type RequestMap = Arc<Mutex<HashMap<String, Arc<RequestLifecycle>>>>;

/// Routes decoded chunks to the request that owns them and fans
/// connection-level events out to every pending request.
///
/// The dispatcher exclusively owns its connection's decode state (touched
/// only from the inbound delivery path) and the id→lifecycle map; a
/// lifecycle leaves the map exactly once, at its terminal transition.
pub struct RequestDispatcher {
    transport: Arc<dyn FrameTransport>,
    decoder: Mutex<ChunkDecoder>,
    requests: RequestMap,
    queued: Mutex<Vec<Arc<RequestLifecycle>>>,
    auth: Mutex<AuthState>,
    requires_auth: bool,
    /// Encode-then-send is one atomic unit per call.
    send_lock: Arc<Mutex<()>>,
    next_id: AtomicU64,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn FrameTransport>) -> Self {
        Self::with_auth(transport, false)
    }

    /// With `requires_auth`, sends queue until `authenticate` succeeds.
    pub fn with_auth(transport: Arc<dyn FrameTransport>, requires_auth: bool) -> Self {
        Self {
            transport,
            decoder: Mutex::new(ChunkDecoder::new()),
            requests: Arc::new(Mutex::new(HashMap::new())),
            queued: Mutex::new(Vec::new()),
            auth: Mutex::new(if requires_auth {
                AuthState::Required
            } else {
                AuthState::NotRequired
            }),
            requires_auth,
            send_lock: Arc::new(Mutex::new(())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register and start a request: assign an id when the caller set none,
    /// install the outbound handle, then drive the lifecycle's own `send`.
    /// While authentication is pending the send is queued instead.
    pub fn send(&self, lifecycle: &Arc<RequestLifecycle>) {
        let id = lifecycle
            .requested_id()
            .unwrap_or_else(|| format!("q-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.register(id, lifecycle);

        let start_now = {
            let auth = self.auth.lock().unwrap();
            if matches!(*auth, AuthState::NotRequired | AuthState::Established) {
                true
            } else {
                info!("🔐 Queueing request until authentication completes");
                self.queued.lock().unwrap().push(Arc::clone(lifecycle));
                false
            }
        };
        if start_now {
            lifecycle.send();
        }
    }

    /// Put a lifecycle into the routing table under `id` and arrange its
    /// exactly-once removal at the terminal transition. Initialization
    /// errors (a reused request) surface through the lifecycle's failure
    /// path.
    pub fn register(&self, id: String, lifecycle: &Arc<RequestLifecycle>) {
        if let Err(e) = lifecycle.initialize(id.clone(), self.outbound_handle()) {
            warn!("⚠️ Cannot register request '{}': {}", id, e);
            lifecycle.fail(e);
            return;
        }

        self.requests
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(lifecycle));
        debug!("📇 Registered request '{}'", id);

        // Weak handle: the lifecycle's listener must not keep the map alive
        let map = Arc::downgrade(&self.requests);
        let listener_id = id.clone();
        lifecycle.events().subscribe(move |event| {
            if event.is_terminal() {
                if let Some(map) = map.upgrade() {
                    map.lock().unwrap().remove(&listener_id);
                }
            }
        });

        // A request cancelled between the insert above and the subscription
        // would slip past its own removal listener
        if lifecycle.state().is_terminal() {
            self.requests.lock().unwrap().remove(&id);
        }
    }

    /// Encode one (JSON, binary) pair and put it on the wire.
    pub fn send_outbound(&self, json: Option<&Value>, binary: &[u8]) -> Result<(), QueryError> {
        encode_and_send(self.transport.as_ref(), &self.send_lock, json, binary)
    }

    /// Feed inbound bytes from the transport's delivery thread. The decode
    /// state is owned by this single path for the connection's lifetime.
    pub fn route_inbound(&self, buffer: &[u8]) {
        let chunks = self.decoder.lock().unwrap().decode(buffer);
        for chunk in chunks {
            self.route_chunk(chunk);
        }
    }

    /// Start the authentication handshake. Only one may be in flight per
    /// connection; a second attempt fails immediately.
    pub fn authenticate(&self, credentials: Value, on_done: AuthCallback) {
        let already = {
            let mut auth = self.auth.lock().unwrap();
            if matches!(*auth, AuthState::InFlight(_)) {
                Some((
                    on_done,
                    Err(QueryError::Request(
                        "authentication already in progress".into(),
                    )),
                ))
            } else if matches!(*auth, AuthState::Established) {
                Some((on_done, Ok(())))
            } else {
                *auth = AuthState::InFlight(on_done);
                None
            }
        };
        if let Some((on_done, result)) = already {
            on_done(result);
            return;
        }

        let mut payload = credentials;
        if let Some(object) = payload.as_object_mut() {
            object.insert("type".to_string(), Value::String("auth".to_string()));
        }
        info!("🔐 Starting authentication handshake");

        if let Err(e) = self.send_outbound(Some(&payload), &[]) {
            error!("❌ Failed to send authentication chunk: {}", e);
            if let Some(handler) = self.take_auth_handler(self.base_auth_state()) {
                handler(Err(e.clone()));
            }
            self.fail_queued(e);
        }
    }

    /// Connection-level state changes from the transport layer.
    pub fn connection_state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => info!("📡 Connection established"),
            ConnectionState::Disconnected => self.connection_lost("connection closed"),
        }
    }

    /// Fail every pending and queued request with a connection-level error
    /// and clear the routing table.
    pub fn connection_lost(&self, reason: &str) {
        error!("🔌 Connection lost: {}", reason);

        let pending: Vec<Arc<RequestLifecycle>> = {
            let mut map = self.requests.lock().unwrap();
            map.drain().map(|(_, lifecycle)| lifecycle).collect()
        };
        self.decoder.lock().unwrap().reset();

        let error = QueryError::Transport(reason.to_string());
        if let Some(handler) = self.take_auth_handler(self.base_auth_state()) {
            handler(Err(error.clone()));
        }
        self.fail_queued(error.clone());

        // Lookup already released the map lock; failing each request fires
        // its callbacks without any dispatcher lock held.
        for lifecycle in pending {
            lifecycle.fail(error.clone());
        }
    }

    /// Number of requests still registered; for introspection and tests.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn outbound_handle(&self) -> Arc<OutboundHandle> {
        let transport = Arc::clone(&self.transport);
        let send_lock = Arc::clone(&self.send_lock);
        let abort_transport = Arc::clone(&self.transport);
        Arc::new(OutboundHandle {
            send: Box::new(move |json, binary| {
                encode_and_send(transport.as_ref(), &send_lock, json, binary)
            }),
            abort: Box::new(move || abort_transport.abort()),
        })
    }

    fn route_chunk(&self, chunk: Chunk) {
        let json = match &chunk.json {
            Some(segment) => &segment.tree,
            None => {
                // Recovery-fallback chunks land here too
                warn!(
                    "⚠️ Dropping unroutable binary-only chunk ({} bytes)",
                    chunk.binary.len()
                );
                return;
            }
        };

        if json.get("type").and_then(Value::as_str) == Some("auth") {
            self.handle_auth_response(json);
            return;
        }

        let id = match json.get("request_id").and_then(Value::as_str) {
            Some(id) => id,
            None => {
                warn!("⚠️ Dropping chunk without a request_id");
                return;
            }
        };

        // Lookup under the map lock, apply outside it: a request may cancel
        // itself from within its own partial-result callback.
        let lifecycle = self.requests.lock().unwrap().get(id).cloned();
        let lifecycle = match lifecycle {
            Some(lifecycle) => lifecycle,
            None => {
                debug!("No live request '{}' for inbound chunk; dropping", id);
                return;
            }
        };

        if !chunk.binary.is_empty() {
            lifecycle.apply_audio(chunk.binary.clone());
        }

        let error = json
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .map(String::from);
        let is_final = json.get("final").and_then(Value::as_bool).unwrap_or(false);
        let data = json.get("data").cloned().filter(|d| !d.is_null());

        if is_final || error.is_some() {
            lifecycle.apply_final(data, error);
        } else if let Some(data) = data {
            lifecycle.apply_partial(data);
        } else {
            debug!("Chunk for '{}' carried no result data", id);
        }
    }

    fn handle_auth_response(&self, json: &Value) {
        let ok = json.get("status").and_then(Value::as_str) == Some("ok");
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("authentication rejected by server");

        let handler = self.take_auth_handler(if ok {
            AuthState::Established
        } else {
            self.base_auth_state()
        });
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("⚠️ Unexpected authentication response; ignoring");
                return;
            }
        };

        if ok {
            info!("🔓 Authentication established");
            handler(Ok(()));
            let queued: Vec<Arc<RequestLifecycle>> =
                self.queued.lock().unwrap().drain(..).collect();
            for lifecycle in queued {
                lifecycle.send();
            }
        } else {
            let error = QueryError::Request(format!("authentication failed: {}", message));
            error!("❌ {}", error);
            handler(Err(error.clone()));
            self.fail_queued(error);
        }
    }

    fn base_auth_state(&self) -> AuthState {
        if self.requires_auth {
            AuthState::Required
        } else {
            AuthState::NotRequired
        }
    }

    /// Take the in-flight auth handler, if any, leaving `next` in its place.
    /// Other states are left untouched.
    fn take_auth_handler(&self, next: AuthState) -> Option<AuthCallback> {
        let mut auth = self.auth.lock().unwrap();
        match std::mem::replace(&mut *auth, next) {
            AuthState::InFlight(handler) => Some(handler),
            other => {
                *auth = other;
                None
            }
        }
    }

    fn fail_queued(&self, error: QueryError) {
        let queued: Vec<Arc<RequestLifecycle>> = self.queued.lock().unwrap().drain(..).collect();
        for lifecycle in queued {
            lifecycle.fail(error.clone());
        }
    }
}

fn encode_and_send(
    transport: &dyn FrameTransport,
    send_lock: &Mutex<()>,
    json: Option<&Value>,
    binary: &[u8],
) -> Result<(), QueryError> {
    let chunk = Chunk::new(json.cloned(), binary.to_vec())
        .map_err(|e| QueryError::Request(format!("cannot encode outbound chunk: {}", e)))?;
    let bytes = chunk
        .to_bytes()
        .map_err(|e| QueryError::Request(format!("cannot encode outbound chunk: {}", e)))?;

    let _guard = send_lock.lock().unwrap();
    transport.send(&bytes)
}

//! The state machine driving one query from creation to termination.

use log::{debug, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::audio_gate::{AudioGate, GateEdge};
use crate::error::QueryError;
use crate::events::{RequestEvent, RequestEvents};
use crate::types::{AudioSource, CancelReason, RequestOptions, RequestResults, RequestState};

/// One-shot handle the dispatcher installs for outbound traffic, keeping
/// the lifecycle free of any reference back to the dispatcher.
pub struct OutboundHandle {
    /// Encode a (JSON, binary) pair and put it on the wire as one chunk.
    pub send: Box<dyn Fn(Option<&Value>, &[u8]) -> Result<(), QueryError> + Send + Sync>,
    /// Best-effort transport abort, requested by cancellation.
    pub abort: Box<dyn Fn() + Send + Sync>,
}

struct LifecycleInner {
    state: RequestState,
    gate: AudioGate,
    /// Guards terminal handling; set exactly once, at the terminal transition.
    finalized: bool,
    options: RequestOptions,
    results: RequestResults,
    id: Option<String>,
    outbound: Option<Arc<OutboundHandle>>,
}

/// Side effects collected under the state lock and performed after it is
/// released, so a callback may re-enter the lifecycle without deadlocking.
#[derive(Default)]
struct Effects {
    events: Vec<RequestEvent>,
    send: Option<(Option<Value>, Vec<u8>)>,
    start_source: Option<Arc<dyn AudioSource>>,
    stop_source: Option<Arc<dyn AudioSource>>,
    abort: bool,
    outbound: Option<Arc<OutboundHandle>>,
}

/// State machine governing one query: creation, optional audio activation,
/// transmission, partial/final result application, completion and
/// cancellation. All misuse is reported through the failure callback path,
/// never by panicking.
pub struct RequestLifecycle {
    inner: Mutex<LifecycleInner>,
    events: RequestEvents,
}

fn edge_event(edge: GateEdge) -> RequestEvent {
    match edge {
        GateEdge::ActivationStarted => RequestEvent::ActivationStarted,
        GateEdge::Activated => RequestEvent::Activated,
        GateEdge::DeactivationStarted => RequestEvent::DeactivationStarted,
        GateEdge::Deactivated => RequestEvent::Deactivated,
    }
}

impl RequestLifecycle {
    pub fn new(options: RequestOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LifecycleInner {
                state: RequestState::Created,
                gate: AudioGate::default(),
                finalized: false,
                options,
                results: RequestResults::default(),
                id: None,
                outbound: None,
            }),
            events: RequestEvents::new(),
        })
    }

    /// Listener registry for this request's events.
    pub fn events(&self) -> &RequestEvents {
        &self.events
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().unwrap().state
    }

    /// Snapshot of the accumulated outcome.
    pub fn results(&self) -> RequestResults {
        self.inner.lock().unwrap().results.clone()
    }

    /// The id this request is registered under, once assigned.
    pub fn request_id(&self) -> Option<String> {
        self.inner.lock().unwrap().id.clone()
    }

    pub(crate) fn requested_id(&self) -> Option<String> {
        self.inner.lock().unwrap().options.request_id.clone()
    }

    /// Dispatcher setup: assign the id and outbound handle,
    /// `Created → Initialized`.
    pub(crate) fn initialize(
        &self,
        id: String,
        outbound: Arc<OutboundHandle>,
    ) -> Result<(), QueryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RequestState::Created {
            return Err(QueryError::Request(format!(
                "cannot initialize request in state {:?}",
                inner.state
            )));
        }
        inner.id = Some(id);
        inner.outbound = Some(outbound);
        inner.state = RequestState::Initialized;
        Ok(())
    }

    /// Begin transmission: `Initialized → Transmitting` for text requests,
    /// `Initialized → AudioActivating` for audio requests. A wrong state or
    /// failed audio precondition surfaces through the failure path.
    pub fn send(&self) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            let mut fx = Effects {
                outbound: inner.outbound.clone(),
                ..Effects::default()
            };

            if inner.state != RequestState::Initialized {
                let error =
                    QueryError::Request(format!("send() called in state {:?}", inner.state));
                fail_locked(&mut inner, &mut fx, error);
            } else if inner.options.profile.has_audio {
                match inner.options.audio_source.clone() {
                    None => {
                        let error =
                            QueryError::Request("audio request without a capture source".into());
                        fail_locked(&mut inner, &mut fx, error);
                    }
                    Some(source) if !source.ready() => {
                        let error =
                            QueryError::Request("audio capture source is not ready".into());
                        fail_locked(&mut inner, &mut fx, error);
                    }
                    Some(_) => {
                        if let Some(edge) = inner.gate.begin_activation() {
                            fx.events.push(edge_event(edge));
                        }
                        inner.state = RequestState::AudioActivating;
                        fx.send = Some((Some(initial_payload(&inner)), Vec::new()));
                        info!("🎤 Audio query activating");
                    }
                }
            } else {
                inner.state = RequestState::Transmitting;
                fx.send = Some((Some(initial_payload(&inner)), Vec::new()));
                debug!("📤 Text query transmitting");
            }
            fx
        };
        self.perform(fx);
    }

    /// Activation readiness confirmation, delivered as an ordinary
    /// transition: `AudioActivating → AudioOn`, opening the gate and
    /// starting the capture source.
    pub fn audio_activated(&self) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != RequestState::AudioActivating {
                debug!(
                    "audio activation confirmed in state {:?}; ignoring",
                    inner.state
                );
                return;
            }
            let mut fx = Effects::default();
            if let Some(edge) = inner.gate.confirm_activation() {
                inner.state = RequestState::AudioOn;
                fx.events.push(edge_event(edge));
                fx.start_source = inner.options.audio_source.clone();
                info!("🔊 Audio gate open");
            }
            fx
        };
        self.perform(fx);
    }

    /// Write captured audio bytes. Accepted only while the gate is on;
    /// anything else is dropped with a diagnostic, never an error. The
    /// first accepted write drives `AudioOn → Transmitting`.
    pub fn write_audio(&self, bytes: &[u8]) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.gate.accepts_writes() {
                warn!(
                    "🔇 Dropping {} audio bytes while gate is {:?}",
                    bytes.len(),
                    inner.gate.state()
                );
                return;
            }
            if inner.state == RequestState::AudioOn {
                inner.state = RequestState::Transmitting;
            }
            Effects {
                outbound: inner.outbound.clone(),
                send: Some((None, bytes.to_vec())),
                ..Effects::default()
            }
        };
        self.perform(fx);
    }

    /// Apply an intermediate result. Ignored once terminal, and ignored
    /// entirely for requests without partial decoding.
    pub fn apply_partial(&self, data: Value) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finalized || inner.state.is_terminal() {
                debug!("partial result after terminal state; ignoring");
                return;
            }
            if !inner.options.profile.partial_results {
                debug!("partial decoding disabled for this request; ignoring");
                return;
            }
            inner.results.data = Some(data.clone());
            Effects {
                events: vec![RequestEvent::Partial(data)],
                ..Effects::default()
            }
        };
        self.perform(fx);
    }

    /// Apply the final result. Strictly idempotent: once finalized, no
    /// further application has any observable effect. Unseen data is
    /// applied as a partial first so partial and final observers always
    /// see the same data.
    pub fn apply_final(&self, data: Option<Value>, error: Option<String>) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finalized {
                debug!("final result after finalization; ignoring");
                return;
            }
            inner.finalized = true;

            let mut fx = Effects {
                outbound: inner.outbound.clone(),
                ..Effects::default()
            };

            if let Some(data) = &data {
                if inner.results.data.as_ref() != Some(data) {
                    inner.results.data = Some(data.clone());
                    fx.events.push(RequestEvent::Partial(data.clone()));
                }
            }

            deactivate_locked(&mut inner, &mut fx);

            let error = error.filter(|e| !e.is_empty());
            match (data, error) {
                (_, Some(error)) => {
                    inner.state = RequestState::Failed;
                    inner.results.error = Some(error.clone());
                    fx.events.push(RequestEvent::Failed(QueryError::Request(error)));
                }
                (None, None) => {
                    let error = QueryError::Request("no response from service".into());
                    inner.state = RequestState::Failed;
                    inner.results.error = Some(error.to_string());
                    fx.events.push(RequestEvent::Failed(error));
                }
                (Some(data), None) => {
                    inner.state = RequestState::Succeeded;
                    fx.events.push(RequestEvent::Final(data));
                    info!("✅ Query succeeded");
                }
            }
            fx
        };
        self.perform(fx);
    }

    /// Cancel from any non-terminal state; audio is deactivated first.
    /// Idempotent: cancelling twice, or after completion, does nothing.
    pub fn cancel(&self, reason: CancelReason) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finalized {
                debug!("cancel after terminal state; ignoring");
                return;
            }
            inner.finalized = true;

            let mut fx = Effects {
                outbound: inner.outbound.clone(),
                abort: true,
                ..Effects::default()
            };
            deactivate_locked(&mut inner, &mut fx);
            inner.state = RequestState::Canceled;
            info!("🛑 Query cancelled: {}", reason);
            fx.events.push(RequestEvent::Canceled(reason));
            fx
        };
        self.perform(fx);
    }

    /// Caller-requested early termination: accumulated partial data becomes
    /// the final result; with no partial data this behaves as a cancel.
    pub fn complete_early(&self) {
        let data = self.inner.lock().unwrap().results.data.clone();
        match data {
            Some(data) => self.apply_final(Some(data), None),
            None => self.cancel(CancelReason::UserRequested),
        }
    }

    /// Inbound binary payload addressed to this request; surfaced as a
    /// data event for the playback layer.
    pub(crate) fn apply_audio(&self, bytes: Vec<u8>) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.finalized {
                debug!("binary payload after terminal state; ignoring");
                return;
            }
        }
        self.events.emit(&RequestEvent::Audio(bytes));
    }

    /// Failure path shared by local misuse and connection-level errors.
    pub(crate) fn fail(&self, error: QueryError) {
        let fx = {
            let mut inner = self.inner.lock().unwrap();
            let mut fx = Effects::default();
            fail_locked(&mut inner, &mut fx, error);
            fx
        };
        self.perform(fx);
    }

    fn perform(&self, fx: Effects) {
        if let Some(source) = fx.stop_source {
            source.stop();
        }
        if let Some(source) = fx.start_source {
            source.start();
        }

        let mut send_failure = None;
        if let Some((json, binary)) = fx.send {
            match fx.outbound.as_ref() {
                Some(outbound) => {
                    if let Err(e) = (outbound.send)(json.as_ref(), &binary) {
                        send_failure = Some(e);
                    }
                }
                None => {
                    send_failure =
                        Some(QueryError::Request("request has no outbound connection".into()));
                }
            }
        }

        for event in &fx.events {
            self.events.emit(event);
        }

        if fx.abort {
            if let Some(outbound) = fx.outbound.as_ref() {
                (outbound.abort)();
            }
        }

        if let Some(error) = send_failure {
            self.fail(error);
        }
    }
}

/// Embed the assigned request id into the outbound payload.
fn initial_payload(inner: &LifecycleInner) -> Value {
    let mut payload = inner.options.payload.clone();
    if let (Some(id), Some(object)) = (&inner.id, payload.as_object_mut()) {
        object.insert("request_id".to_string(), Value::String(id.clone()));
    }
    payload
}

fn deactivate_locked(inner: &mut LifecycleInner, fx: &mut Effects) {
    let edges = inner.gate.deactivate();
    if edges.is_empty() {
        return;
    }
    // transient mirror state while the gate closes
    if !inner.state.is_terminal() {
        inner.state = RequestState::AudioDeactivating;
    }
    for edge in edges {
        fx.events.push(edge_event(edge));
    }
    fx.stop_source = inner.options.audio_source.clone();
}

fn fail_locked(inner: &mut LifecycleInner, fx: &mut Effects, error: QueryError) {
    if inner.finalized {
        debug!("failure after terminal state; ignoring: {}", error);
        return;
    }
    inner.finalized = true;
    deactivate_locked(inner, fx);
    inner.state = RequestState::Failed;
    inner.results.error = Some(error.to_string());
    fx.events.push(RequestEvent::Failed(error));
}

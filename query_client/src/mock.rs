//! In-memory transport for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::QueryError;
use crate::transport::FrameTransport;

/// Records every outbound frame and can be switched into a failing mode to
/// exercise transport error paths, so tests drive the whole stack without
/// sockets.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    fail_sends: AtomicBool,
    aborts: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every frame passed to `send`, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent_frames(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Make subsequent sends fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl FrameTransport for MockTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), QueryError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueryError::Transport("mock send failure".into()));
        }
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

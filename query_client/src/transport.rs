//! Transport seam: the dispatcher only needs send and abort primitives;
//! inbound bytes are pushed into `RequestDispatcher::route_inbound` by
//! whatever owns the connection's read side.

use log::{debug, error, info};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatcher::RequestDispatcher;
use crate::error::QueryError;

/// Connection-level states reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Injected connection primitives. Connect/close stay with the
/// implementation; the core only writes and occasionally asks for a
/// best-effort abort.
pub trait FrameTransport: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), QueryError>;
    /// Best-effort teardown of an in-flight exchange, requested by
    /// cancellation. Never blocks and never guarantees anything.
    fn abort(&self);
}

/// Connection settings for the TCP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:50061".to_string(),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Blocking TCP implementation of the transport seam.
pub struct TcpTransport {
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
    address: String,
}

impl TcpTransport {
    pub fn connect(config: &TransportConfig) -> Result<Arc<Self>, QueryError> {
        info!("📡 Connecting to query server at {}", config.address);

        let stream = TcpStream::connect(&config.address).map_err(io_err)?;
        stream
            .set_read_timeout(Some(config.read_timeout))
            .map_err(io_err)?;
        stream
            .set_write_timeout(Some(config.write_timeout))
            .map_err(io_err)?;

        let writer = BufWriter::new(stream.try_clone().map_err(io_err)?);

        info!("✅ Connected to query server");

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            stream,
            address: config.address.clone(),
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Pump inbound bytes into the dispatcher until the connection closes.
    /// Read timeouts are quiet keep-alive polls; EOF and hard IO errors end
    /// the loop and fail every pending request via `connection_lost`.
    pub fn spawn_reader(
        &self,
        dispatcher: Arc<RequestDispatcher>,
    ) -> Result<JoinHandle<()>, QueryError> {
        let mut reader = BufReader::new(self.stream.try_clone().map_err(io_err)?);
        let address = self.address.clone();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        dispatcher.connection_lost("connection closed by server");
                        break;
                    }
                    Ok(n) => {
                        debug!("📥 Received {} bytes", n);
                        dispatcher.route_inbound(&buf[..n]);
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        ) =>
                    {
                        // Timeout is normal for responsiveness, keep polling
                        continue;
                    }
                    Err(e) => {
                        error!("❌ IO error reading from {}: {}", address, e);
                        dispatcher.connection_lost(&format!("read failed: {}", e));
                        break;
                    }
                }
            }
            debug!("Reader thread for {} exiting", address);
        });

        Ok(handle)
    }

    /// Close the connection for good; the reader thread will observe EOF.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl FrameTransport for TcpTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), QueryError> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes).map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        debug!("📤 Sent {} bytes", bytes.len());
        Ok(())
    }

    fn abort(&self) {
        // The socket is shared by every request on this connection, so an
        // abort must not tear it down. The in-flight write finishes on its
        // own; cancellation is already effective at the state-machine level.
        debug!("🛑 Abort requested; leaving shared connection open");
    }
}

fn io_err(e: std::io::Error) -> QueryError {
    QueryError::Transport(e.to_string())
}

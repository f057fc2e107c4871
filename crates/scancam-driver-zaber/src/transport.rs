//! Shared serial transport for a chain of controllers.
//!
//! All devices on one serial line share a single [`SerialTransport`]. Writes
//! go through one async mutex so frames never interleave. A background reader
//! task decodes every incoming frame and hands it to the [`PacketHandler`]
//! registered for the frame's address.
//!
//! Handlers are held weakly: dropping a device unregisters it implicitly, and
//! the transport never keeps a device alive.

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use scancam_core::config::SerialConfig;
use scancam_core::limits::SHUTDOWN_TIMEOUT;
use scancam_core::serial::{drain_serial_buffer, SerialPortIO};
use scancam_core::{Result, ScanCamError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::packet::{Packet, FRAME_LEN};

// =============================================================================
// Traits
// =============================================================================

/// Receives frames addressed to one device.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Called from the transport's reader task for every frame from this address.
    ///
    /// Implementations must not wait on further frames from inside this call;
    /// the reader is blocked until it returns.
    async fn handle_packet(&self, packet: Packet);

    /// Called once when the link goes down.
    fn link_closed(&self) {}
}

/// Framed request/response link to the controller chain.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame. Concurrent callers are serialized.
    async fn send(&self, packet: Packet) -> Result<()>;

    /// Route frames from `address` to `handler`.
    fn register(&self, address: u8, handler: Weak<dyn PacketHandler>);

    /// Stop routing frames from `address`.
    fn unregister(&self, address: u8);

    /// Stop the reader and refuse further writes.
    async fn close(&self);

    /// Whether the link is still usable.
    fn is_open(&self) -> bool;
}

type HandlerMap = RwLock<HashMap<u8, Weak<dyn PacketHandler>>>;

// =============================================================================
// SerialTransport
// =============================================================================

/// [`Transport`] over any async byte stream (a serial port, or an in-memory
/// duplex for testing).
pub struct SerialTransport {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    handlers: Arc<HandlerMap>,
    open: Arc<AtomicBool>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    /// Wrap an already open stream and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S: SerialPortIO + 'static>(stream: S) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let handlers: Arc<HandlerMap> = Arc::new(RwLock::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(read_half, handlers.clone(), open.clone()));

        Arc::new(Self {
            writer: Mutex::new(Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>),
            handlers,
            open,
            reader: SyncMutex::new(Some(reader)),
        })
    }

    /// Open the configured serial port, discard stale bytes, and start the reader.
    pub async fn open(config: &SerialConfig) -> anyhow::Result<Arc<Self>> {
        let mut port =
            scancam_core::serial::open_serial_async(&config.port, config.baud_rate, "stage chain")
                .await?;
        drain_serial_buffer(&mut port, config.drain_ms).await;
        tracing::info!(port = %config.port, baud = config.baud_rate, "Opened stage chain serial port");
        Ok(Self::new(port))
    }

    /// Wrap a stream after discarding any stale bytes already buffered on it.
    pub async fn with_drain<S: SerialPortIO + 'static>(mut stream: S, drain_ms: u64) -> Arc<Self> {
        drain_serial_buffer(&mut stream, drain_ms).await;
        Self::new(stream)
    }

    /// Number of addresses with a live handler.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .values()
            .filter(|h| h.strong_count() > 0)
            .count()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&self, packet: Packet) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ScanCamError::Transport("link is closed".into()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet.encode()).await?;
        writer.flush().await?;
        tracing::trace!(%packet, "sent");
        Ok(())
    }

    fn register(&self, address: u8, handler: Weak<dyn PacketHandler>) {
        let mut handlers = self.handlers.write();
        if handlers.insert(address, handler).is_some() {
            tracing::warn!(address, "Replaced existing handler for address");
        }
    }

    fn unregister(&self, address: u8) {
        self.handlers.write().remove(&address);
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
        let _ = self.writer.lock().await.shutdown().await;
        notify_closed(&self.handlers);
        tracing::info!("Stage chain transport closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop<S: SerialPortIO>(
    mut reader: ReadHalf<S>,
    handlers: Arc<HandlerMap>,
    open: Arc<AtomicBool>,
) {
    let mut frame = [0u8; FRAME_LEN];
    loop {
        if let Err(e) = reader.read_exact(&mut frame).await {
            if open.swap(false, Ordering::SeqCst) {
                tracing::error!(error = %e, "Stage chain link lost");
                notify_closed(&handlers);
            }
            return;
        }

        let packet = Packet::decode(&frame);
        tracing::trace!(%packet, "received");

        let handler = handlers.read().get(&packet.address).and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_packet(packet).await,
            None => tracing::debug!(%packet, "Dropping frame from unregistered address"),
        }
    }
}

fn notify_closed(handlers: &HandlerMap) {
    let live: Vec<_> = handlers.read().values().filter_map(Weak::upgrade).collect();
    for handler in live {
        handler.link_closed();
    }
}

/// Serial ports visible on this machine.
pub fn available_ports() -> anyhow::Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<Packet>, AtomicBool);

    #[async_trait]
    impl PacketHandler for Collect {
        async fn handle_packet(&self, packet: Packet) {
            let _ = self.0.send(packet);
        }

        fn link_closed(&self) {
            self.1.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (mut chain, host) = tokio::io::duplex(64);
        let transport = SerialTransport::new(host);

        transport.send(Packet::new(1, 20, 1000)).await.unwrap();

        let mut frame = [0u8; FRAME_LEN];
        chain.read_exact(&mut frame).await.unwrap();
        assert_eq!(Packet::decode(&frame), Packet::new(1, 20, 1000));
    }

    #[tokio::test]
    async fn test_reader_routes_by_address() {
        let (mut chain, host) = tokio::io::duplex(64);
        let transport = SerialTransport::new(host);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let h1: Arc<dyn PacketHandler> = Arc::new(Collect(tx1, AtomicBool::new(false)));
        let h2: Arc<dyn PacketHandler> = Arc::new(Collect(tx2, AtomicBool::new(false)));
        transport.register(1, Arc::downgrade(&h1));
        transport.register(2, Arc::downgrade(&h2));
        assert_eq!(transport.handler_count(), 2);

        chain.write_all(&Packet::new(2, 1, 0).encode()).await.unwrap();
        chain.write_all(&Packet::new(9, 1, 0).encode()).await.unwrap();
        chain.write_all(&Packet::new(1, 20, 5).encode()).await.unwrap();

        let p2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();
        let p1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        assert_eq!(p2, Some(Packet::new(2, 1, 0)));
        assert_eq!(p1, Some(Packet::new(1, 20, 5)));
    }

    #[tokio::test]
    async fn test_link_loss_notifies_handlers() {
        let (chain, host) = tokio::io::duplex(64);
        let transport = SerialTransport::new(host);

        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Collect(tx, AtomicBool::new(false)));
        let dyn_handler: Arc<dyn PacketHandler> = handler.clone();
        transport.register(1, Arc::downgrade(&dyn_handler));

        drop(chain);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!transport.is_open());
        assert!(handler.1.load(Ordering::SeqCst));
        assert!(transport.send(Packet::new(1, 1, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_chain, host) = tokio::io::duplex(64);
        let transport = SerialTransport::new(host);
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
    }
}

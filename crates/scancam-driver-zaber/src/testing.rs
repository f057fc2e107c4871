//! In-process transport for unit tests.
//!
//! Every sent frame is recorded and passed to a responder closure, whose
//! replies are delivered to the registered handler after their delay.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use scancam_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::packet::Packet;
use crate::transport::{PacketHandler, Transport};

type Responder = dyn Fn(Packet) -> Vec<(Duration, Packet)> + Send + Sync;

pub(crate) struct TestTransport {
    responder: Box<Responder>,
    handlers: Arc<RwLock<HashMap<u8, Weak<dyn PacketHandler>>>>,
    sent: Mutex<Vec<Packet>>,
}

impl TestTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(Packet) -> Vec<(Duration, Packet)> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Echo every frame back after `delay`.
    pub(crate) fn echo(delay: Duration) -> Arc<Self> {
        Self::new(move |packet| vec![(delay, packet)])
    }

    pub(crate) fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, packet: Packet) -> Result<()> {
        self.sent.lock().push(packet);
        for (delay, reply) in (self.responder)(packet) {
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let handler = handlers.read().get(&reply.address).and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    handler.handle_packet(reply).await;
                }
            });
        }
        Ok(())
    }

    fn register(&self, address: u8, handler: Weak<dyn PacketHandler>) {
        self.handlers.write().insert(address, handler);
    }

    fn unregister(&self, address: u8) {
        self.handlers.write().remove(&address);
    }

    async fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}

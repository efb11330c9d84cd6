use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::link::frame::Frame;

/// The boundary to the transport: an inbound stream of decoded frames plus a send primitive.
///
/// The underlying bus is broadcast-style and lossy - frames may be dropped, duplicated or
///  reordered, and every subscriber sees every frame regardless of addressing. Address
///  filtering is the receiver's job. The connection also owns the sender's monotonic
///  link-level sequence counter.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkConnection: Send + Sync + 'static {
    /// A new subscription seeing every frame decoded from the bus from this moment on.
    fn subscribe_frames(&self) -> broadcast::Receiver<Frame>;

    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()>;

    fn next_sequence(&self) -> u8;
}

/// An in-process bus connecting any number of [LoopbackConnection]s: every frame sent by one
///  connection is delivered to all subscribers of all connections. Delivery is reliable and
///  ordered as long as subscribers keep up; slow subscribers lose the oldest frames, which is
///  exactly the contract real transports provide.
pub struct LoopbackBus {
    bus: broadcast::Sender<Frame>,
}
impl LoopbackBus {
    pub fn new(capacity: usize) -> LoopbackBus {
        let (bus, _) = broadcast::channel(capacity);
        LoopbackBus { bus }
    }

    pub fn connect(&self) -> Arc<LoopbackConnection> {
        Arc::new(LoopbackConnection {
            bus: self.bus.clone(),
            sequence: AtomicU8::new(0),
        })
    }
}

pub struct LoopbackConnection {
    bus: broadcast::Sender<Frame>,
    sequence: AtomicU8,
}
#[async_trait]
impl LinkConnection for LoopbackConnection {
    fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.bus.subscribe()
    }

    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        trace!("sending frame {:?}", frame);
        // a send without any subscriber is a frame nobody was listening for, not an error
        let _ = self.bus.send(frame);
        Ok(())
    }

    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

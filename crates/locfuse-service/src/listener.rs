//! Delivery endpoints for fused locations.

use crate::error::ListenerError;
use locfuse_core::types::Position;
use std::sync::Arc;
use tracing::debug;

/// Receives fused locations for an update request.
///
/// Called with the session registry locked, so implementations must not
/// block. An error marks the listener broken and drops its requests.
pub trait LocationListener: Send + Sync {
    fn on_location(&self, position: &Position) -> Result<(), ListenerError>;
}

impl<F> LocationListener for F
where
    F: Fn(&Position) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_location(&self, position: &Position) -> Result<(), ListenerError> {
        self(position)
    }
}

/// Returns true if both handles point at the same listener object.
pub fn same_listener(a: &Arc<dyn LocationListener>, b: &Arc<dyn LocationListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Listener forwarding into a bounded channel.
///
/// A full channel drops the position; a dropped receiver breaks the listener.
pub struct ChannelListener {
    sender: flume::Sender<Position>,
}

impl ChannelListener {
    pub fn channel(capacity: usize) -> (Arc<Self>, flume::Receiver<Position>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Arc::new(Self { sender }), receiver)
    }
}

impl LocationListener for ChannelListener {
    fn on_location(&self, position: &Position) -> Result<(), ListenerError> {
        match self.sender.try_send(position.clone()) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                debug!("Listener channel full, dropping position");
                Ok(())
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(ListenerError::new("receiver dropped"))
            }
        }
    }
}

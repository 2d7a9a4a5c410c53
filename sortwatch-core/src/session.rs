//! Live-protocol capability consumed by supervisors.
//!
//! The core never speaks the machine wire protocol itself: a `Connector`
//! opens sessions and a `Session` turns a tag subscription into a stream
//! of `TagUpdate`s. Production uses the WebSocket connector in `ws`;
//! tests plug in mocks.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{MachineConfig, TagUpdate};

/// Buffered updates per session before backpressure applies.
pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Establish a live session to the machine. Failures here are
    /// transient by definition and drive the supervisor into backoff.
    fn connect(
        &self,
        config: &MachineConfig,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

pub trait Session: Send + 'static {
    /// Subscribe to the given protocol-level tag names. The receiver
    /// closing (sender dropped) signals loss of the underlying session.
    fn subscribe(
        &mut self,
        tags: &[String],
    ) -> impl Future<Output = Result<mpsc::Receiver<TagUpdate>>> + Send;

    /// Release the live session. Must be safe to call on a session whose
    /// transport already died.
    fn close(self) -> impl Future<Output = ()> + Send;
}

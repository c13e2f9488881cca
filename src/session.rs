//! Session handles.
//!
//! The transport layer owns the actual connection; the hub holds a
//! [`SessionHandle`] it can push frames through and observe closure on.
//! Agent actors keep only a weak reference so a dropped connection is never
//! kept alive by the hub side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::OutboundFrame;
use crate::{HubError, Result};

/// Outbound side of one agent connection.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Delivers a frame to the agent. Fails once the session is closed.
    async fn send(&self, frame: OutboundFrame) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Marks the session closed; further sends fail. The transport driver
    /// calls this exactly once when the underlying connection drops.
    fn close(&self);
}

/// Channel-backed session used by the in-process transport driver and by
/// tests. The receiving half belongs to whoever drains frames to the wire.
pub struct ChannelSession {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    open: AtomicBool,
}

impl ChannelSession {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                open: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

#[async_trait]
impl SessionHandle for ChannelSession {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(HubError::SessionClosed);
        }
        self.tx.send(frame).map_err(|_| HubError::SessionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails() {
        let (session, mut rx) = ChannelSession::new();

        session
            .send(OutboundFrame::Identified {
                agent_id: "a1".to_string(),
            })
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());

        session.close();
        let result = session
            .send(OutboundFrame::Identified {
                agent_id: "a1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(HubError::SessionClosed)));
    }
}

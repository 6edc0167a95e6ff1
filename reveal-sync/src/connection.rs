//! Handle to one live duplex channel.
//!
//! The socket itself is owned by a per-connection writer task. Everyone else
//! holds a [`ConnectionHandle`], which only enqueues frames onto that task's
//! bounded queue. Enqueueing never waits, so a stalled peer can fill its own
//! queue but never blocks the registry lock or the other peers.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

pub type ConnectionId = Uuid;

/// One unit of work for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Pre-encoded JSON text, shared across every recipient of a broadcast.
    Text(Arc<str>),
    /// Heartbeat probe.
    Ping,
    /// Send a close frame and stop writing.
    Close,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Outbound queue of connection {0} is closed")]
    Closed(ConnectionId),
    #[error("Outbound queue of connection {0} is full")]
    Full(ConnectionId),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Cloneable sender side of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Encode and enqueue a single message.
    pub fn send(&self, message: &ServerMessage) -> Result<(), DeliveryError> {
        let text: Arc<str> = message.encode()?.into();
        self.send_text(text)
    }

    /// Enqueue pre-encoded text (broadcast fast path).
    pub fn send_text(&self, text: Arc<str>) -> Result<(), DeliveryError> {
        self.push(Frame::Text(text))
    }

    pub fn ping(&self) -> Result<(), DeliveryError> {
        self.push(Frame::Ping)
    }

    /// Ask the writer task to send a close frame and stop.
    pub fn close(&self) -> Result<(), DeliveryError> {
        self.push(Frame::Close)
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_encodes_once() {
        let (handle, mut rx) = ConnectionHandle::new(4);
        handle.send(&ServerMessage::ImageUpdated).unwrap();

        match rx.recv().await.unwrap() {
            Frame::Text(text) => assert_eq!(&*text, r#"{"type":"image_updated"}"#),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let (handle, mut rx) = ConnectionHandle::new(8);
        handle.ping().unwrap();
        handle.send_text("a".into()).unwrap();
        handle.close().unwrap();

        assert_eq!(rx.recv().await.unwrap(), Frame::Ping);
        assert_eq!(rx.recv().await.unwrap(), Frame::Text("a".into()));
        assert_eq!(rx.recv().await.unwrap(), Frame::Close);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (handle, _rx) = ConnectionHandle::new(1);
        handle.ping().unwrap();
        let err = handle.ping().unwrap_err();
        assert!(matches!(err, DeliveryError::Full(id) if id == handle.id()));
    }

    #[test]
    fn test_closed_queue_is_reported() {
        let (handle, rx) = ConnectionHandle::new(4);
        drop(rx);
        assert!(handle.is_closed());
        let err = handle.send(&ServerMessage::ImageUpdated).unwrap_err();
        assert!(matches!(err, DeliveryError::Closed(_)));
    }

    #[test]
    fn test_handles_are_distinct() {
        let (a, _rx_a) = ConnectionHandle::new(1);
        let (b, _rx_b) = ConnectionHandle::new(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}

//! In-process virtual CAN bus
//!
//! Every node attached to a `VirtualBus` sees the frames sent by all other
//! nodes, like controllers on a shared wire, but not its own.

use super::{check_frame, FrameReceiver, FrameSender};
use crate::types::{Frame, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct Envelope {
    origin: usize,
    frame: Frame,
}

/// Shared virtual bus
#[derive(Debug)]
pub struct VirtualBus {
    tx: broadcast::Sender<Envelope>,
    next_node: AtomicUsize,
}

impl VirtualBus {
    /// Create a bus buffering up to `capacity` frames per lagging node
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_node: AtomicUsize::new(0),
        }
    }

    /// Attach a new node and return its two halves
    pub fn node(&self) -> (VirtualSender, VirtualReceiver) {
        let origin = self.next_node.fetch_add(1, Ordering::Relaxed);
        let sender = VirtualSender {
            origin,
            tx: self.tx.clone(),
        };
        let receiver = VirtualReceiver {
            origin,
            rx: self.tx.subscribe(),
        };
        (sender, receiver)
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Sending half of a virtual node
#[derive(Debug, Clone)]
pub struct VirtualSender {
    origin: usize,
    tx: broadcast::Sender<Envelope>,
}

#[async_trait]
impl FrameSender for VirtualSender {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        check_frame(frame)?;

        // Nobody listening is not an error on a real bus either
        let _ = self.tx.send(Envelope {
            origin: self.origin,
            frame: frame.clone(),
        });
        Ok(())
    }
}

/// Receiving half of a virtual node
#[derive(Debug)]
pub struct VirtualReceiver {
    origin: usize,
    rx: broadcast::Receiver<Envelope>,
}

impl VirtualReceiver {
    /// Next frame from another node if one is already queued
    pub fn try_recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(Ok(envelope.frame)),
                Err(broadcast::error::TryRecvError::Lagged(lost)) => {
                    return Some(Err(TransportError::Overrun(lost)))
                }
                Err(_) => return None,
            }
        }
    }
}

#[async_trait]
impl FrameReceiver for VirtualReceiver {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(Ok(envelope.frame)),
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    return Some(Err(TransportError::Overrun(lost)))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nodes_see_each_other_but_not_themselves() {
        let bus = VirtualBus::new(16);
        let (tx_a, mut rx_a) = bus.node();
        let (tx_b, mut rx_b) = bus.node();

        tx_a.send(&Frame::new(0x100, vec![1])).await.unwrap();
        tx_b.send(&Frame::new(0x200, vec![2])).await.unwrap();

        let frame = rx_b.recv().await.unwrap().unwrap();
        assert_eq!(frame.id, 0x100);

        let frame = rx_a.recv().await.unwrap().unwrap();
        assert_eq!(frame.id, 0x200);

        assert!(rx_a.try_recv().is_none());
        assert!(rx_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_invalid_frame_rejected() {
        let bus = VirtualBus::new(16);
        let (tx, _rx) = bus.node();
        let result = tx.send(&Frame::new(0x900, vec![0; 8])).await;
        assert!(matches!(result, Err(TransportError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn test_overrun_reported() {
        let bus = VirtualBus::new(2);
        let (tx, _) = bus.node();
        let (_, mut rx) = bus.node();

        for i in 0..5u8 {
            tx.send(&Frame::new(0x100, vec![i])).await.unwrap();
        }

        assert!(matches!(rx.recv().await, Some(Err(TransportError::Overrun(3)))));
        assert_eq!(rx.recv().await.unwrap().unwrap().data, vec![3]);
    }

    #[tokio::test]
    async fn test_closed_when_bus_dropped() {
        let bus = VirtualBus::new(4);
        let (tx, mut rx) = bus.node();
        drop(tx);
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}

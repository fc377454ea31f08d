//! CAN bus transports
//!
//! The bridge only talks to the bus through these two traits. A transport is
//! usually split into one sender shared by every scheduler task and one
//! receiver owned by the receive pump.

use crate::types::{Frame, TransportError};
use async_trait::async_trait;

pub mod virtual_bus;

#[cfg(feature = "socketcan")]
pub mod socketcan;

pub use virtual_bus::{VirtualBus, VirtualReceiver, VirtualSender};

/// Outgoing half of a transport
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Put one frame on the bus
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;
}

/// Incoming half of a transport
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next frame from the bus; `None` once the transport is closed
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Highest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Reject frames no CAN controller could put on the wire
pub fn check_frame(frame: &Frame) -> Result<(), TransportError> {
    let max_id = if frame.is_extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    };

    if frame.id > max_id {
        return Err(TransportError::InvalidFrame(format!(
            "identifier 0x{:X} exceeds 0x{:X}",
            frame.id, max_id
        )));
    }
    if frame.data.len() > crate::signals::MAX_MESSAGE_SIZE {
        return Err(TransportError::InvalidFrame(format!(
            "{} data bytes",
            frame.data.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_frame() {
        assert!(check_frame(&Frame::new(0x7FF, vec![0; 8])).is_ok());
        assert!(check_frame(&Frame::new(0x800, vec![0; 8])).is_err());
        assert!(check_frame(&Frame::extended(0x800, vec![0; 8])).is_ok());
        assert!(check_frame(&Frame::extended(0x2000_0000, vec![])).is_err());
        assert!(check_frame(&Frame::new(0x1, vec![0; 65])).is_err());
    }
}

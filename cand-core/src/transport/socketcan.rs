//! Linux SocketCAN transport
//!
//! One raw socket serves both halves. Reading happens on a blocking thread
//! that forwards frames into a bounded queue; writes run on tokio's blocking
//! pool. The socket never receives the frames it sent itself, while other
//! sockets on the host (candump and the like) still see them through the
//! kernel loopback.

use super::{check_frame, FrameReceiver, FrameSender};
use crate::types::{Frame, TransportError};
use async_trait::async_trait;
use socketcan::{
    CanFrame as SocketCanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Socket,
    SocketOptions, StandardId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read timeout used to poll the shutdown flag
const READ_POLL: Duration = Duration::from_millis(100);

/// Open `interface` and return its sending and receiving halves
pub fn open(
    interface: &str,
    queue_capacity: usize,
) -> Result<(SocketCanSender, SocketCanReceiver), TransportError> {
    log::info!("Opening SocketCAN interface {}", interface);

    let socket = CanSocket::open(interface)?;
    socket.set_read_timeout(READ_POLL)?;
    // Echoes of our own transmissions would overwrite newer commanded values
    socket.set_recv_own_msgs(false)?;
    let socket = Arc::new(socket);

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));

    let reader_socket = Arc::clone(&socket);
    let reader_shutdown = Arc::clone(&shutdown);
    let reader_interface = interface.to_string();
    tokio::task::spawn_blocking(move || {
        read_loop(&reader_socket, tx, reader_shutdown, reader_interface);
    });

    Ok((
        SocketCanSender { socket },
        SocketCanReceiver { rx, shutdown },
    ))
}

fn read_loop(
    socket: &CanSocket,
    tx: mpsc::Sender<Result<Frame, TransportError>>,
    shutdown: Arc<AtomicBool>,
    interface: String,
) {
    log::debug!("SocketCAN read loop started on {}", interface);

    while !shutdown.load(Ordering::SeqCst) {
        let item = match socket.read_frame() {
            Ok(SocketCanFrame::Data(frame)) => Ok(Frame {
                id: frame.raw_id(),
                is_extended: frame.is_extended(),
                data: frame.data().to_vec(),
            }),
            Ok(SocketCanFrame::Remote(_)) => continue,
            Ok(SocketCanFrame::Error(frame)) => {
                log::warn!("Error frame on {}: {:?}", interface, frame);
                continue;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                log::error!("Read from {} failed: {}", interface, e);
                let _ = tx.blocking_send(Err(TransportError::IoError(e)));
                break;
            }
        };

        if tx.blocking_send(item).is_err() {
            break;
        }
    }

    log::debug!("SocketCAN read loop on {} terminated", interface);
}

/// Build the kernel frame for `frame`
fn to_socketcan_frame(frame: &Frame) -> Result<SocketCanFrame, TransportError> {
    check_frame(frame)?;

    if frame.is_extended {
        ExtendedId::new(frame.id).and_then(|id| SocketCanFrame::new(id, &frame.data))
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .and_then(|id| SocketCanFrame::new(id, &frame.data))
    }
    .ok_or_else(|| TransportError::InvalidFrame(frame.to_string()))
}

/// Sending half of a SocketCAN interface
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

#[async_trait]
impl FrameSender for SocketCanSender {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let socket_frame = to_socketcan_frame(frame)?;

        // A full transmit queue blocks the write; keep it off the async workers
        let socket = Arc::clone(&self.socket);
        tokio::task::spawn_blocking(move || socket.write_frame(&socket_frame))
            .await
            .map_err(|_| TransportError::Closed)??;
        Ok(())
    }
}

/// Receiving half of a SocketCAN interface
pub struct SocketCanReceiver {
    rx: mpsc::Receiver<Result<Frame, TransportError>>,
    shutdown: Arc<AtomicBool>,
}

#[async_trait]
impl FrameReceiver for SocketCanReceiver {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

impl Drop for SocketCanReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    /// Interface used by the tests below; they are skipped when it is missing
    const TEST_INTERFACE: &str = "vcan0";

    #[test]
    fn test_frame_conversion() {
        let standard = to_socketcan_frame(&Frame::new(0x100, vec![0x2B, 0x02])).unwrap();
        assert!(!standard.is_extended());
        assert_eq!(standard.raw_id(), 0x100);
        assert_eq!(standard.data(), &[0x2B, 0x02]);

        let extended = to_socketcan_frame(&Frame {
            id: 0x0CFF_F000,
            is_extended: true,
            data: vec![1; 8],
        })
        .unwrap();
        assert!(extended.is_extended());
        assert_eq!(extended.raw_id(), 0x0CFF_F000);

        let too_long = to_socketcan_frame(&Frame::new(0x100, vec![0; 9]));
        assert!(matches!(too_long, Err(TransportError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn test_own_frames_not_received() {
        let Ok((sender, mut receiver)) = open(TEST_INTERFACE, 16) else {
            eprintln!("{} not available, skipping", TEST_INTERFACE);
            return;
        };

        sender
            .send(&Frame::new(0x100, vec![0x64, 0x00]))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(300), receiver.recv())
            .await
            .is_err());

        // Frames from other sockets still arrive
        let peer = CanSocket::open(TEST_INTERFACE).unwrap();
        peer.write_frame(&to_socketcan_frame(&Frame::new(0x101, vec![7])).unwrap())
            .unwrap();
        let frame = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.id, 0x101);
        assert_eq!(frame.data, vec![7]);
    }
}

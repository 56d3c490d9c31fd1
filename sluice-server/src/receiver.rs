use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use sluice::message::DEFAULT_CODEC;
use sluice::{InputBuffer, RawMessage, SluiceError};
use tracing::{debug, info, warn};

/// How often a blocked receive wakes up to check for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One bound UDP socket feeding the input buffer.
#[derive(Debug)]
pub struct UdpReceiver {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpReceiver {
    /// Bind `addr`, asking the kernel for `recv_buffer_bytes` of receive buffer.
    pub fn bind(addr: SocketAddr, recv_buffer_bytes: usize) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.set_recv_buffer_size(recv_buffer_bytes) {
            warn!(%addr, requested = recv_buffer_bytes, "Unable to size receive buffer: {}", err);
        }
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let granted = socket.recv_buffer_size().unwrap_or(0);
        if granted < recv_buffer_bytes {
            warn!(
                %addr,
                requested = recv_buffer_bytes,
                granted,
                "Kernel granted a smaller receive buffer than requested"
            );
        }

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive on a dedicated thread until `running` clears or the pipeline shuts down.
    /// The thread returns the number of datagrams accepted.
    ///
    /// Datagrams longer than `max_datagram_bytes` are dropped, never truncated.
    pub fn spawn(
        self,
        input: InputBuffer,
        running: Arc<AtomicBool>,
        max_datagram_bytes: usize,
    ) -> io::Result<JoinHandle<u64>> {
        thread::Builder::new()
            .name(format!("udp-{}", self.local_addr))
            .spawn(move || self.run(&input, &running, max_datagram_bytes))
    }

    fn run(self, input: &InputBuffer, running: &AtomicBool, max_datagram_bytes: usize) -> u64 {
        info!(addr = %self.local_addr, "Receiving datagrams");
        // One spare byte tells an oversized datagram apart from one that fits exactly
        let mut buf = vec![0u8; max_datagram_bytes + 1];
        let mut received = 0u64;
        let mut oversized = 0u64;

        while running.load(Ordering::Acquire) {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(read) => read,
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(addr = %self.local_addr, "Receive failed: {}", err);
                    continue;
                }
            };
            if len == 0 {
                continue;
            }
            if len > max_datagram_bytes {
                oversized += 1;
                warn!(
                    addr = %self.local_addr,
                    %peer,
                    max_datagram_bytes,
                    "Dropping oversized datagram"
                );
                continue;
            }

            let raw = RawMessage::new(buf[..len].to_vec())
                .with_codec(DEFAULT_CODEC)
                .with_remote(peer);
            match input.insert(raw) {
                Ok(()) => received += 1,
                Err(SluiceError::Shutdown) => {
                    debug!(addr = %self.local_addr, "Pipeline shut down, receiver stopping");
                    break;
                }
                Err(err) => warn!(addr = %self.local_addr, %peer, "Unable to insert datagram: {}", err),
            }
        }

        info!(addr = %self.local_addr, received, oversized, "Receiver stopped");
        received
    }
}

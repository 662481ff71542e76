//! UDP link
//!
//! Carries one frame per datagram. A link configured without a peer learns it
//! from the first inbound datagram, which is how a server answers a client
//! it has never heard of.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skylink_core::{LinkConfig, MAX_FRAME_LEN};

use crate::transport::{InboundSink, Transport, TransportError};

/// Datagram buffer; oversized datagrams still reach the sink and fail to decode
const RECV_BUFFER: usize = 2048;

/// [`Transport`] over a tokio UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
    peer: RwLock<Option<SocketAddr>>,
}

impl UdpTransport {
    /// Bind to `config.bind`
    pub async fn bind(config: &LinkConfig) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.bind).await?;
        info!("UDP link bound to {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket,
            peer: RwLock::new(config.peer),
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.write() = Some(peer);
    }

    /// Receive datagrams and hand them to `sink` until the socket fails
    pub fn spawn_receiver(self: &Arc<Self>, sink: Arc<dyn InboundSink>) -> JoinHandle<()> {
        let link = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let (len, from) = match link.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        break;
                    }
                };
                link.learn(from);
                sink.handle_inbound(&buf[..len]);
            }
        })
    }

    fn learn(&self, from: SocketAddr) {
        let mut peer = self.peer.write();
        if peer.is_none() {
            debug!("learned peer {}", from);
            *peer = Some(from);
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::TooLarge {
                size: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let peer = self.peer().ok_or(TransportError::NoPeer)?;
        self.socket
            .try_send_to(frame, peer)
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

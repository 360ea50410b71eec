use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use semver::Version;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::ProtocolCodec;
use crate::descriptor::{Descriptor, TransportKind};
use crate::error::{TransportError, TransportResult};
use crate::frame::{Frame, PACKET_SIZE, PacketDecoder, encode_packets};
use crate::message::Message;
use crate::transport::{AcquireInput, Transport};

const PING: &[u8] = b"PINGPING";
const PONG: &[u8] = b"PONGPONG";
const PING_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);

pub const DEFAULT_EMULATOR_ADDR: &str = "127.0.0.1:21324";

/// Transport speaking the v1 packet protocol to emulators over UDP.
///
/// Sessions are tracked locally, the way the bridge tracks them for USB
/// devices: one live session id per path, replaced on every acquire.
pub struct UdpTransport {
    codec: Arc<dyn ProtocolCodec>,
    addresses: Vec<SocketAddr>,
    sockets: tokio::sync::Mutex<HashMap<String, Arc<UdpSocket>>>,
    sessions: Mutex<HashMap<String, String>>,
    next_session: AtomicU64,
    cancels: Mutex<HashMap<String, Arc<Notify>>>,
    read_timeout: Duration,
}

fn path_of(addr: &SocketAddr) -> String {
    format!("udp:{addr}")
}

impl UdpTransport {
    pub fn new(addresses: Vec<SocketAddr>, codec: Arc<dyn ProtocolCodec>) -> Self {
        Self {
            codec,
            addresses,
            sockets: tokio::sync::Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            cancels: Mutex::new(HashMap::new()),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn addr_for_path(&self, path: &str) -> TransportResult<SocketAddr> {
        self.addresses
            .iter()
            .find(|addr| path_of(addr) == path)
            .copied()
            .ok_or_else(|| TransportError::DeviceNotFound(path.to_string()))
    }

    fn path_for_session(&self, session: &str) -> TransportResult<String> {
        self.sessions
            .lock()
            .iter()
            .find(|(_, live)| live.as_str() == session)
            .map(|(path, _)| path.clone())
            .ok_or(TransportError::SessionNotFound)
    }

    fn cancel_notify(&self, path: &str) -> Arc<Notify> {
        self.cancels.lock().entry(path.to_string()).or_default().clone()
    }

    async fn socket(&self, path: &str) -> TransportResult<Arc<UdpSocket>> {
        let mut sockets = self.sockets.lock().await;
        if let Some(socket) = sockets.get(path) {
            return Ok(socket.clone());
        }
        let addr = self.addr_for_path(path)?;
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        socket.connect(addr).await?;
        let socket = Arc::new(socket);
        sockets.insert(path.to_string(), socket.clone());
        Ok(socket)
    }

    async fn ping(&self, path: &str) -> bool {
        let Ok(socket) = self.socket(path).await else {
            return false;
        };
        if socket.send(PING).await.is_err() {
            return false;
        }
        let mut buf = [0u8; PACKET_SIZE];
        loop {
            match timeout(PING_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(Ok(len)) if &buf[..len] == PONG => return true,
                // Drain stale report packets from an aborted exchange.
                Ok(Ok(_)) => continue,
                _ => return false,
            }
        }
    }

    async fn write_message(&self, socket: &UdpSocket, message: &Message) -> TransportResult<()> {
        let (msg_type, payload) = self.codec.encode(message)?;
        let packets = encode_packets(&Frame { msg_type, payload }, PACKET_SIZE)?;
        debug!(message = %message.name, packets = packets.len(), "udp write");
        for packet in packets {
            socket.send(&packet).await?;
        }
        Ok(())
    }

    async fn read_message(&self, path: &str, socket: &UdpSocket) -> TransportResult<Message> {
        let cancel = self.cancel_notify(path);
        let mut decoder = PacketDecoder::new();
        let mut buf = [0u8; PACKET_SIZE];
        loop {
            let len = tokio::select! {
                _ = cancel.notified() => return Err(TransportError::Cancelled),
                received = timeout(self.read_timeout, socket.recv(&mut buf)) => {
                    received.map_err(|_| TransportError::Timeout)??
                }
            };
            if &buf[..len] == PONG {
                continue;
            }
            if let Some(frame) = decoder.push(&buf[..len])? {
                let message = self.codec.decode(frame.msg_type, &frame.payload)?;
                debug!(message = %message.name, "udp read");
                return Ok(message);
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Emulator
    }

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>> {
        let mut out = Vec::new();
        for addr in &self.addresses {
            let path = path_of(addr);
            if !self.ping(&path).await {
                continue;
            }
            let mut descriptor = Descriptor::new(path.clone(), TransportKind::Emulator);
            descriptor.session = self.sessions.lock().get(&path).cloned();
            out.push(descriptor);
        }
        Ok(out)
    }

    async fn acquire(&self, input: AcquireInput) -> TransportResult<String> {
        self.addr_for_path(&input.path)?;
        let mut sessions = self.sessions.lock();
        let current = sessions.get(&input.path).cloned();
        if let Some(previous) = input.previous_session.as_deref()
            && current.as_deref() != Some(previous)
        {
            return Err(TransportError::WrongPreviousSession);
        }
        let session = self.next_session.fetch_add(1, Ordering::SeqCst).to_string();
        sessions.insert(input.path.clone(), session.clone());
        debug!(path = %input.path, session = %session, "udp acquire");
        Ok(session)
    }

    async fn release(&self, session: &str, on_close: bool) -> TransportResult<()> {
        let path = self.path_for_session(session)?;
        self.sessions.lock().remove(&path);
        if on_close {
            self.sockets.lock().await.remove(&path);
        }
        debug!(path = %path, session = %session, "udp release");
        Ok(())
    }

    async fn call(&self, session: &str, message: Message) -> TransportResult<Message> {
        let path = self.path_for_session(session)?;
        let socket = self.socket(&path).await?;
        self.write_message(&socket, &message).await?;
        self.read_message(&path, &socket).await
    }

    async fn post(&self, session: &str, message: Message) -> TransportResult<()> {
        let path = self.path_for_session(session)?;
        let socket = self.socket(&path).await?;
        self.write_message(&socket, &message).await
    }

    async fn cancel(&self, session: &str) -> TransportResult<()> {
        let path = self.path_for_session(session)?;
        debug!(path = %path, session = %session, "udp cancel");
        self.cancel_notify(&path).notify_waiters();
        Ok(())
    }

    fn reconfigure(&self, firmware: &Version) -> TransportResult<()> {
        if let Err(error) = self.codec.select_schema(firmware) {
            warn!(firmware = %firmware, "keeping current schema: {error}");
        }
        Ok(())
    }
}

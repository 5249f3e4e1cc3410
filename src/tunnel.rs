use std::{collections::HashMap, error, fmt, sync::Arc, sync::Mutex};

use futures_util::{stream::StreamExt, SinkExt};
use log::{debug, info, trace, warn};
use rand::{rngs::OsRng, Rng};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};

use crate::{
    ip::{
        subnet::{self, SubnetError},
        IpPacket, PacketVerdict,
    },
    logger::fmt_slice_hex,
    nat::{Nat, NatError},
    obfuscation::{self, DelayWindow, HandshakeStep, ObfuscationError, WeightedSelector},
    tun::{TunDevice, TunError, TunPool, MTU},
};

const OUTBOUND_QUEUE_SIZE: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn new(id: u64) -> TunnelId {
        TunnelId(id)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

/// Send handles of all live sessions, for delivering inbound packets to
/// the tunnel that owns the connection. Frames for dead or backlogged
/// tunnels are dropped.
pub struct SessionRegistry {
    senders: Mutex<HashMap<TunnelId, mpsc::Sender<Vec<u8>>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, tunnel: TunnelId, sender: mpsc::Sender<Vec<u8>>) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(tunnel, sender);
        }
    }

    fn unregister(&self, tunnel: TunnelId) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&tunnel);
        }
    }

    fn dispatch(&self, tunnel: TunnelId, frame: Vec<u8>) -> bool {
        let sender = match self.senders.lock() {
            Ok(senders) => match senders.get(&tunnel) {
                Some(sender) => sender.clone(),
                None => return false,
            },
            Err(_) => return false,
        };
        sender.try_send(frame).is_ok()
    }
}

/// One client connection: a leased TUN interface bridged to a WebSocket
/// channel, with obfuscation on the wire side.
pub struct TunnelSession {
    id: TunnelId,
    device: TunDevice,
    nat: Arc<Nat>,
    registry: Arc<SessionRegistry>,
    pool: Arc<TunPool>,
    cover_delays: DelayWindow,
    handshake_actions: Arc<WeightedSelector<obfuscation::HandshakeAction>>,
}

impl TunnelSession {
    pub fn new(
        id: TunnelId,
        device: TunDevice,
        nat: Arc<Nat>,
        registry: Arc<SessionRegistry>,
        pool: Arc<TunPool>,
        cover_delays: DelayWindow,
        handshake_actions: Arc<WeightedSelector<obfuscation::HandshakeAction>>,
    ) -> TunnelSession {
        TunnelSession {
            id,
            device,
            nat,
            registry,
            pool,
            cover_delays,
            handshake_actions,
        }
    }

    /// Runs the session to completion and tears it down: handshake
    /// obfuscation, hello, then the forwarding loops until the channel
    /// closes. The NAT mappings and the interface are always released,
    /// exactly once.
    pub async fn run(mut self, ws_stream: WebSocketStream<TcpStream>) {
        info!(
            "{} starting on {} ({}, {})",
            self.id,
            self.device.name(),
            self.device.ipv4_subnet(),
            self.device.ipv6_subnet()
        );
        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_SIZE);
        self.registry.register(self.id, sender.clone());

        // All outbound frames funnel through one queue, preserving order.
        let writer = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                if ws_sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        if let Err(err) = self.start_session(&sender).await {
            warn!("{} failed to start: {}", self.id, err);
        } else {
            let mut buf = vec![0u8; MTU];
            let mut cover_deadline = self.next_cover_deadline();
            loop {
                tokio::select! {
                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(WsMessage::Binary(data))) => {
                                self.handle_wire_frame(data.as_ref()).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                debug!("{} channel error: {}", self.id, err);
                                break;
                            }
                        }
                    }
                    read = self.device.read_packet(&mut buf) => {
                        match read {
                            Ok(length) => self.handle_inbound_packet(&mut buf[..length], &sender),
                            Err(err) => {
                                warn!("{} failed to read from {}: {}", self.id, self.device.name(), err);
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(cover_deadline) => {
                        let frame = obfuscation::noise(MTU, &mut rand::thread_rng());
                        if sender.try_send(frame).is_err() {
                            trace!("{} dropped cover frame, queue is full", self.id);
                        }
                        cover_deadline = self.next_cover_deadline();
                    }
                }
            }
        }

        self.registry.unregister(self.id);
        self.nat.release_tunnel(self.id);
        self.pool.release(self.device.id());
        drop(sender);
        let _ = writer.await;
        info!("{} closed", self.id);
    }

    fn next_cover_deadline(&self) -> Instant {
        Instant::now() + self.cover_delays.next_delay(&mut rand::thread_rng())
    }

    /// Runs the randomly selected handshake action, then sends the hello
    /// advertising the session's client subnets.
    async fn start_session(
        &mut self,
        sender: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TunnelError> {
        let action = *self.handshake_actions.select(OsRng.gen::<u8>());
        trace!("{} handshake action {:?}", self.id, action);
        for step in action.steps() {
            match step {
                HandshakeStep::Delay => {
                    let delay = self.cover_delays.next_delay(&mut rand::thread_rng());
                    tokio::time::sleep(delay).await;
                }
                HandshakeStep::Noise => {
                    let frame = obfuscation::noise(MTU, &mut rand::thread_rng());
                    sender
                        .send(frame)
                        .await
                        .map_err(|_| TunnelError::Internal("Outbound queue is closed"))?;
                }
            }
        }
        let client_ipv4 = self.device.allocate_ipv4()?;
        let client_ipv6 = self.device.allocate_ipv6()?;
        debug!(
            "{} reserved client addresses {}, {}",
            self.id, client_ipv4, client_ipv6
        );
        let hello = format!(
            "{},{}",
            self.device.ipv4_subnet(),
            self.device.ipv6_subnet()
        );
        let frame = obfuscation::frame(hello.as_bytes(), MTU, &mut rand::thread_rng())?;
        sender
            .send(frame)
            .await
            .map_err(|_| TunnelError::Internal("Outbound queue is closed"))?;
        Ok(())
    }

    /// Client-to-Internet direction: unframe, validate, apply the
    /// forwarding policy and NAT, then write to the interface. Every
    /// failure drops just the one packet.
    async fn handle_wire_frame(&self, data: &[u8]) {
        let payload = match obfuscation::unframe(data) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                trace!("{} skipped noise frame", self.id);
                return;
            }
            Err(err) => {
                debug!("{} dropped frame: {}", self.id, err);
                return;
            }
        };
        let mut packet_data = payload.to_vec();
        let mut packet = match IpPacket::from_data(&mut packet_data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(
                    "{} dropped unparseable packet ({}): {}",
                    self.id,
                    err,
                    fmt_slice_hex(&payload[..payload.len().min(32)])
                );
                return;
            }
        };
        match packet.validate() {
            PacketVerdict::Valid => {}
            verdict => {
                debug!("{} dropped packet, verdict {:?}: {}", self.id, verdict, packet);
                return;
            }
        }
        let src_addr = packet.src_addr();
        if !self.device.subnet_contains(&src_addr) {
            debug!("{} dropped packet from outside its subnet: {}", self.id, packet);
            return;
        }
        if !subnet::is_assignable(&src_addr) {
            debug!("{} dropped packet from unassignable source: {}", self.id, packet);
            return;
        }
        if let Err(err) = self.nat.forward_to_internet(&mut packet, self.id) {
            debug!("{} dropped packet ({}): {}", self.id, err, packet);
            return;
        }
        let length = packet.packet_length();
        let data = packet.into_data();
        if let Err(err) = self.device.write_packet(&data[..length]).await {
            warn!("{} failed to write to {}: {}", self.id, self.device.name(), err);
        }
    }

    /// Internet-to-client direction: reverse the NAT and hand the packet
    /// to whichever session owns the connection. Unsolicited packets are
    /// dropped quietly.
    fn handle_inbound_packet(&self, data: &mut [u8], sender: &mpsc::Sender<Vec<u8>>) {
        let mut packet = match IpPacket::from_data(data) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("{} dropped inbound packet: {}", self.id, err);
                return;
            }
        };
        let owner = match self.nat.forward_to_tunnel(&mut packet) {
            Ok(owner) => owner,
            Err(NatError::UnknownConnection) => {
                trace!("{} dropped unsolicited packet: {}", self.id, packet);
                return;
            }
            Err(err) => {
                debug!("{} dropped inbound packet ({}): {}", self.id, err, packet);
                return;
            }
        };
        let length = packet.packet_length();
        let data = packet.into_data();
        let frame = match obfuscation::frame(&data[..length], MTU, &mut rand::thread_rng()) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("{} failed to frame inbound packet: {}", self.id, err);
                return;
            }
        };
        if owner == self.id {
            if sender.try_send(frame).is_err() {
                trace!("{} dropped inbound packet, queue is full", self.id);
            }
        } else if !self.registry.dispatch(owner, frame) {
            trace!("{} dropped inbound packet for dead {}", self.id, owner);
        }
    }
}

#[derive(Debug)]
pub enum TunnelError {
    Internal(&'static str),
    Tun(TunError),
    Subnet(SubnetError),
    Obfuscation(ObfuscationError),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Tun(e) => write!(f, "TUN error: {}", e),
            Self::Subnet(e) => write!(f, "Subnet error: {}", e),
            Self::Obfuscation(e) => write!(f, "Obfuscation error: {}", e),
        }
    }
}

impl error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Tun(err) => Some(err),
            Self::Subnet(err) => Some(err),
            Self::Obfuscation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TunError> for TunnelError {
    fn from(err: TunError) -> TunnelError {
        Self::Tun(err)
    }
}

impl From<SubnetError> for TunnelError {
    fn from(err: SubnetError) -> TunnelError {
        Self::Subnet(err)
    }
}

impl From<ObfuscationError> for TunnelError {
    fn from(err: ObfuscationError) -> TunnelError {
        Self::Obfuscation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_routes_to_registered_sessions() {
        let registry = SessionRegistry::new();
        let (sender, mut receiver) = mpsc::channel(4);
        registry.register(TunnelId::new(1), sender);
        assert!(registry.dispatch(TunnelId::new(1), vec![1, 2, 3]));
        assert_eq!(receiver.try_recv().unwrap(), vec![1, 2, 3]);
        assert!(!registry.dispatch(TunnelId::new(2), vec![4]));
        registry.unregister(TunnelId::new(1));
        assert!(!registry.dispatch(TunnelId::new(1), vec![5]));
    }

    #[test]
    fn registry_drops_frames_for_backlogged_sessions() {
        let registry = SessionRegistry::new();
        let (sender, _receiver) = mpsc::channel(1);
        registry.register(TunnelId::new(1), sender);
        assert!(registry.dispatch(TunnelId::new(1), vec![1]));
        assert!(!registry.dispatch(TunnelId::new(1), vec![2]));
    }
}

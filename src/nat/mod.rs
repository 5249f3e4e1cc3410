use std::{
    collections::HashMap,
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Mutex,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    ip::{subnet, ForwardingSide, IpError, IpPacket, TransportProtocolType},
    tunnel::TunnelId,
};

// netfilter's default conntrack table size.
const MAX_CONNECTIONS: usize = 1 << 18;

struct Connection {
    private_addr: IpAddr,
    tunnel: TunnelId,
    last_used: Instant,
}

/// Address-restricted connection table: one mapping per remote public
/// address and transport protocol. Private addresses are stored as owned
/// copies, never as views into packet buffers.
pub struct ConnectionTracker {
    connections: HashMap<(IpAddr, u8), Connection>,
    capacity: usize,
}

impl ConnectionTracker {
    fn new() -> ConnectionTracker {
        Self::with_capacity(MAX_CONNECTIONS)
    }

    fn with_capacity(capacity: usize) -> ConnectionTracker {
        ConnectionTracker {
            connections: HashMap::new(),
            capacity,
        }
    }

    fn track(
        &mut self,
        public_addr: IpAddr,
        protocol: TransportProtocolType,
        private_addr: IpAddr,
        tunnel: TunnelId,
    ) -> Result<(), NatError> {
        match self.connections.get_mut(&(public_addr, protocol.to_u8())) {
            None => {
                if self.connections.len() >= self.capacity {
                    return Err(NatError::TooManyConnections);
                }
                self.connections.insert(
                    (public_addr, protocol.to_u8()),
                    Connection {
                        private_addr,
                        tunnel,
                        last_used: Instant::now(),
                    },
                );
                Ok(())
            }
            Some(connection) => {
                if connection.tunnel == tunnel && connection.private_addr == private_addr {
                    connection.last_used = Instant::now();
                    Ok(())
                } else {
                    Err(NatError::ConflictingConnection)
                }
            }
        }
    }

    fn lookup(
        &mut self,
        public_addr: IpAddr,
        protocol: TransportProtocolType,
    ) -> Option<(IpAddr, TunnelId)> {
        let connection = self
            .connections
            .get_mut(&(public_addr, protocol.to_u8()))?;
        connection.last_used = Instant::now();
        Some((connection.private_addr, connection.tunnel))
    }

    fn remove_tunnel(&mut self, tunnel: TunnelId) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, connection| connection.tunnel != tunnel);
        before - self.connections.len()
    }

    fn evict_idle(&mut self, timeout: Duration) -> usize {
        let before = self.connections.len();
        let now = Instant::now();
        self.connections
            .retain(|_, connection| now.duration_since(connection.last_used) < timeout);
        before - self.connections.len()
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

/// Source NAT over one public IPv4 address and, optionally, one public
/// IPv6 address. Shared by all tunnel sessions; tracked operations are
/// synchronous and never block.
pub struct Nat {
    tracker: Mutex<ConnectionTracker>,
    public_ipv4: Ipv4Addr,
    public_ipv6: Option<Ipv6Addr>,
}

impl Nat {
    pub fn new(public_ipv4: Ipv4Addr, public_ipv6: Option<Ipv6Addr>) -> Nat {
        Nat {
            tracker: Mutex::new(ConnectionTracker::new()),
            public_ipv4,
            public_ipv6,
        }
    }

    #[cfg(test)]
    fn with_capacity(
        public_ipv4: Ipv4Addr,
        public_ipv6: Option<Ipv6Addr>,
        capacity: usize,
    ) -> Nat {
        Nat {
            tracker: Mutex::new(ConnectionTracker::with_capacity(capacity)),
            public_ipv4,
            public_ipv6,
        }
    }

    fn public_addr_for(&self, packet: &IpPacket) -> Result<IpAddr, NatError> {
        match packet {
            IpPacket::V4(_) => Ok(IpAddr::V4(self.public_ipv4)),
            IpPacket::V6(_) => match self.public_ipv6 {
                Some(addr) => Ok(IpAddr::V6(addr)),
                None => Err(NatError::NoPublicAddress),
            },
        }
    }

    /// Masquerades an outbound packet: tracks the connection and rewrites
    /// the source address to the gateway's public address. Fails per
    /// packet, leaving the table count unchanged on every error.
    pub fn forward_to_internet(
        &self,
        packet: &mut IpPacket,
        tunnel: TunnelId,
    ) -> Result<(), NatError> {
        let dst_addr = packet.dst_addr();
        if subnet::is_private(&dst_addr) {
            return Err(NatError::PrivateDestination);
        }
        let public_addr = self.public_addr_for(packet)?;
        let private_addr = packet.src_addr();
        let protocol = packet.transport_protocol();
        {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| NatError::Internal("Connection tracker lock is poisoned"))?;
            tracker.track(dst_addr, protocol, private_addr, tunnel)?;
        }
        packet.prepare_for_forwarding(ForwardingSide::Source, public_addr)?;
        packet.recalculate_checksums()?;
        Ok(())
    }

    /// Reverses the translation for an inbound packet and returns the
    /// tunnel that owns the connection. Unsolicited traffic has no
    /// mapping and is reported as `UnknownConnection` for the caller to
    /// drop.
    pub fn forward_to_tunnel(&self, packet: &mut IpPacket) -> Result<TunnelId, NatError> {
        let src_addr = packet.src_addr();
        let protocol = packet.transport_protocol();
        let (private_addr, tunnel) = {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| NatError::Internal("Connection tracker lock is poisoned"))?;
            match tracker.lookup(src_addr, protocol) {
                Some(connection) => connection,
                None => return Err(NatError::UnknownConnection),
            }
        };
        packet.prepare_for_forwarding(ForwardingSide::Destination, private_addr)?;
        packet.recalculate_checksums()?;
        Ok(tunnel)
    }

    /// Drops all of a tunnel's mappings when its session ends.
    pub fn release_tunnel(&self, tunnel: TunnelId) {
        if let Ok(mut tracker) = self.tracker.lock() {
            let removed = tracker.remove_tunnel(tunnel);
            if removed > 0 {
                debug!("Removed {} connections of {}", removed, tunnel);
            }
        }
    }

    pub fn evict_idle(&self, timeout: Duration) -> usize {
        match self.tracker.lock() {
            Ok(mut tracker) => tracker.evict_idle(timeout),
            Err(_) => 0,
        }
    }

    pub fn connection_count(&self) -> usize {
        match self.tracker.lock() {
            Ok(tracker) => tracker.len(),
            Err(_) => 0,
        }
    }
}

#[derive(Debug)]
pub enum NatError {
    Internal(&'static str),
    ConflictingConnection,
    TooManyConnections,
    PrivateDestination,
    NoPublicAddress,
    UnknownConnection,
    Ip(IpError),
}

impl fmt::Display for NatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::ConflictingConnection => {
                write!(f, "Connection is already tracked with a different owner")
            }
            Self::TooManyConnections => write!(f, "Connection table is full"),
            Self::PrivateDestination => {
                write!(f, "Destination address is private or reserved")
            }
            Self::NoPublicAddress => {
                write!(f, "No public address is configured for this address family")
            }
            Self::UnknownConnection => write!(f, "No tracked connection for packet"),
            Self::Ip(e) => write!(f, "IP error: {}", e),
        }
    }
}

impl error::Error for NatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Ip(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IpError> for NatError {
    fn from(err: IpError) -> NatError {
        Self::Ip(err)
    }
}

impl From<&'static str> for NatError {
    fn from(msg: &'static str) -> NatError {
        Self::Internal(msg)
    }
}

use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

pub mod sdu;
pub mod subnet;

use sdu::{ChecksumContext, ServiceData};

const MIN_IPV4_HEADER_LENGTH: usize = 20;
const IPV6_HEADER_LENGTH: usize = 40;

// Set to 0 to stop decreasing TTL or Hop Limit.
const TTL_HOP_DECREMENT: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransportProtocolType(u8);

impl TransportProtocolType {
    const HOP_BY_HOP_OPTIONS: TransportProtocolType = TransportProtocolType(0);
    pub const ICMP: TransportProtocolType = TransportProtocolType(1);
    pub const TCP: TransportProtocolType = TransportProtocolType(6);
    pub const UDP: TransportProtocolType = TransportProtocolType(17);
    const IPV6_ROUTING: TransportProtocolType = TransportProtocolType(43);
    const IPV6_FRAGMENT: TransportProtocolType = TransportProtocolType(44);
    const IPV6_AH: TransportProtocolType = TransportProtocolType(51);
    pub const IPV6_ICMP: TransportProtocolType = TransportProtocolType(58);
    pub const IPV6_NO_NEXT_HEADER: TransportProtocolType = TransportProtocolType(59);
    const IPV6_DESTINATION_OPTIONS: TransportProtocolType = TransportProtocolType(60);
    const IPV6_MOBILITY: TransportProtocolType = TransportProtocolType(135);
    const IPV6_HOST_IDENTITY_PROTOCOL: TransportProtocolType = TransportProtocolType(139);
    const IPV6_SHIM6_PROTOCOL: TransportProtocolType = TransportProtocolType(140);

    pub fn from_u8(value: u8) -> TransportProtocolType {
        TransportProtocolType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    fn length(&self, data: &[u8]) -> usize {
        match *self {
            Self::HOP_BY_HOP_OPTIONS => 8 + (data[1] as usize) * 8,
            Self::IPV6_ROUTING => 8 + (data[1] as usize) * 8,
            Self::IPV6_FRAGMENT => 8,
            Self::IPV6_DESTINATION_OPTIONS => 8 + (data[1] as usize) * 8,
            Self::IPV6_AH => 8 + (data[1] as usize) * 4,
            Self::IPV6_MOBILITY => 8 + (data[1] as usize) * 8,
            Self::IPV6_HOST_IDENTITY_PROTOCOL => 8 + (data[1] as usize) * 8,
            Self::IPV6_SHIM6_PROTOCOL => 8 + (data[1] as usize) * 8,
            _ => data.len(),
        }
    }

    fn min_bytes(&self) -> usize {
        match *self {
            Self::HOP_BY_HOP_OPTIONS => 8,
            Self::IPV6_ROUTING => 8,
            Self::IPV6_FRAGMENT => 8,
            Self::IPV6_DESTINATION_OPTIONS => 8,
            Self::IPV6_AH => 8,
            Self::IPV6_MOBILITY => 8,
            Self::IPV6_HOST_IDENTITY_PROTOCOL => 8,
            Self::IPV6_SHIM6_PROTOCOL => 8,
            _ => 0,
        }
    }

    // Based on https://www.iana.org/assignments/ipv6-parameters/ipv6-parameters.xhtml.
    // ESP is not included: its payload is ciphertext, there's no next header to walk to.
    fn is_ipv6_extension(&self) -> bool {
        matches!(
            *self,
            Self::HOP_BY_HOP_OPTIONS
                | Self::IPV6_ROUTING
                | Self::IPV6_FRAGMENT
                | Self::IPV6_DESTINATION_OPTIONS
                | Self::IPV6_AH
                | Self::IPV6_MOBILITY
                | Self::IPV6_HOST_IDENTITY_PROTOCOL
                | Self::IPV6_SHIM6_PROTOCOL,
        )
    }

    // Protocols whose checksum covers an IP pseudoheader and must be
    // recalculated whenever an address is rewritten.
    fn sums_pseudo_header(&self) -> bool {
        matches!(*self, Self::TCP | Self::UDP | Self::IPV6_ICMP)
    }
}

impl fmt::Display for TransportProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::HOP_BY_HOP_OPTIONS => write!(f, "HOPOPT"),
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::IPV6_ROUTING => write!(f, "IPv6-Route"),
            Self::IPV6_FRAGMENT => write!(f, "IPv6-Frag"),
            Self::IPV6_AH => write!(f, "IPv6-AH"),
            Self::IPV6_ICMP => write!(f, "IPv6-ICMP"),
            Self::IPV6_NO_NEXT_HEADER => write!(f, "IPv6-NoNxt"),
            Self::IPV6_DESTINATION_OPTIONS => write!(f, "IPv6-Opts"),
            Self::IPV6_MOBILITY => write!(f, "IPv6-Mobility"),
            Self::IPV6_HOST_IDENTITY_PROTOCOL => write!(f, "IPv6-HIP"),
            Self::IPV6_SHIM6_PROTOCOL => write!(f, "IPv6-Shim6"),
            _ => write!(f, "Protocol {}", self.0),
        }
    }
}

/// Which address of a packet gets rewritten when forwarding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ForwardingSide {
    Source,
    Destination,
}

/// Result of validating a parsed packet, in check order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketVerdict {
    Valid,
    Expired,
    InvalidChecksum,
    InvalidPayload,
}

pub struct Ipv4Packet<'a> {
    data: &'a mut [u8],
    header_length: usize,
    total_length: usize,
}

impl<'a> Ipv4Packet<'a> {
    fn from_data(data: &'a mut [u8]) -> Result<Ipv4Packet<'a>, IpError> {
        if data.len() < MIN_IPV4_HEADER_LENGTH {
            return Err(IpError::Malformed("Not enough bytes in IPv4 header"));
        }
        let header_length = ((data[0] & 0x0f) as usize) * 4;
        if header_length < MIN_IPV4_HEADER_LENGTH {
            return Err(IpError::Malformed("IPv4 header length below minimum"));
        }
        let mut total_length = [0u8; 2];
        total_length.copy_from_slice(&data[2..4]);
        let total_length = u16::from_be_bytes(total_length) as usize;
        if total_length > data.len() {
            return Err(IpError::Malformed("IPv4 total length exceeds buffer"));
        }
        if total_length < header_length {
            return Err(IpError::Malformed("IPv4 total length below header length"));
        }
        let packet = Ipv4Packet {
            data,
            header_length,
            total_length,
        };
        // Reject transport payloads that are too short to carry their headers.
        ServiceData::from_data(packet.transport_protocol(), packet.payload())?;
        Ok(packet)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&self.data[12..16]);
        Ipv4Addr::from(addr)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&self.data[16..20]);
        Ipv4Addr::from(addr)
    }

    fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.data[12..16].copy_from_slice(&addr.octets());
    }

    fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.data[16..20].copy_from_slice(&addr.octets());
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    fn decrement_ttl(&mut self) {
        self.data[8] = self.data[8].saturating_sub(TTL_HOP_DECREMENT);
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        TransportProtocolType::from_u8(self.data[9])
    }

    fn payload(&self) -> &[u8] {
        &self.data[self.header_length..self.total_length]
    }

    fn validate_ip_checksum(&self) -> bool {
        let mut checksum = Checksum::new();
        checksum.add_slice(&self.data[..self.header_length]);
        checksum.fold();
        checksum.value() == 0x0000
    }

    /// Zeroes the header checksum field and rewrites it from the header
    /// bytes only (IHL×4 octets).
    pub fn recalculate_ip_checksum(&mut self) {
        self.data[10..12].fill(0);
        let mut checksum = Checksum::new();
        checksum.add_slice(&self.data[..self.header_length]);
        checksum.fold();
        self.data[10..12].copy_from_slice(&checksum.value().to_be_bytes());
    }

    fn checksum_context(&self) -> ChecksumContext {
        ChecksumContext::new(IpAddr::V4(self.src_addr()), IpAddr::V4(self.dst_addr()))
    }
}

pub struct Ipv6Packet<'a> {
    data: &'a mut [u8],
    packet_length: usize,
    transport_offset: usize,
    transport_protocol: TransportProtocolType,
}

impl<'a> Ipv6Packet<'a> {
    fn from_data(data: &'a mut [u8]) -> Result<Ipv6Packet<'a>, IpError> {
        if data.len() < IPV6_HEADER_LENGTH {
            return Err(IpError::Malformed("Not enough bytes in IPv6 header"));
        }
        let mut payload_length = [0u8; 2];
        payload_length.copy_from_slice(&data[4..6]);
        let packet_length = IPV6_HEADER_LENGTH + u16::from_be_bytes(payload_length) as usize;
        if packet_length > data.len() {
            return Err(IpError::Malformed("IPv6 payload length exceeds buffer"));
        }

        let (transport_offset, transport_protocol) =
            Self::find_transport(TransportProtocolType::from_u8(data[6]), data, packet_length)?;
        let packet = Ipv6Packet {
            data,
            packet_length,
            transport_offset,
            transport_protocol,
        };
        ServiceData::from_data(packet.transport_protocol(), packet.payload())?;
        Ok(packet)
    }

    // Walks the extension header chain using each header's own length field,
    // stopping at the first non-extension next header value.
    fn find_transport(
        first_header: TransportProtocolType,
        data: &[u8],
        packet_length: usize,
    ) -> Result<(usize, TransportProtocolType), IpError> {
        let mut offset = IPV6_HEADER_LENGTH;
        let mut protocol = first_header;
        while protocol.is_ipv6_extension() {
            let remaining = &data[offset..packet_length];
            if remaining.len() < protocol.min_bytes() {
                return Err(IpError::Malformed("IPv6 extension header is truncated"));
            }
            let header_length = protocol.length(remaining);
            if remaining.len() < header_length {
                return Err(IpError::Malformed("IPv6 extension header length overflow"));
            }
            protocol = TransportProtocolType::from_u8(remaining[0]);
            offset += header_length;
        }
        if protocol == TransportProtocolType::IPV6_NO_NEXT_HEADER {
            // Protocol 59 means there's no transport payload at all.
            Ok((packet_length, protocol))
        } else {
            Ok((offset, protocol))
        }
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(addr)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(addr)
    }

    fn set_src_addr(&mut self, addr: Ipv6Addr) {
        self.data[8..24].copy_from_slice(&addr.octets());
    }

    fn set_dst_addr(&mut self, addr: Ipv6Addr) {
        self.data[24..40].copy_from_slice(&addr.octets());
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    fn decrement_hop_limit(&mut self) {
        self.data[7] = self.data[7].saturating_sub(TTL_HOP_DECREMENT);
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        self.transport_protocol
    }

    fn payload(&self) -> &[u8] {
        &self.data[self.transport_offset..self.packet_length]
    }

    fn checksum_context(&self) -> ChecksumContext {
        ChecksumContext::new(IpAddr::V6(self.src_addr()), IpAddr::V6(self.dst_addr()))
    }
}

pub enum IpPacket<'a> {
    V4(Ipv4Packet<'a>),
    V6(Ipv6Packet<'a>),
}

impl<'a> IpPacket<'a> {
    pub fn from_data(data: &'a mut [u8]) -> Result<IpPacket<'a>, IpError> {
        if data.is_empty() {
            return Err(IpError::Malformed("IP packet is empty"));
        }
        match data[0] >> 4 {
            4 => Ok(IpPacket::V4(Ipv4Packet::from_data(data)?)),
            6 => Ok(IpPacket::V6(Ipv6Packet::from_data(data)?)),
            _ => Err(IpError::Malformed("Unsupported IP protocol version")),
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match self {
            IpPacket::V4(packet) => IpAddr::V4(packet.src_addr()),
            IpPacket::V6(packet) => IpAddr::V6(packet.src_addr()),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpPacket::V4(packet) => IpAddr::V4(packet.dst_addr()),
            IpPacket::V6(packet) => IpAddr::V6(packet.dst_addr()),
        }
    }

    pub fn hop_limit(&self) -> u8 {
        match self {
            IpPacket::V4(packet) => packet.ttl(),
            IpPacket::V6(packet) => packet.hop_limit(),
        }
    }

    pub fn transport_protocol(&self) -> TransportProtocolType {
        match self {
            IpPacket::V4(packet) => packet.transport_protocol(),
            IpPacket::V6(packet) => packet.transport_protocol(),
        }
    }

    pub fn service_data(&self) -> Result<ServiceData<'_>, IpError> {
        match self {
            IpPacket::V4(packet) => ServiceData::from_data(packet.transport_protocol(), packet.payload()),
            IpPacket::V6(packet) => ServiceData::from_data(packet.transport_protocol(), packet.payload()),
        }
    }

    pub fn into_data(self) -> &'a mut [u8] {
        match self {
            IpPacket::V4(packet) => packet.data,
            IpPacket::V6(packet) => packet.data,
        }
    }

    /// Number of bytes the packet declares itself to occupy; the view's
    /// buffer may be longer.
    pub fn packet_length(&self) -> usize {
        match self {
            IpPacket::V4(packet) => packet.total_length,
            IpPacket::V6(packet) => packet.packet_length,
        }
    }

    fn checksum_context(&self) -> ChecksumContext {
        match self {
            IpPacket::V4(packet) => packet.checksum_context(),
            IpPacket::V6(packet) => packet.checksum_context(),
        }
    }

    /// Pure validation: expired hop limit is reported first, then the IPv4
    /// header checksum, then the transport checksum of recognized
    /// protocols. Never mutates the packet.
    pub fn validate(&self) -> PacketVerdict {
        if self.hop_limit() < 1 {
            return PacketVerdict::Expired;
        }
        if let IpPacket::V4(packet) = self {
            if !packet.validate_ip_checksum() {
                return PacketVerdict::InvalidChecksum;
            }
        }
        let service_data = match self.service_data() {
            Ok(service_data) => service_data,
            Err(_) => return PacketVerdict::InvalidPayload,
        };
        if service_data.validate(&self.checksum_context()) {
            PacketVerdict::Valid
        } else {
            PacketVerdict::InvalidPayload
        }
    }

    /// Overwrites the source or destination address in place and decrements
    /// the hop limit by exactly 1. The caller must recalculate checksums
    /// afterwards: any address or TTL rewrite invalidates the IPv4 header
    /// checksum, and TCP/UDP checksums cover the addresses through the
    /// pseudoheader.
    pub fn prepare_for_forwarding(
        &mut self,
        side: ForwardingSide,
        addr: IpAddr,
    ) -> Result<(), IpError> {
        match (&mut *self, addr) {
            (IpPacket::V4(packet), IpAddr::V4(addr)) => {
                match side {
                    ForwardingSide::Source => packet.set_src_addr(addr),
                    ForwardingSide::Destination => packet.set_dst_addr(addr),
                }
                packet.decrement_ttl();
            }
            (IpPacket::V6(packet), IpAddr::V6(addr)) => {
                match side {
                    ForwardingSide::Source => packet.set_src_addr(addr),
                    ForwardingSide::Destination => packet.set_dst_addr(addr),
                }
                packet.decrement_hop_limit();
            }
            _ => return Err("Rewritten address family doesn't match the packet".into()),
        }
        Ok(())
    }

    /// Rewrites the IPv4 header checksum and, for transports that checksum
    /// over a pseudoheader, the transport checksum.
    pub fn recalculate_checksums(&mut self) -> Result<(), IpError> {
        let context = self.checksum_context();
        let protocol = self.transport_protocol();
        match self {
            IpPacket::V4(packet) => {
                packet.recalculate_ip_checksum();
                if protocol.sums_pseudo_header() {
                    let (header_length, total_length) = (packet.header_length, packet.total_length);
                    sdu::recalculate_checksum(
                        protocol,
                        &context,
                        &mut packet.data[header_length..total_length],
                    )?;
                }
            }
            IpPacket::V6(packet) => {
                if protocol.sums_pseudo_header() {
                    let (transport_offset, packet_length) =
                        (packet.transport_offset, packet.packet_length);
                    sdu::recalculate_checksum(
                        protocol,
                        &context,
                        &mut packet.data[transport_offset..packet_length],
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for IpPacket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpPacket::V4(_) => write!(f, "IPv4 ")?,
            IpPacket::V6(_) => write!(f, "IPv6 ")?,
        }
        write!(f, "{} ", self.transport_protocol())?;
        let ports = self
            .service_data()
            .ok()
            .and_then(|service_data| service_data.src_port().zip(service_data.dst_port()));
        match ports {
            Some((src_port, dst_port)) => write!(
                f,
                "{}:{} -> {}:{}",
                self.src_addr(),
                src_port,
                self.dst_addr(),
                dst_port
            )?,
            None => write!(f, "{} -> {}", self.src_addr(), self.dst_addr())?,
        }
        write!(f, " TTL={} L={}", self.hop_limit(), self.packet_length())
    }
}

/// RFC 1071 Internet checksum accumulator: sums 16-bit big-endian words,
/// folds carries, returns the one's complement.
#[derive(Clone, Copy)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(0)
    }

    pub fn add_slice(&mut self, add: &[u8]) {
        let mut iter = add.chunks_exact(2);
        let full_sum = iter
            .by_ref()
            .map(|bytes| ((bytes[0] as u32) << 8) | (bytes[1] as u32))
            .sum::<u32>();
        let remain_sum = match *iter.remainder() {
            [high] => (high as u32) << 8,
            [] => 0u32,
            _ => panic!("Checksum chunks_exact returned unexpected slice size"),
        };
        self.0 += full_sum + remain_sum;
    }

    pub fn fold(&mut self) {
        let mut sum = self.0;
        // At most two folds are needed: 0xffff + 0xffff = 0x1fffe.
        sum = (sum >> 16) + (sum & 0x0000ffff);
        sum = (sum >> 16) + (sum & 0x0000ffff);
        self.0 = sum;
    }

    pub fn value(&self) -> u16 {
        // Must fold before calling!
        !((self.0 & 0x0000ffff) as u16)
    }
}

#[derive(Debug)]
pub enum IpError {
    Malformed(&'static str),
    Internal(&'static str),
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed packet: {msg}"),
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for IpError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl From<&'static str> for IpError {
    fn from(msg: &'static str) -> IpError {
        Self::Internal(msg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // 28-byte ICMP echo request: 10.0.100.2 -> 1.1.1.1, TTL 64.
    pub(crate) fn icmp_echo_request() -> Vec<u8> {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 10, 0, 100, 2,
            1, 1, 1, 1, // ICMP echo request
            0x08, 0x00, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x01,
        ];
        write_ipv4_checksum(&mut packet);
        write_icmpv4_checksum(&mut packet, 20);
        packet
    }

    pub(crate) fn write_ipv4_checksum(packet: &mut [u8]) {
        packet[10..12].fill(0);
        let mut checksum = Checksum::new();
        checksum.add_slice(&packet[..20]);
        checksum.fold();
        packet[10..12].copy_from_slice(&checksum.value().to_be_bytes());
    }

    fn write_icmpv4_checksum(packet: &mut Vec<u8>, offset: usize) {
        packet[offset + 2..offset + 4].fill(0);
        let mut checksum = Checksum::new();
        checksum.add_slice(&packet[offset..]);
        checksum.fold();
        let value = checksum.value();
        packet[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    // UDP datagram 10.0.100.2:5353 -> 9.9.9.9:53 with 4 payload bytes.
    pub(crate) fn udp_packet() -> Vec<u8> {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 10, 0, 100, 2,
            9, 9, 9, 9, // UDP header, checksum placeholder so it gets computed
            0x14, 0xe9, 0x00, 0x35, 0x00, 0x0c, 0xff, 0xff, // payload
            0xde, 0xad, 0xbe, 0xef,
        ];
        write_ipv4_checksum(&mut packet);
        let context = ChecksumContext::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 100, 2)),
            IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
        );
        sdu::recalculate_checksum(TransportProtocolType::UDP, &context, &mut packet[20..]).unwrap();
        packet
    }

    #[test]
    fn parse_rejects_short_buffers() {
        for len in 0..20 {
            let mut data = vec![0x45u8; len];
            assert!(matches!(
                IpPacket::from_data(&mut data),
                Err(IpError::Malformed(_))
            ));
        }
    }

    #[test]
    fn parse_rejects_bad_ihl() {
        let mut packet = icmp_echo_request();
        packet[0] = 0x44;
        assert!(matches!(
            IpPacket::from_data(&mut packet),
            Err(IpError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_total_length_overflow() {
        let mut packet = icmp_echo_request();
        packet[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            IpPacket::from_data(&mut packet),
            Err(IpError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut data = vec![0x75u8; 40];
        assert!(matches!(
            IpPacket::from_data(&mut data),
            Err(IpError::Malformed(_))
        ));
    }

    #[test]
    fn validates_icmp_echo() {
        let mut data = icmp_echo_request();
        let packet = IpPacket::from_data(&mut data).unwrap();
        assert_eq!(packet.validate(), PacketVerdict::Valid);
        assert_eq!(packet.src_addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 100, 2)));
        assert_eq!(packet.dst_addr(), IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(packet.transport_protocol(), TransportProtocolType::ICMP);
    }

    #[test]
    fn validate_reports_expired_before_checksum() {
        let mut data = icmp_echo_request();
        data[8] = 0;
        // Also corrupt the checksum: Expired must win.
        data[10] ^= 0xff;
        let packet = IpPacket::from_data(&mut data).unwrap();
        assert_eq!(packet.validate(), PacketVerdict::Expired);
    }

    #[test]
    fn validate_detects_corrupted_header() {
        let mut data = icmp_echo_request();
        data[10] ^= 0xff;
        let packet = IpPacket::from_data(&mut data).unwrap();
        assert_eq!(packet.validate(), PacketVerdict::InvalidChecksum);
    }

    #[test]
    fn validate_detects_corrupted_udp_payload() {
        let mut data = udp_packet();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let packet = IpPacket::from_data(&mut data).unwrap();
        assert_eq!(packet.validate(), PacketVerdict::InvalidPayload);
    }

    #[test]
    fn validate_skips_unknown_transport() {
        let mut data = icmp_echo_request();
        data[9] = 0xfd;
        write_ipv4_checksum(&mut data);
        let packet = IpPacket::from_data(&mut data).unwrap();
        assert_eq!(packet.validate(), PacketVerdict::Valid);
    }

    #[test]
    fn checksum_recalculation_is_idempotent() {
        let mut data = udp_packet();
        let mut packet = IpPacket::from_data(&mut data).unwrap();
        packet.recalculate_checksums().unwrap();
        assert_eq!(packet.validate(), PacketVerdict::Valid);
        let first = packet.into_data().to_vec();
        let mut data = first.clone();
        let mut packet = IpPacket::from_data(&mut data).unwrap();
        packet.recalculate_checksums().unwrap();
        assert_eq!(packet.into_data(), first.as_slice());
    }

    #[test]
    fn forwarding_rewrites_address_and_ttl() {
        let mut data = icmp_echo_request();
        let mut packet = IpPacket::from_data(&mut data).unwrap();
        packet
            .prepare_for_forwarding(
                ForwardingSide::Source,
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)),
            )
            .unwrap();
        packet.recalculate_checksums().unwrap();
        assert_eq!(packet.src_addr(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)));
        assert_eq!(packet.hop_limit(), 63);
        assert_eq!(packet.validate(), PacketVerdict::Valid);
    }

    #[test]
    fn forwarding_rejects_family_mismatch() {
        let mut data = icmp_echo_request();
        let mut packet = IpPacket::from_data(&mut data).unwrap();
        assert!(packet
            .prepare_for_forwarding(ForwardingSide::Source, IpAddr::V6(Ipv6Addr::LOCALHOST))
            .is_err());
    }

    #[test]
    fn ipv6_walks_extension_headers() {
        // IPv6 header, hop-by-hop options, then UDP.
        let mut packet = vec![0u8; 40 + 8 + 8];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&16u16.to_be_bytes());
        packet[6] = 0; // hop-by-hop options
        packet[7] = 64;
        packet[8..24].copy_from_slice(&[0xfd, 0, 0x12, 0x34, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 2]);
        packet[24..40].copy_from_slice(&[0x20, 0x01, 0x48, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        packet[40] = TransportProtocolType::UDP.to_u8();
        packet[41] = 0; // extension length: 8 bytes total
        packet[48..50].copy_from_slice(&5353u16.to_be_bytes());
        packet[50..52].copy_from_slice(&53u16.to_be_bytes());
        packet[52..54].copy_from_slice(&8u16.to_be_bytes());
        let packet = IpPacket::from_data(&mut packet).unwrap();
        assert_eq!(packet.transport_protocol(), TransportProtocolType::UDP);
        let service_data = packet.service_data().unwrap();
        assert_eq!(service_data.src_port(), Some(5353));
        assert_eq!(service_data.dst_port(), Some(53));
    }

    #[test]
    fn ipv6_no_next_header_has_no_transport() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        packet[6] = TransportProtocolType::IPV6_NO_NEXT_HEADER.to_u8();
        packet[7] = 64;
        let packet = IpPacket::from_data(&mut packet).unwrap();
        assert_eq!(
            packet.transport_protocol(),
            TransportProtocolType::IPV6_NO_NEXT_HEADER
        );
        assert!(packet.service_data().unwrap().src_port().is_none());
    }

    #[test]
    fn ipv6_rejects_truncated_extension() {
        let mut packet = vec![0u8; 44];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&4u16.to_be_bytes());
        packet[6] = 0; // hop-by-hop, but only 4 bytes follow
        packet[7] = 64;
        assert!(matches!(
            IpPacket::from_data(&mut packet),
            Err(IpError::Malformed(_))
        ));
    }

    #[test]
    fn checksum_is_rfc1071_exact() {
        // Example from RFC 1071, Section 3.
        let mut checksum = Checksum::new();
        checksum.add_slice(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7]);
        checksum.fold();
        assert_eq!(checksum.value(), !0xddf2u16);
    }
}

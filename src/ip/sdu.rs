use std::net::IpAddr;

use super::{Checksum, IpError, TransportProtocolType};

const MIN_TCP_HEADER_LENGTH: usize = 20;
const MIN_UDP_HEADER_LENGTH: usize = 8;

const TCP_CHECKSUM_OFFSET: usize = 16;
const UDP_CHECKSUM_OFFSET: usize = 6;
const ICMP_CHECKSUM_OFFSET: usize = 2;

/// View over the transport payload of an IP packet. Protocols without
/// modeled headers are kept opaque, together with their protocol number
/// so checksums can still be verified where the protocol defines one.
pub enum ServiceData<'a> {
    Tcp(&'a [u8]),
    Udp(&'a [u8]),
    Opaque {
        protocol: TransportProtocolType,
        data: &'a [u8],
    },
}

impl<'a> ServiceData<'a> {
    pub fn from_data(
        protocol: TransportProtocolType,
        data: &'a [u8],
    ) -> Result<ServiceData<'a>, IpError> {
        match protocol {
            TransportProtocolType::TCP => {
                if data.len() < MIN_TCP_HEADER_LENGTH {
                    return Err(IpError::Malformed("Not enough bytes in TCP header"));
                }
                let data_offset = ((data[12] >> 4) as usize) * 4;
                if data_offset < MIN_TCP_HEADER_LENGTH || data_offset > data.len() {
                    return Err(IpError::Malformed("TCP data offset is out of range"));
                }
                Ok(ServiceData::Tcp(data))
            }
            TransportProtocolType::UDP => {
                if data.len() < MIN_UDP_HEADER_LENGTH {
                    return Err(IpError::Malformed("Not enough bytes in UDP header"));
                }
                Ok(ServiceData::Udp(data))
            }
            protocol => Ok(ServiceData::Opaque { protocol, data }),
        }
    }

    pub fn src_port(&self) -> Option<u16> {
        match self {
            ServiceData::Tcp(data) | ServiceData::Udp(data) => {
                Some(u16::from_be_bytes([data[0], data[1]]))
            }
            ServiceData::Opaque { .. } => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self {
            ServiceData::Tcp(data) | ServiceData::Udp(data) => {
                Some(u16::from_be_bytes([data[2], data[3]]))
            }
            ServiceData::Opaque { .. } => None,
        }
    }

    /// Verifies the transport checksum without modifying anything: sums
    /// the payload with the stored checksum in place, which comes out as
    /// zero when the checksum is correct.
    pub fn validate(&self, context: &ChecksumContext) -> bool {
        match self {
            ServiceData::Tcp(data) => {
                let mut checksum =
                    context.pseudo_checksum(TransportProtocolType::TCP, data.len());
                checksum.add_slice(data);
                checksum.fold();
                checksum.value() == 0x0000
            }
            ServiceData::Udp(data) => {
                if data[UDP_CHECKSUM_OFFSET] == 0 && data[UDP_CHECKSUM_OFFSET + 1] == 0 {
                    // RFC 768: an all-zero checksum means no checksum.
                    return true;
                }
                let mut checksum =
                    context.pseudo_checksum(TransportProtocolType::UDP, data.len());
                checksum.add_slice(data);
                checksum.fold();
                checksum.value() == 0x0000
            }
            ServiceData::Opaque { protocol, data } => match *protocol {
                TransportProtocolType::ICMP => {
                    if data.len() < ICMP_CHECKSUM_OFFSET + 2 {
                        return false;
                    }
                    let mut checksum = Checksum::new();
                    checksum.add_slice(data);
                    checksum.fold();
                    checksum.value() == 0x0000
                }
                TransportProtocolType::IPV6_ICMP => {
                    if data.len() < ICMP_CHECKSUM_OFFSET + 2 {
                        return false;
                    }
                    let mut checksum =
                        context.pseudo_checksum(TransportProtocolType::IPV6_ICMP, data.len());
                    checksum.add_slice(data);
                    checksum.fold();
                    checksum.value() == 0x0000
                }
                _ => true,
            },
        }
    }
}

/// Addresses of the packet that owns a transport payload, needed to build
/// the pseudoheader its checksum covers.
pub struct ChecksumContext {
    src_addr: IpAddr,
    dst_addr: IpAddr,
}

impl ChecksumContext {
    pub fn new(src_addr: IpAddr, dst_addr: IpAddr) -> ChecksumContext {
        ChecksumContext { src_addr, dst_addr }
    }

    fn pseudo_checksum(
        &self,
        protocol: TransportProtocolType,
        transport_length: usize,
    ) -> Checksum {
        let mut checksum = Checksum::new();
        match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                checksum.add_slice(&src_addr.octets());
                checksum.add_slice(&dst_addr.octets());
                checksum.add_slice(&[0, protocol.to_u8()]);
                checksum.add_slice(&(transport_length as u16).to_be_bytes());
            }
            (src_addr, dst_addr) => {
                match src_addr {
                    IpAddr::V4(addr) => checksum.add_slice(&addr.to_ipv6_mapped().octets()),
                    IpAddr::V6(addr) => checksum.add_slice(&addr.octets()),
                }
                match dst_addr {
                    IpAddr::V4(addr) => checksum.add_slice(&addr.to_ipv6_mapped().octets()),
                    IpAddr::V6(addr) => checksum.add_slice(&addr.octets()),
                }
                checksum.add_slice(&(transport_length as u32).to_be_bytes());
                checksum.add_slice(&[0, 0, 0, protocol.to_u8()]);
            }
        }
        checksum
    }
}

/// Rewrites the transport checksum in place. `data` is the transport
/// payload starting at the transport header.
pub fn recalculate_checksum(
    protocol: TransportProtocolType,
    context: &ChecksumContext,
    data: &mut [u8],
) -> Result<(), IpError> {
    let checksum_offset = match protocol {
        TransportProtocolType::TCP => TCP_CHECKSUM_OFFSET,
        TransportProtocolType::UDP => UDP_CHECKSUM_OFFSET,
        TransportProtocolType::IPV6_ICMP => ICMP_CHECKSUM_OFFSET,
        _ => return Ok(()),
    };
    if data.len() < checksum_offset + 2 {
        return Err(IpError::Malformed("Transport payload is too short"));
    }
    if protocol == TransportProtocolType::UDP
        && data[checksum_offset] == 0
        && data[checksum_offset + 1] == 0
    {
        // Keep an absent UDP checksum absent.
        return Ok(());
    }
    data[checksum_offset..checksum_offset + 2].fill(0);
    let mut checksum = context.pseudo_checksum(protocol, data.len());
    checksum.add_slice(data);
    checksum.fold();
    let mut value = checksum.value();
    if protocol == TransportProtocolType::UDP && value == 0x0000 {
        // A computed zero is transmitted as all ones (RFC 768).
        value = 0xffff;
    }
    data[checksum_offset..checksum_offset + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ipv4_context() -> ChecksumContext {
        ChecksumContext::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 100, 2)),
            IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
        )
    }

    #[test]
    fn udp_checksum_survives_rewrite() {
        let mut data = vec![
            0x14, 0xe9, 0x00, 0x35, 0x00, 0x0c, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef,
        ];
        let context = ipv4_context();
        recalculate_checksum(TransportProtocolType::UDP, &context, &mut data).unwrap();
        let datagram = ServiceData::from_data(TransportProtocolType::UDP, &data).unwrap();
        assert!(datagram.validate(&context));
        assert_eq!(datagram.src_port(), Some(5353));
        assert_eq!(datagram.dst_port(), Some(53));
    }

    #[test]
    fn absent_udp_checksum_is_accepted_and_preserved() {
        let mut data = vec![
            0x14, 0xe9, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00,
        ];
        let context = ipv4_context();
        let datagram = ServiceData::from_data(TransportProtocolType::UDP, &data).unwrap();
        assert!(datagram.validate(&context));
        recalculate_checksum(TransportProtocolType::UDP, &context, &mut data).unwrap();
        assert_eq!(&data[6..8], &[0, 0]);
    }

    #[test]
    fn tcp_rejects_short_payload() {
        let data = [0u8; 19];
        assert!(ServiceData::from_data(TransportProtocolType::TCP, &data).is_err());
    }

    #[test]
    fn tcp_rejects_bad_data_offset() {
        let mut data = [0u8; 20];
        data[12] = 0x40; // data offset 16, below the minimum header size
        assert!(ServiceData::from_data(TransportProtocolType::TCP, &data).is_err());
    }

    #[test]
    fn tcp_checksum_covers_pseudoheader() {
        let mut data = [0u8; 20];
        data[0..2].copy_from_slice(&49320u16.to_be_bytes());
        data[2..4].copy_from_slice(&443u16.to_be_bytes());
        data[12] = 0x50;
        let context = ipv4_context();
        recalculate_checksum(TransportProtocolType::TCP, &context, &mut data).unwrap();
        let segment = ServiceData::from_data(TransportProtocolType::TCP, &data).unwrap();
        assert!(segment.validate(&context));
        // A different source address must fail validation.
        let other = ChecksumContext::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 100, 3)),
            IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
        );
        assert!(!segment.validate(&other));
    }

    #[test]
    fn icmpv6_checksum_covers_pseudoheader() {
        let context = ChecksumContext::new(
            IpAddr::V6("fd00:1234::1:2".parse::<Ipv6Addr>().unwrap()),
            IpAddr::V6("2001:4860:4860::8888".parse::<Ipv6Addr>().unwrap()),
        );
        let mut data = [0x80, 0x00, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x01];
        recalculate_checksum(TransportProtocolType::IPV6_ICMP, &context, &mut data).unwrap();
        let echo =
            ServiceData::from_data(TransportProtocolType::IPV6_ICMP, &data).unwrap();
        assert!(echo.validate(&context));
    }
}

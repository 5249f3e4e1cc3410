use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::OnceLock,
};

// Reserved and special-purpose IPv4 blocks, from the IANA special-purpose
// address registry plus multicast and the former Class E range.
const RESERVED_IPV4: [(Ipv4Addr, u8); 16] = [
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const RESERVED_IPV6: [(Ipv6Addr, u8); 8] = [
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
];

static RESERVED_IPV4_TRIE: OnceLock<SubnetTrie> = OnceLock::new();
static RESERVED_IPV6_TRIE: OnceLock<SubnetTrie> = OnceLock::new();

/// Longest-prefix match over the reserved/special-purpose blocks: true if
/// the address must never be routed to the public Internet.
pub fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => RESERVED_IPV4_TRIE
            .get_or_init(|| {
                let mut trie = SubnetTrie::new();
                for (network, prefix_len) in RESERVED_IPV4 {
                    trie.insert((u32::from(network) as u128) << 96, prefix_len);
                }
                trie
            })
            .contains((u32::from(*addr) as u128) << 96),
        IpAddr::V6(addr) => RESERVED_IPV6_TRIE
            .get_or_init(|| {
                let mut trie = SubnetTrie::new();
                for (network, prefix_len) in RESERVED_IPV6 {
                    trie.insert(u128::from(network), prefix_len);
                }
                trie
            })
            .contains(u128::from(*addr)),
    }
}

/// True if the address can be handed to a client. IPv4 keeps the network
/// (.0), gateway (.1) and broadcast (.255) final octets to itself; IPv6
/// subnets are large enough that no host part is special.
pub fn is_assignable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => !matches!(addr.octets()[3], 0 | 1 | 255),
        IpAddr::V6(_) => true,
    }
}

// Bitwise prefix trie; addresses are compared MSB-first, with IPv4
// addresses occupying the top 32 bits.
struct SubnetTrie {
    nodes: Vec<TrieNode>,
}

#[derive(Clone, Copy)]
struct TrieNode {
    children: [Option<usize>; 2],
    terminal: bool,
}

impl SubnetTrie {
    fn new() -> SubnetTrie {
        SubnetTrie {
            nodes: vec![TrieNode {
                children: [None, None],
                terminal: false,
            }],
        }
    }

    fn insert(&mut self, bits: u128, prefix_len: u8) {
        let mut node = 0usize;
        for i in 0..prefix_len {
            let bit = ((bits >> (127 - i)) & 1) as usize;
            node = match self.nodes[node].children[bit] {
                Some(next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode {
                        children: [None, None],
                        terminal: false,
                    });
                    self.nodes[node].children[bit] = Some(next);
                    next
                }
            };
        }
        self.nodes[node].terminal = true;
    }

    fn contains(&self, bits: u128) -> bool {
        let mut node = 0usize;
        for i in 0..128 {
            if self.nodes[node].terminal {
                return true;
            }
            let bit = ((bits >> (127 - i)) & 1) as usize;
            node = match self.nodes[node].children[bit] {
                Some(next) => next,
                None => return false,
            };
        }
        self.nodes[node].terminal
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: u32,
    prefix_len: u8,
}

impl Ipv4Subnet {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Ipv4Subnet {
        let mask = Self::mask(prefix_len);
        Ipv4Subnet {
            network: u32::from(network) & mask,
            prefix_len,
        }
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix_len) == self.network
    }

    pub fn addr_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.network | offset)
    }

    /// First address after the network address, used by the interface
    /// itself.
    pub fn gateway_addr(&self) -> Ipv4Addr {
        self.addr_at(1)
    }

    fn host_count(&self) -> u32 {
        1u32 << (32 - self.prefix_len)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Subnet {
    network: u128,
    prefix_len: u8,
}

impl Ipv6Subnet {
    pub fn new(network: Ipv6Addr, prefix_len: u8) -> Ipv6Subnet {
        let mask = Self::mask(prefix_len);
        Ipv6Subnet {
            network: u128::from(network) & mask,
            prefix_len,
        }
    }

    fn mask(prefix_len: u8) -> u128 {
        if prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - prefix_len)
        }
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        u128::from(addr) & Self::mask(self.prefix_len) == self.network
    }

    pub fn addr_at(&self, offset: u128) -> Ipv6Addr {
        Ipv6Addr::from(self.network | offset)
    }

    pub fn gateway_addr(&self) -> Ipv6Addr {
        self.addr_at(1)
    }

    fn host_count(&self) -> u128 {
        1u128 << (128 - self.prefix_len.max(64))
    }
}

impl fmt::Display for Ipv6Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", Ipv6Addr::from(self.network), self.prefix_len)
    }
}

/// Hands out host addresses from a subnet in increasing order, skipping
/// the network and gateway addresses (and the IPv4 broadcast address at
/// the top).
pub enum AddressAllocator {
    V4 { subnet: Ipv4Subnet, next: u32 },
    V6 { subnet: Ipv6Subnet, next: u128 },
}

const FIRST_HOST_OFFSET: u32 = 2;

impl AddressAllocator {
    pub fn for_ipv4(subnet: Ipv4Subnet) -> AddressAllocator {
        AddressAllocator::V4 {
            subnet,
            next: FIRST_HOST_OFFSET,
        }
    }

    pub fn for_ipv6(subnet: Ipv6Subnet) -> AddressAllocator {
        AddressAllocator::V6 {
            subnet,
            next: FIRST_HOST_OFFSET as u128,
        }
    }

    pub fn allocate(&mut self) -> Result<IpAddr, SubnetError> {
        match self {
            AddressAllocator::V4 { subnet, next } => {
                // The highest offset is the broadcast address.
                if *next + 1 >= subnet.host_count() {
                    return Err(SubnetError::NoAddressesAvailable);
                }
                let addr = subnet.addr_at(*next);
                *next += 1;
                Ok(IpAddr::V4(addr))
            }
            AddressAllocator::V6 { subnet, next } => {
                if *next >= subnet.host_count() {
                    return Err(SubnetError::NoAddressesAvailable);
                }
                let addr = subnet.addr_at(*next);
                *next += 1;
                Ok(IpAddr::V6(addr))
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubnetError {
    NoAddressesAvailable,
}

impl fmt::Display for SubnetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoAddressesAvailable => write!(f, "No addresses available in subnet"),
        }
    }
}

impl error::Error for SubnetError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn private(addr: &str) -> bool {
        is_private(&addr.parse::<IpAddr>().unwrap())
    }

    #[test]
    fn recognizes_reserved_ipv4_blocks() {
        assert!(private("10.1.2.3"));
        assert!(private("192.168.0.1"));
        assert!(private("172.31.255.254"));
        assert!(private("127.0.0.1"));
        assert!(private("169.254.10.10"));
        assert!(private("100.64.0.1"));
        assert!(private("192.0.2.55"));
        assert!(private("198.18.0.1"));
        assert!(private("203.0.113.9"));
        assert!(private("224.0.0.251"));
        assert!(private("255.255.255.255"));
    }

    #[test]
    fn recognizes_public_ipv4_addresses() {
        assert!(!private("1.1.1.1"));
        assert!(!private("8.8.8.8"));
        assert!(!private("100.128.0.1"));
        assert!(!private("172.32.0.1"));
        assert!(!private("9.9.9.9"));
        assert!(!private("198.51.99.1"));
    }

    #[test]
    fn recognizes_reserved_ipv6_blocks() {
        assert!(private("::1"));
        assert!(private("fd00:1234::1"));
        assert!(private("fe80::1"));
        assert!(private("ff02::fb"));
        assert!(private("2001:db8::1"));
        assert!(private("::ffff:10.0.0.1"));
    }

    #[test]
    fn recognizes_public_ipv6_addresses() {
        assert!(!private("2001:4860:4860::8888"));
        assert!(!private("2606:4700:4700::1111"));
    }

    #[test]
    fn assignable_excludes_special_final_octets() {
        assert!(!is_assignable(&"10.0.100.0".parse().unwrap()));
        assert!(!is_assignable(&"10.0.100.1".parse().unwrap()));
        assert!(!is_assignable(&"10.0.100.255".parse().unwrap()));
        assert!(is_assignable(&"10.0.100.2".parse().unwrap()));
        assert!(is_assignable(&"1.2.3.254".parse().unwrap()));
        assert!(is_assignable(&"fd00:1234::3".parse().unwrap()));
    }

    #[test]
    fn subnet_contains_and_displays() {
        let subnet = Ipv4Subnet::new(Ipv4Addr::new(10, 0, 100, 0), 27);
        assert!(subnet.contains(Ipv4Addr::new(10, 0, 100, 31)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 0, 100, 32)));
        assert_eq!(subnet.to_string(), "10.0.100.0/27");
        let subnet = Ipv6Subnet::new("fd00:1234::2:0".parse().unwrap(), 120);
        assert!(subnet.contains("fd00:1234::2:7f".parse().unwrap()));
        assert!(!subnet.contains("fd00:1234::3:0".parse().unwrap()));
        assert_eq!(subnet.to_string(), "fd00:1234::2:0/120");
    }

    #[test]
    fn allocator_skips_reserved_offsets_and_exhausts() {
        let subnet = Ipv4Subnet::new(Ipv4Addr::new(10, 0, 100, 0), 30);
        let mut allocator = AddressAllocator::for_ipv4(subnet);
        assert_eq!(
            allocator.allocate().unwrap(),
            "10.0.100.2".parse::<IpAddr>().unwrap()
        );
        // .3 would be the broadcast address of a /30.
        assert_eq!(
            allocator.allocate(),
            Err(SubnetError::NoAddressesAvailable)
        );
    }

    #[test]
    fn allocator_hands_out_increasing_ipv6_addresses() {
        let subnet = Ipv6Subnet::new("fd00:1234::1:0".parse().unwrap(), 120);
        let mut allocator = AddressAllocator::for_ipv6(subnet);
        assert_eq!(
            allocator.allocate().unwrap(),
            "fd00:1234::1:2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            allocator.allocate().unwrap(),
            "fd00:1234::1:3".parse::<IpAddr>().unwrap()
        );
    }
}

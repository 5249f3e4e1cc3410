use std::{
    collections::BTreeSet,
    error, fmt, io,
    net::{Ipv4Addr, Ipv6Addr},
    os::fd::{AsRawFd, RawFd},
    sync::Mutex,
};

use log::debug;
use tokio::io::unix::AsyncFd;

use crate::ip::subnet::{AddressAllocator, Ipv4Subnet, Ipv6Subnet, SubnetError};

pub const MTU: usize = 1500;

// Interface id maps to the 10.0.(100+id).0/27 subnet, which tops out at
// 10.0.255.0 for id 155.
pub const MAX_POOL_CAPACITY: usize = 156;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

const IPV4_SUBNET_PREFIX_LEN: u8 = 27;
const IPV6_SUBNET_PREFIX_LEN: u8 = 120;

fn ipv4_subnet_for(id: usize) -> Ipv4Subnet {
    Ipv4Subnet::new(
        Ipv4Addr::new(10, 0, 100 + id as u8, 0),
        IPV4_SUBNET_PREFIX_LEN,
    )
}

fn ipv6_subnet_for(id: usize) -> Ipv6Subnet {
    Ipv6Subnet::new(
        Ipv6Addr::new(0xfd00, 0x1234, 0, 0, 0, 0, id as u16, 0),
        IPV6_SUBNET_PREFIX_LEN,
    )
}

struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// One leased `/dev/net/tun` interface with its derived client subnets.
/// Each tunnel session owns exactly one device for its lifetime.
pub struct TunDevice {
    id: usize,
    name: String,
    fd: AsyncFd<TunFd>,
    ipv4_subnet: Ipv4Subnet,
    ipv6_subnet: Ipv6Subnet,
    ipv4_allocator: AddressAllocator,
    ipv6_allocator: AddressAllocator,
}

impl TunDevice {
    fn open(id: usize) -> Result<TunDevice, TunError> {
        let name = format!("bgate{}", id);
        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(TunError::Io(io::Error::last_os_error()));
        }
        let fd = TunFd(fd);
        let mut ifr = IfReq {
            ifr_name: [0u8; libc::IFNAMSIZ],
            ifr_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
            _padding: [0u8; 22],
        };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        if unsafe { libc::ioctl(fd.0, TUNSETIFF, &ifr) } < 0 {
            return Err(TunError::Io(io::Error::last_os_error()));
        }
        let ipv4_subnet = ipv4_subnet_for(id);
        let ipv6_subnet = ipv6_subnet_for(id);
        debug!(
            "Opened TUN interface {} with subnets {}, {}",
            name, ipv4_subnet, ipv6_subnet
        );
        Ok(TunDevice {
            id,
            name,
            fd: AsyncFd::new(fd).map_err(TunError::Io)?,
            ipv4_subnet,
            ipv6_subnet,
            ipv4_allocator: AddressAllocator::for_ipv4(ipv4_subnet),
            ipv6_allocator: AddressAllocator::for_ipv6(ipv6_subnet),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ipv4_subnet(&self) -> Ipv4Subnet {
        self.ipv4_subnet
    }

    pub fn ipv6_subnet(&self) -> Ipv6Subnet {
        self.ipv6_subnet
    }

    pub fn subnet_contains(&self, addr: &std::net::IpAddr) -> bool {
        match addr {
            std::net::IpAddr::V4(addr) => self.ipv4_subnet.contains(*addr),
            std::net::IpAddr::V6(addr) => self.ipv6_subnet.contains(*addr),
        }
    }

    /// Reserves the next free client address in the interface's IPv4
    /// subnet.
    pub fn allocate_ipv4(&mut self) -> Result<std::net::IpAddr, SubnetError> {
        self.ipv4_allocator.allocate()
    }

    pub fn allocate_ipv6(&mut self) -> Result<std::net::IpAddr, SubnetError> {
        self.ipv6_allocator.allocate()
    }

    pub async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(TunError::Io)?;
            let result = guard.try_io(|fd| {
                let read = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if read < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(read as usize)
                }
            });
            match result {
                Ok(read) => return read.map_err(TunError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_packet(&self, data: &[u8]) -> Result<(), TunError> {
        loop {
            let mut guard = self.fd.writable().await.map_err(TunError::Io)?;
            let result = guard.try_io(|fd| {
                let written = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };
                if written < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(written as usize)
                }
            });
            match result {
                Ok(written) => {
                    let written = written.map_err(TunError::Io)?;
                    if written < data.len() {
                        return Err(TunError::Internal("Packet was partially written"));
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

// Lowest-numbered ids are reused first, keeping interface names stable
// across reconnects.
struct IdPool {
    free: BTreeSet<usize>,
}

impl IdPool {
    fn new(capacity: usize) -> IdPool {
        IdPool {
            free: (0..capacity).collect(),
        }
    }

    fn allocate(&mut self) -> Option<usize> {
        let id = *self.free.iter().next()?;
        self.free.remove(&id);
        Some(id)
    }

    fn release(&mut self, id: usize) {
        if !self.free.insert(id) {
            panic!("TUN interface {} was released twice", id);
        }
    }
}

/// Fixed-capacity pool of TUN interfaces. Exhaustion is a recoverable
/// error the accept path reports to the client before closing.
pub struct TunPool {
    ids: Mutex<IdPool>,
}

impl TunPool {
    pub fn new(capacity: usize) -> TunPool {
        if capacity > MAX_POOL_CAPACITY {
            panic!(
                "TUN pool capacity {} exceeds the supported maximum {}",
                capacity, MAX_POOL_CAPACITY
            );
        }
        TunPool {
            ids: Mutex::new(IdPool::new(capacity)),
        }
    }

    pub fn allocate(&self) -> Result<TunDevice, TunError> {
        let id = {
            let mut ids = self
                .ids
                .lock()
                .map_err(|_| TunError::Internal("TUN id pool lock is poisoned"))?;
            match ids.allocate() {
                Some(id) => id,
                None => return Err(TunError::PoolExhausted),
            }
        };
        match TunDevice::open(id) {
            Ok(device) => Ok(device),
            Err(err) => {
                // The id goes back to the free set when opening fails.
                if let Ok(mut ids) = self.ids.lock() {
                    ids.release(id);
                }
                Err(err)
            }
        }
    }

    pub fn release(&self, id: usize) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.release(id);
        }
    }
}

#[derive(Debug)]
pub enum TunError {
    Internal(&'static str),
    PoolExhausted,
    Io(io::Error),
}

impl fmt::Display for TunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::PoolExhausted => write!(f, "No available TUN interfaces"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for TunError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TunError {
    fn from(err: io::Error) -> TunError {
        Self::Io(err)
    }
}

impl From<&'static str> for TunError {
    fn from(msg: &'static str) -> TunError {
        Self::Internal(msg)
    }
}

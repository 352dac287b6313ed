use ipnet::Ipv4Net;
use thiserror::Error;

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

#[derive(Debug, Error)]
pub enum Error {
    #[error("address pool exhausted in {0}")]
    Exhausted(Ipv4Net),
    #[error("address {0} outside subnet {1}")]
    OutOfRange(Ipv4Addr, Ipv4Net),
    #[error("address {0} is reserved")]
    Reserved(Ipv4Addr),
    #[error("address {0} already leased")]
    AlreadyLeased(Ipv4Addr),
}

/// Host address allocator over the overlay subnet.
///
/// The network address and the first host (the provider's own gateway
/// address) are reserved and never handed out. Allocation is next-fit: a
/// cursor advances past every grant and wraps at the end of the subnet, so
/// an address released during key rotation is not handed straight back to
/// the same peer while its old routes may still linger.
#[derive(Clone, Debug)]
pub struct IpPool {
    subnet: Ipv4Net,
    leased: BTreeSet<Ipv4Addr>,
    next: Option<Ipv4Addr>,
}

impl IpPool {
    pub fn new(subnet: Ipv4Net) -> Self {
        IpPool {
            subnet,
            leased: BTreeSet::new(),
            next: None,
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// The provider's own address inside the subnet, first host after the
    /// network address.
    pub fn gateway(&self) -> Ipv4Addr {
        let network = u32::from(self.subnet.network());
        Ipv4Addr::from(network + 1)
    }

    fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.subnet.network() || ip == self.gateway()
    }

    /// Mark an address as in use. With `reuse` set, leasing an address that
    /// is already held succeeds (used when loading persisted peers).
    pub fn lease(&mut self, ip: Ipv4Addr, reuse: bool) -> Result<(), Error> {
        if !self.subnet.contains(&ip) {
            return Err(Error::OutOfRange(ip, self.subnet));
        }
        if self.is_reserved(ip) {
            return Err(Error::Reserved(ip));
        }
        if !self.leased.insert(ip) && !reuse {
            return Err(Error::AlreadyLeased(ip));
        }
        Ok(())
    }

    /// Lease the next free host address at or after the cursor, wrapping
    /// once to the start of the subnet.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, Error> {
        let free = |ip: &Ipv4Addr| !self.is_reserved(*ip) && !self.leased.contains(ip);
        let ip = match self.next {
            Some(next) => self
                .subnet
                .hosts()
                .filter(|ip| *ip >= next)
                .find(free)
                .or_else(|| self.subnet.hosts().find(free)),
            None => self.subnet.hosts().find(free),
        }
        .ok_or(Error::Exhausted(self.subnet))?;
        self.leased.insert(ip);
        self.next = Some(Ipv4Addr::from(u32::from(ip).saturating_add(1)));
        Ok(ip)
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        self.leased.remove(&ip);
    }
}

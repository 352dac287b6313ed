use thiserror::Error;

use std::net::IpAddr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Options {
    pub address: IpAddr,
    pub timeout: Duration,
    pub ttl: u32,
    pub seq_count: u16,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ping failed")]
    PingFailed(#[from] ping::Error),
}

impl Options {
    pub fn new(address: IpAddr) -> Self {
        Options {
            address,
            timeout: Duration::from_secs(4),
            ttl: 6,
            seq_count: 1,
        }
    }
}

/// One-shot connectivity probe through the freshly raised tunnel.
#[tracing::instrument(name = "ping", ret)]
pub fn ping(opts: &Options) -> Result<Duration, Error> {
    let mut builder = ping::new(opts.address);
    let mut ping = builder.timeout(opts.timeout).ttl(opts.ttl).seq_cnt(opts.seq_count);
    #[cfg(target_os = "linux")]
    {
        ping = ping.socket_type(ping::RAW);
    }
    #[cfg(target_os = "macos")]
    {
        ping = ping.socket_type(ping::DGRAM);
    }
    ping.send().map(|p| p.rtt).map_err(Error::from)
}

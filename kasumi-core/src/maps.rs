use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result, bail};

/// Masks an IPv4 address down to `prefix` bits.
pub fn mask_v4(addr: Ipv4Addr, prefix: u32) -> Ipv4Addr {
    let prefix = prefix.min(32);
    let bits = u32::from(addr);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ipv4Addr::from(bits & mask)
}

/// Masks an IPv6 address down to `prefix` bits.
pub fn mask_v6(addr: Ipv6Addr, prefix: u32) -> Ipv6Addr {
    let prefix = prefix.min(128);
    let bits = u128::from(addr);
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    };
    Ipv6Addr::from(bits & mask)
}

#[derive(Debug, Clone, Copy)]
struct IpNet {
    addr: IpAddr,
    prefix: u32,
}

impl IpNet {
    fn matches(&self, candidate: IpAddr) -> bool {
        match (self.addr, candidate) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => mask_v4(addr, self.prefix) == net,
            (IpAddr::V6(net), IpAddr::V6(addr)) => mask_v6(addr, self.prefix) == net,
            _ => false,
        }
    }
}

/// Address membership map backed by a parsed CIDR list. Stands in for the
/// radix maps of the full deployment; lookup is a linear prefix match,
/// which is plenty for the short allow/deny lists this worker sees.
#[derive(Debug, Default, Clone)]
pub struct IpNetMap {
    nets: Vec<IpNet>,
}

impl IpNetMap {
    /// Parses entries of the form `addr` or `addr/prefix`.
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (addr_part, prefix_part) = match entry.split_once('/') {
                Some((addr, prefix)) => (addr, Some(prefix)),
                None => (entry, None),
            };
            let addr: IpAddr = addr_part
                .parse()
                .with_context(|| format!("bad address in ip map entry {entry:?}"))?;
            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            let prefix = match prefix_part {
                Some(raw) => {
                    let prefix: u32 = raw
                        .parse()
                        .with_context(|| format!("bad prefix in ip map entry {entry:?}"))?;
                    if prefix > max_prefix {
                        bail!("prefix /{prefix} too long in ip map entry {entry:?}");
                    }
                    prefix
                }
                None => max_prefix,
            };
            let addr = match addr {
                IpAddr::V4(v4) => IpAddr::V4(mask_v4(v4, prefix)),
                IpAddr::V6(v6) => IpAddr::V6(mask_v6(v6, prefix)),
            };
            nets.push(IpNet { addr, prefix });
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.matches(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// Case-normalized string membership map, used for update-key ids (base32)
/// and skip-hash digests (hex).
#[derive(Debug, Default, Clone)]
pub struct StringSetMap {
    entries: HashSet<String>,
}

impl StringSetMap {
    pub fn from_entries(entries: &[String]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|entry| entry.trim().to_ascii_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.entries.contains(&candidate.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

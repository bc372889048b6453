//! PROXY protocol v1 header generation.
//!
//! The header is prepended to every upstream connection so the upstream can
//! learn the original client address.
//!
//! Wire format (from HAProxy PROXY protocol spec, section 2.1):
//!
//! ```text
//! PROXY TCP4 <src-ip> <dst-ip> <src-port> <dst-port>\r\n
//! ```
//!
//! ASCII, a single line, at most 107 bytes including the CRLF.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Every v1 header starts with this token.
const PROXY_V1_PREFIX: &str = "PROXY";

/// Line terminator.
const PROXY_V1_TERMINATOR: &[u8] = b"\r\n";

/// Longest possible v1 line (TCP6 with maximal addresses), CRLF included.
pub const PROXY_V1_MAX_LEN: usize = 107;

/// Protocol family token of a v1 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6.
    Tcp6,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Tcp4 => "TCP4",
            AddressFamily::Tcp6 => "TCP6",
        }
    }

    fn parse_ip(&self, addr: &str) -> Result<IpAddr, ProxyHeaderError> {
        let parsed = match self {
            AddressFamily::Tcp4 => addr.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
            AddressFamily::Tcp6 => addr.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
        };
        parsed.ok_or_else(|| ProxyHeaderError::InvalidAddress {
            family: *self,
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while building a PROXY header.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyHeaderError {
    /// Address is not an IP literal of the header's family.
    #[error("invalid {family} address: {addr}")]
    InvalidAddress { family: AddressFamily, addr: String },

    /// Port is not a decimal number in 0..=65535.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// Address could not be split into host and port.
    #[error("cannot split host and port: {0:?}")]
    MalformedAddress(String),

    /// Source and destination are not in the same family.
    #[error("mixed address families: {src} -> {dst}")]
    MixedFamilies { src: IpAddr, dst: IpAddr },
}

/// Render a v1 header from its textual components.
///
/// Addresses must be IP literals of `family` and ports decimal numbers;
/// anything else is rejected instead of being written to the upstream.
pub fn encode(
    family: AddressFamily,
    src_addr: &str,
    src_port: &str,
    dst_addr: &str,
    dst_port: &str,
) -> Result<Vec<u8>, ProxyHeaderError> {
    let src_ip = family.parse_ip(src_addr)?;
    let dst_ip = family.parse_ip(dst_addr)?;
    let src_port = parse_port(src_port)?;
    let dst_port = parse_port(dst_port)?;

    Ok(render(family, src_ip, dst_ip, src_port, dst_port))
}

fn render(
    family: AddressFamily,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    format!(
        "{} {} {} {} {} {}\r\n",
        PROXY_V1_PREFIX, family, src_ip, dst_ip, src_port, dst_port
    )
    .into_bytes()
}

fn parse_port(port: &str) -> Result<u16, ProxyHeaderError> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyHeaderError::InvalidPort(port.to_string()));
    }
    port.parse()
        .map_err(|_| ProxyHeaderError::InvalidPort(port.to_string()))
}

/// Split `host:port` or `[v6-host]:port` into its host and numeric port.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), ProxyHeaderError> {
    let malformed = || ProxyHeaderError::MalformedAddress(addr.to_string());

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(malformed)?;
        let port = rest.strip_prefix(':').ok_or_else(malformed)?;
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(malformed)?;
        // Bare IPv6 literals must be bracketed.
        if host.contains(':') {
            return Err(malformed());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(malformed());
    }

    Ok((host, parse_port(port)?))
}

/// PROXY protocol v1 header for one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeaderV1 {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination (upstream) address.
    pub dst_addr: SocketAddr,
}

impl ProxyHeaderV1 {
    /// Create a new PROXY v1 header for the given connection.
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Family of the header.
    ///
    /// IPv4-mapped IPv6 addresses count as IPv4. A pair that stays mixed
    /// after that is rejected.
    pub fn family(&self) -> Result<AddressFamily, ProxyHeaderError> {
        self.resolved_ips().map(|(family, _, _)| family)
    }

    /// Generate the header bytes, to be written before any relayed data.
    pub fn encode(&self) -> Result<Vec<u8>, ProxyHeaderError> {
        let (family, src_ip, dst_ip) = self.resolved_ips()?;
        Ok(render(
            family,
            src_ip,
            dst_ip,
            self.src_addr.port(),
            self.dst_addr.port(),
        ))
    }

    fn resolved_ips(&self) -> Result<(AddressFamily, IpAddr, IpAddr), ProxyHeaderError> {
        let src = unmap_ipv4(self.src_addr.ip());
        let dst = unmap_ipv4(self.dst_addr.ip());
        match (src, dst) {
            (IpAddr::V4(_), IpAddr::V4(_)) => Ok((AddressFamily::Tcp4, src, dst)),
            (IpAddr::V6(_), IpAddr::V6(_)) => Ok((AddressFamily::Tcp6, src, dst)),
            _ => Err(ProxyHeaderError::MixedFamilies { src, dst }),
        }
    }
}

/// Collapse an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to IPv4.
fn unmap_ipv4(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Parse a PROXY v1 header from the start of a buffer.
///
/// Returns the parsed header and the number of bytes consumed, or `None`
/// if the buffer doesn't start with a complete, valid TCP4/TCP6 header.
pub fn parse_proxy_v1(data: &[u8]) -> Option<(ProxyHeaderV1, usize)> {
    let window = &data[..data.len().min(PROXY_V1_MAX_LEN)];
    let end = window
        .windows(PROXY_V1_TERMINATOR.len())
        .position(|w| w == PROXY_V1_TERMINATOR)?;
    let line = std::str::from_utf8(&window[..end]).ok()?;

    let mut fields = line.split(' ');
    if fields.next()? != PROXY_V1_PREFIX {
        return None;
    }
    let family = match fields.next()? {
        "TCP4" => AddressFamily::Tcp4,
        "TCP6" => AddressFamily::Tcp6,
        _ => return None,
    };
    let src_ip = family.parse_ip(fields.next()?).ok()?;
    let dst_ip = family.parse_ip(fields.next()?).ok()?;
    let src_port = parse_port(fields.next()?).ok()?;
    let dst_port = parse_port(fields.next()?).ok()?;
    if fields.next().is_some() {
        return None;
    }

    Some((
        ProxyHeaderV1::new(
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        ),
        end + PROXY_V1_TERMINATOR.len(),
    ))
}

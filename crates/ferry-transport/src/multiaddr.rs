//! Self-describing network addresses.
//!
//! A multiaddress is a sequence of protocol components, written as
//! `/ip4/127.0.0.1/tcp/9999/ws/p2p/<peer id>`. Only the components this stack
//! can act on are supported.
//!
//! Binary form: each component is `uvarint(code) || value`, where
//! addresses and ports have fixed sizes and names/peer ids carry a
//! `uvarint` length prefix.

use crate::varint;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

const CODE_IP4: u64 = 4;
const CODE_TCP: u64 = 6;
const CODE_IP6: u64 = 41;
const CODE_DNS: u64 = 53;
const CODE_DNS4: u64 = 54;
const CODE_DNS6: u64 = 55;
const CODE_P2P: u64 = 421;
const CODE_WS: u64 = 477;

/// Longest accepted DNS name
const MAX_DNS_LEN: usize = 253;

/// Multiaddress parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiaddrError {
    /// Address string does not start with `/`
    #[error("multiaddress must start with '/'")]
    MissingLeadingSlash,

    /// Component name not recognized
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Component is missing its value
    #[error("missing value for /{0}")]
    MissingValue(&'static str),

    /// Component value failed to parse
    #[error("invalid value for /{protocol}: {value}")]
    InvalidValue {
        /// Component name
        protocol: &'static str,
        /// Offending value
        value: String,
    },

    /// Binary encoding is malformed
    #[error("malformed binary multiaddress: {0}")]
    InvalidBytes(String),
}

/// One multiaddress component
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// IPv4 address
    Ip4(Ipv4Addr),
    /// IPv6 address
    Ip6(Ipv6Addr),
    /// DNS name resolved to any address family
    Dns(String),
    /// DNS name resolved to IPv4 only
    Dns4(String),
    /// DNS name resolved to IPv6 only
    Dns6(String),
    /// TCP port
    Tcp(u16),
    /// WebSocket over the preceding TCP component
    Ws,
    /// Peer identifier (32-byte digest)
    P2p([u8; 32]),
}

impl Protocol {
    fn name(&self) -> &'static str {
        match self {
            Self::Ip4(_) => "ip4",
            Self::Ip6(_) => "ip6",
            Self::Dns(_) => "dns",
            Self::Dns4(_) => "dns4",
            Self::Dns6(_) => "dns6",
            Self::Tcp(_) => "tcp",
            Self::Ws => "ws",
            Self::P2p(_) => "p2p",
        }
    }

    fn code(&self) -> u64 {
        match self {
            Self::Ip4(_) => CODE_IP4,
            Self::Ip6(_) => CODE_IP6,
            Self::Dns(_) => CODE_DNS,
            Self::Dns4(_) => CODE_DNS4,
            Self::Dns6(_) => CODE_DNS6,
            Self::Tcp(_) => CODE_TCP,
            Self::Ws => CODE_WS,
            Self::P2p(_) => CODE_P2P,
        }
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        varint::encode(self.code(), out);
        match self {
            Self::Ip4(ip) => out.extend_from_slice(&ip.octets()),
            Self::Ip6(ip) => out.extend_from_slice(&ip.octets()),
            Self::Dns(name) | Self::Dns4(name) | Self::Dns6(name) => {
                varint::encode(name.len() as u64, out);
                out.extend_from_slice(name.as_bytes());
            }
            Self::Tcp(port) => out.extend_from_slice(&port.to_be_bytes()),
            Self::Ws => {}
            Self::P2p(id) => {
                varint::encode(id.len() as u64, out);
                out.extend_from_slice(id);
            }
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Self::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Self::Dns(name) | Self::Dns4(name) | Self::Dns6(name) => {
                write!(f, "/{}/{name}", self.name())
            }
            Self::Tcp(port) => write!(f, "/tcp/{port}"),
            Self::Ws => write!(f, "/ws"),
            Self::P2p(id) => write!(f, "/p2p/{}", hex::encode(id)),
        }
    }
}

/// A parsed multiaddress
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// Empty address
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Address for a socket, optionally followed by `/ws`.
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr, ws: bool) -> Self {
        let mut out = Self::empty();
        out.push(match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        });
        out.push(Protocol::Tcp(addr.port()));
        if ws {
            out.push(Protocol::Ws);
        }
        out
    }

    /// Append a component.
    pub fn push(&mut self, protocol: Protocol) {
        self.components.push(protocol);
    }

    /// Builder form of [`Multiaddr::push`].
    #[must_use]
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.push(protocol);
        self
    }

    /// Components in order.
    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.components.iter()
    }

    /// Whether the address has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Trailing `/p2p/<id>` component, if any.
    #[must_use]
    pub fn peer_id(&self) -> Option<[u8; 32]> {
        match self.components.last() {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    /// Copy of this address without a trailing `/p2p/<id>`.
    #[must_use]
    pub fn without_peer_id(&self) -> Self {
        let mut out = self.clone();
        if matches!(out.components.last(), Some(Protocol::P2p(_))) {
            out.components.pop();
        }
        out
    }

    /// Whether the address ends in `/ws` (ignoring a trailing `/p2p`).
    #[must_use]
    pub fn is_websocket(&self) -> bool {
        matches!(
            self.without_peer_id().components.last(),
            Some(Protocol::Ws)
        )
    }

    /// Host and TCP port if the address starts with `host/tcp/port`.
    ///
    /// The host is returned in a form accepted by `tokio::net::lookup_host`.
    #[must_use]
    pub fn tcp_target(&self) -> Option<(HostTarget, u16)> {
        let mut iter = self.components.iter();
        let host = match iter.next()? {
            Protocol::Ip4(ip) => HostTarget::Ip(IpAddr::V4(*ip)),
            Protocol::Ip6(ip) => HostTarget::Ip(IpAddr::V6(*ip)),
            Protocol::Dns(name) => HostTarget::Dns(name.clone(), DnsFamily::Any),
            Protocol::Dns4(name) => HostTarget::Dns(name.clone(), DnsFamily::V4),
            Protocol::Dns6(name) => HostTarget::Dns(name.clone(), DnsFamily::V6),
            _ => return None,
        };
        match iter.next()? {
            Protocol::Tcp(port) => Some((host, *port)),
            _ => None,
        }
    }

    /// Binary encoding.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.components {
            component.write_bytes(&mut out);
        }
        out
    }

    /// Parse the binary encoding.
    ///
    /// # Errors
    ///
    /// Returns [`MultiaddrError::InvalidBytes`] for truncated input, unknown
    /// codes or invalid values.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, MultiaddrError> {
        let bad = |msg: &str| MultiaddrError::InvalidBytes(msg.to_string());
        let mut out = Self::empty();

        while !input.is_empty() {
            let (code, used) = varint::decode(input).map_err(|e| bad(&e.to_string()))?;
            input = &input[used..];

            let take = |input: &mut &[u8], n: usize| -> Result<Vec<u8>, MultiaddrError> {
                if input.len() < n {
                    return Err(bad("truncated component"));
                }
                let (head, tail) = input.split_at(n);
                *input = tail;
                Ok(head.to_vec())
            };
            let take_prefixed = |input: &mut &[u8]| -> Result<Vec<u8>, MultiaddrError> {
                let (len, used) = varint::decode(input).map_err(|e| bad(&e.to_string()))?;
                *input = &input[used..];
                let len = usize::try_from(len).map_err(|_| bad("length overflow"))?;
                take(input, len)
            };
            let dns_name = |bytes: Vec<u8>| -> Result<String, MultiaddrError> {
                let name = String::from_utf8(bytes).map_err(|_| bad("dns name is not utf-8"))?;
                validate_dns(&name).map_err(|_| bad("invalid dns name"))?;
                Ok(name)
            };

            let protocol = match code {
                CODE_IP4 => {
                    let b = take(&mut input, 4)?;
                    Protocol::Ip4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
                }
                CODE_IP6 => {
                    let b: [u8; 16] = take(&mut input, 16)?
                        .try_into()
                        .map_err(|_| bad("truncated ip6"))?;
                    Protocol::Ip6(Ipv6Addr::from(b))
                }
                CODE_TCP => {
                    let b = take(&mut input, 2)?;
                    Protocol::Tcp(u16::from_be_bytes([b[0], b[1]]))
                }
                CODE_DNS => Protocol::Dns(dns_name(take_prefixed(&mut input)?)?),
                CODE_DNS4 => Protocol::Dns4(dns_name(take_prefixed(&mut input)?)?),
                CODE_DNS6 => Protocol::Dns6(dns_name(take_prefixed(&mut input)?)?),
                CODE_WS => Protocol::Ws,
                CODE_P2P => {
                    let id: [u8; 32] = take_prefixed(&mut input)?
                        .try_into()
                        .map_err(|_| bad("peer id must be 32 bytes"))?;
                    Protocol::P2p(id)
                }
                other => return Err(bad(&format!("unknown protocol code {other}"))),
            };
            out.push(protocol);
        }

        Ok(out)
    }
}

/// Host part of a TCP-based address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    /// Literal IP address
    Ip(IpAddr),
    /// Name to resolve, with the address family restriction
    Dns(String, DnsFamily),
}

/// Address family restriction for DNS components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsFamily {
    /// `/dns`
    Any,
    /// `/dns4`
    V4,
    /// `/dns6`
    V6,
}

impl DnsFamily {
    /// Whether a resolved address satisfies this restriction.
    #[must_use]
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

fn validate_dns(name: &str) -> Result<(), ()> {
    if name.is_empty() || name.len() > MAX_DNS_LEN || name.contains('/') {
        return Err(());
    }
    Ok(())
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or(MultiaddrError::MissingLeadingSlash)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let mut out = Self::empty();

        while let Some(name) = parts.next() {
            let mut value = |protocol: &'static str| {
                parts.next().ok_or(MultiaddrError::MissingValue(protocol))
            };
            let invalid = |protocol: &'static str, value: &str| MultiaddrError::InvalidValue {
                protocol,
                value: value.to_string(),
            };

            let protocol = match name {
                "ip4" => {
                    let v = value("ip4")?;
                    Protocol::Ip4(v.parse().map_err(|_| invalid("ip4", v))?)
                }
                "ip6" => {
                    let v = value("ip6")?;
                    Protocol::Ip6(v.parse().map_err(|_| invalid("ip6", v))?)
                }
                "dns" | "dns4" | "dns6" => {
                    let proto: &'static str = match name {
                        "dns" => "dns",
                        "dns4" => "dns4",
                        _ => "dns6",
                    };
                    let v = value(proto)?;
                    validate_dns(v).map_err(|()| invalid(proto, v))?;
                    match proto {
                        "dns" => Protocol::Dns(v.to_string()),
                        "dns4" => Protocol::Dns4(v.to_string()),
                        _ => Protocol::Dns6(v.to_string()),
                    }
                }
                "tcp" => {
                    let v = value("tcp")?;
                    Protocol::Tcp(v.parse().map_err(|_| invalid("tcp", v))?)
                }
                "ws" => Protocol::Ws,
                "p2p" => {
                    let v = value("p2p")?;
                    let bytes = hex::decode(v).map_err(|_| invalid("p2p", v))?;
                    Protocol::P2p(bytes.try_into().map_err(|_| invalid("p2p", v))?)
                }
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            out.push(protocol);
        }

        Ok(out)
    }
}

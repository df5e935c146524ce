//! Identify protocol
//!
//! The dialer opens a stream on [`crate::IDENTIFY_PROTOCOL`] and
//! half-closes it; the listener answers with one length-prefixed record
//! describing itself and half-closes too.
//!
//! Record layout, every field `uvarint(len) || bytes`:
//!
//! ```text
//! public key (32) | protocol version | agent version
//! uvarint(n) listen addr * n | observed addr (empty if unknown)
//! uvarint(m) protocol id * m
//! ```
//!
//! Addresses use the binary multiaddress encoding.

use crate::config::ExchangeConfig;
use crate::error::{Error, FrameError, Result, SecurityError};
use crate::framed::{Framed, write_frame};
use crate::identity::{Identity, PeerId};
use crate::mux::Stream;
use ferry_crypto::signatures::VerifyingKey;
use ferry_transport::Multiaddr;
use ferry_transport::varint;

/// Upper bound on listed addresses and protocols
const MAX_LIST_LEN: u64 = 64;

/// What a node reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    /// Ed25519 public key bytes
    pub public_key: [u8; 32],
    /// Application protocol family the node speaks
    pub protocol_version: String,
    /// Implementation name and version
    pub agent_version: String,
    /// Addresses the node listens on
    pub listen_addrs: Vec<Multiaddr>,
    /// Address the node sees the requester at
    pub observed_addr: Option<Multiaddr>,
    /// Protocols served on inbound streams
    pub protocols: Vec<String>,
}

impl IdentifyInfo {
    /// Describe `identity` with no addresses and no protocols yet.
    #[must_use]
    pub fn new(identity: &Identity, protocol_version: impl Into<String>) -> Self {
        Self {
            public_key: identity.public_key().to_bytes(),
            protocol_version: protocol_version.into(),
            agent_version: crate::AGENT_VERSION.to_string(),
            listen_addrs: Vec::new(),
            observed_addr: None,
            protocols: Vec::new(),
        }
    }

    /// Peer id of the reported key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedIdentify`] if the bytes are not a valid
    /// Ed25519 key.
    pub fn peer_id(&self) -> Result<PeerId> {
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| malformed("public key is not a valid Ed25519 key"))?;
        Ok(PeerId::from_public_key(&key))
    }

    /// Serialize into one record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_field(&mut out, &self.public_key);
        put_field(&mut out, self.protocol_version.as_bytes());
        put_field(&mut out, self.agent_version.as_bytes());

        varint::encode(self.listen_addrs.len() as u64, &mut out);
        for addr in &self.listen_addrs {
            put_field(&mut out, &addr.to_bytes());
        }
        let observed = self
            .observed_addr
            .as_ref()
            .map(Multiaddr::to_bytes)
            .unwrap_or_default();
        put_field(&mut out, &observed);

        varint::encode(self.protocols.len() as u64, &mut out);
        for protocol in &self.protocols {
            put_field(&mut out, protocol.as_bytes());
        }
        out
    }

    /// Parse one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedIdentify`] for truncated or trailing
    /// data, oversized lists, invalid UTF-8, addresses or keys.
    pub fn decode(record: &[u8]) -> Result<Self> {
        let mut reader = Reader { rest: record };

        let public_key: [u8; 32] = reader
            .field()?
            .try_into()
            .map_err(|_| malformed("public key is not 32 bytes"))?;
        let protocol_version = reader.string()?;
        let agent_version = reader.string()?;

        let count = reader.count()?;
        let mut listen_addrs = Vec::with_capacity(count);
        for _ in 0..count {
            listen_addrs.push(reader.addr()?);
        }
        let observed_addr = match reader.field()? {
            [] => None,
            bytes => Some(Multiaddr::from_bytes(bytes)?),
        };

        let count = reader.count()?;
        let mut protocols = Vec::with_capacity(count);
        for _ in 0..count {
            protocols.push(reader.string()?);
        }

        if !reader.rest.is_empty() {
            return Err(malformed("trailing bytes after record"));
        }

        let info = Self {
            public_key,
            protocol_version,
            agent_version,
            listen_addrs,
            observed_addr,
            protocols,
        };
        info.peer_id()?;
        Ok(info)
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedIdentify(reason.into())
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn varint(&mut self) -> Result<u64> {
        let (value, used) =
            varint::decode(self.rest).map_err(|e| malformed(format!("bad length: {e}")))?;
        self.rest = &self.rest[used..];
        Ok(value)
    }

    fn field(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.rest.len())
            .ok_or_else(|| malformed("field runs past the record"))?;
        let (field, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(field)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.field()?.to_vec()).map_err(|_| malformed("field is not UTF-8"))
    }

    fn addr(&mut self) -> Result<Multiaddr> {
        Ok(Multiaddr::from_bytes(self.field()?)?)
    }

    fn count(&mut self) -> Result<usize> {
        let count = self.varint()?;
        if count > MAX_LIST_LEN {
            return Err(malformed(format!("list of {count} entries")));
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(count as usize)
    }
}

/// Ask the peer on `stream` to identify itself.
///
/// Fails with [`SecurityError::IdentityMismatch`] if the reported key does
/// not belong to `expected`, the peer authenticated by the secure channel.
///
/// # Errors
///
/// - [`Error::ResponseTimeout`] if no record arrives in time
/// - [`Error::MalformedIdentify`] for a bad record
/// - [`SecurityError::IdentityMismatch`] as above
pub async fn request(
    mut stream: Stream,
    expected: PeerId,
    config: &ExchangeConfig,
) -> Result<IdentifyInfo> {
    stream.close_write().await?;
    let mut framed = Framed::new(stream, config.max_frame_len);

    let record = tokio::time::timeout(config.response_timeout, framed.read_frame())
        .await
        .map_err(|_| Error::ResponseTimeout(config.response_timeout))??;
    let info = IdentifyInfo::decode(&record)?;

    let actual = info.peer_id()?;
    if actual != expected {
        return Err(SecurityError::IdentityMismatch { expected, actual }.into());
    }

    match tokio::time::timeout(config.response_timeout, framed.read_frame()).await {
        Ok(Err(Error::Frame(FrameError::ConnectionClosed))) => {}
        Ok(Ok(_)) => return Err(malformed("more than one record")),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::ResponseTimeout(config.response_timeout)),
    }

    tracing::debug!(
        "{} identified as {} ({} protocols)",
        actual.short(),
        info.agent_version,
        info.protocols.len()
    );
    Ok(info)
}

/// Answer an identify request on `stream` with `info`.
///
/// # Errors
///
/// Returns the write failure, or [`FrameError::TooLarge`] if the record
/// exceeds the frame limit.
pub async fn serve(mut stream: Stream, info: &IdentifyInfo, config: &ExchangeConfig) -> Result<()> {
    write_frame(&mut stream, &info.encode(), config.max_frame_len).await?;
    stream.close_write().await?;
    Ok(())
}

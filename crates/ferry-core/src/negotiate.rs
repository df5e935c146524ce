//! Protocol negotiation (multistream-select 1.0).
//!
//! Runs at the start of every connection, to pick the secure channel and the
//! multiplexer, and at the start of every stream, to pick the application
//! protocol.
//!
//! Wire format: every message is `uvarint(len + 1) || msg || '\n'`. Both
//! sides first exchange the header `/multistream/1.0.0`. The dialer then
//! proposes protocol ids one at a time; the listener answers each with an
//! echo of the id (agreed) or `na` (not available). `ls` asks the listener
//! for its supported list.
//!
//! ```text
//! dialer                                listener
//!   /multistream/1.0.0, /a/1.0.0  ──▶
//!                                 ◀──  /multistream/1.0.0, na
//!   /b/1.0.0                      ──▶
//!                                 ◀──  /b/1.0.0
//! ```

use crate::config::NegotiationConfig;
use crate::error::{Error, MultiplexError, NegotiationError, Result};
use ferry_transport::varint::{self, MAX_VARINT_LEN, VarintError};
use std::borrow::Cow;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Negotiation header, exchanged first by both sides
pub const MULTISTREAM_PROTOCOL: &str = "/multistream/1.0.0";

/// Longest accepted protocol id in bytes
pub const MAX_PROTOCOL_ID_LEN: usize = 140;

/// Largest negotiation message (bounds `ls` responses)
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

const NOT_AVAILABLE: &[u8] = b"na";
const LIST: &[u8] = b"ls";

/// A validated protocol identifier such as `/app/1.0.0`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(Cow<'static, str>);

impl ProtocolId {
    /// Validate and wrap a protocol id.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidProtocolId`] unless the id starts
    /// with `/`, contains no newline and is at most
    /// [`MAX_PROTOCOL_ID_LEN`] bytes.
    pub fn new(id: impl Into<Cow<'static, str>>) -> Result<Self> {
        let id = id.into();
        if !id.starts_with('/') || id.contains('\n') || id.len() > MAX_PROTOCOL_ID_LEN {
            return Err(NegotiationError::InvalidProtocolId(id.into_owned()).into());
        }
        Ok(Self(id))
    }

    /// Wrap a compile-time constant. The caller guarantees validity.
    #[must_use]
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProtocolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ordered mapping from protocol id to a handler tag
///
/// Lookup is by exact string match. Insertion order is kept for `ls`.
#[derive(Debug, Clone)]
pub struct ProtocolTable<H> {
    entries: Vec<(ProtocolId, H)>,
}

impl<H> Default for ProtocolTable<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<H> ProtocolTable<H> {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `protocol`, replacing any previous handler for it
    pub fn insert(&mut self, protocol: ProtocolId, handler: H) {
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == protocol) {
            entry.1 = handler;
        } else {
            self.entries.push((protocol, handler));
        }
    }

    /// Look up a handler by protocol id
    #[must_use]
    pub fn get(&self, protocol: &str) -> Option<&H> {
        self.lookup(protocol).map(|(_, h)| h)
    }

    fn lookup(&self, protocol: &str) -> Option<&(ProtocolId, H)> {
        self.entries.iter().find(|(id, _)| id.as_str() == protocol)
    }

    /// Registered ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = &ProtocolId> {
        self.entries.iter().map(|(id, _)| id)
    }

    /// Number of registered protocols
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a successful listener-side negotiation
#[derive(Debug, Clone)]
pub struct Negotiated<H> {
    /// Agreed protocol
    pub protocol: ProtocolId,
    /// Handler registered for it
    pub handler: H,
}

/// Append one negotiation message to `out`.
pub fn encode_message(msg: &[u8], out: &mut Vec<u8>) {
    varint::encode(msg.len() as u64 + 1, out);
    out.extend_from_slice(msg);
    out.push(b'\n');
}

/// Decode one message from the front of `buf`.
///
/// Returns the message body (without the newline) and the bytes consumed,
/// or `None` if `buf` does not hold a complete message yet.
///
/// # Errors
///
/// Returns [`NegotiationError::ProtocolViolation`] for a bad length prefix,
/// an oversized or empty message, or a missing trailing newline.
pub fn decode_message(
    buf: &[u8],
) -> std::result::Result<Option<(&[u8], usize)>, NegotiationError> {
    let (len, prefix) = match varint::decode(buf) {
        Ok(decoded) => decoded,
        Err(VarintError::Truncated) => return Ok(None),
        Err(e) => return Err(violation(format!("bad length prefix: {e}"))),
    };
    let len = check_len(len)?;
    let Some(body) = buf.get(prefix..prefix + len) else {
        return Ok(None);
    };
    match body.split_last() {
        Some((b'\n', msg)) => Ok(Some((msg, prefix + len))),
        _ => Err(violation("message not newline-terminated")),
    }
}

fn check_len(len: u64) -> std::result::Result<usize, NegotiationError> {
    if len == 0 {
        return Err(violation("empty message"));
    }
    if len > MAX_MESSAGE_LEN as u64 {
        return Err(violation(format!("message of {len} bytes too long")));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(len as usize)
}

fn violation(reason: impl Into<String>) -> NegotiationError {
    NegotiationError::ProtocolViolation(reason.into())
}

async fn write_messages<T>(io: &mut T, msgs: &[&[u8]]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    for msg in msgs {
        encode_message(msg, &mut out);
    }
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

/// Read exactly one message. Never reads past its end, so whatever
/// follows the negotiation stays in the stream for the next layer.
async fn read_message<T>(io: &mut T) -> Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let mut filled = 0;
    let (len, _) = loop {
        if filled == MAX_VARINT_LEN {
            return Err(violation("length prefix overflow").into());
        }
        io.read_exact(&mut prefix[filled..=filled]).await?;
        filled += 1;
        match varint::decode(&prefix[..filled]) {
            Ok(decoded) => break decoded,
            Err(VarintError::Truncated) => {}
            Err(e) => return Err(violation(format!("bad length prefix: {e}")).into()),
        }
    };

    let len = check_len(len)?;
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    if body.pop() != Some(b'\n') {
        return Err(violation("message not newline-terminated").into());
    }
    Ok(body)
}

fn is_end_of_stream(err: &Error) -> bool {
    match err {
        Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
        Error::Multiplex(MultiplexError::StreamReset) => true,
        _ => false,
    }
}

/// End of stream during the exchange is a negotiation failure, not an I/O error
fn closed_early(err: Error, reason: &'static str) -> Error {
    if is_end_of_stream(&err) {
        violation(reason).into()
    } else {
        err
    }
}

async fn bounded<F, R>(config: &NegotiationConfig, fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    tokio::time::timeout(config.timeout, fut)
        .await
        .map_err(|_| NegotiationError::NegotiationTimeout)?
}

/// Propose `protocols` in order and return the first one the listener accepts.
///
/// # Errors
///
/// - [`NegotiationError::NoCommonProtocol`] if every proposal is rejected
/// - [`NegotiationError::NegotiationTimeout`] if the exchange exceeds the bound
/// - [`NegotiationError::ProtocolViolation`] for an unexpected reply
pub async fn dialer_select<T>(
    io: &mut T,
    protocols: &[ProtocolId],
    config: &NegotiationConfig,
) -> Result<ProtocolId>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    bounded(config, propose(io, protocols)).await
}

async fn propose<T>(io: &mut T, protocols: &[ProtocolId]) -> Result<ProtocolId>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let Some(first) = protocols.first() else {
        return Err(NegotiationError::NoCommonProtocol.into());
    };

    write_messages(io, &[MULTISTREAM_PROTOCOL.as_bytes(), first.as_str().as_bytes()]).await?;

    let header = read_message(io).await?;
    if header != MULTISTREAM_PROTOCOL.as_bytes() {
        return Err(violation("unexpected negotiation header").into());
    }

    for (i, protocol) in protocols.iter().enumerate() {
        if i > 0 {
            write_messages(io, &[protocol.as_str().as_bytes()]).await?;
        }

        let reply = read_message(io).await?;
        if reply == protocol.as_str().as_bytes() {
            tracing::debug!("Negotiated {}", protocol);
            return Ok(protocol.clone());
        }
        if reply != NOT_AVAILABLE {
            return Err(violation(format!(
                "unexpected reply to {protocol}: {:?}",
                String::from_utf8_lossy(&reply)
            ))
            .into());
        }
        tracing::trace!("Peer rejected {}", protocol);
    }

    tracing::debug!("No common protocol among {} proposals", protocols.len());
    Err(NegotiationError::NoCommonProtocol.into())
}

/// Answer proposals from the dialer until one matches an entry of `table`.
///
/// # Errors
///
/// - [`NegotiationError::NoCommonProtocol`] after
///   [`NegotiationConfig::max_attempts`] rejected proposals, or when the
///   dialer gives up after a rejection
/// - [`NegotiationError::NegotiationTimeout`] if the exchange exceeds the bound
/// - [`NegotiationError::ProtocolViolation`] for a bad header or message
pub async fn listener_select<T, H>(
    io: &mut T,
    table: &ProtocolTable<H>,
    config: &NegotiationConfig,
) -> Result<Negotiated<H>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    H: Clone,
{
    bounded(config, answer(io, table, config.max_attempts)).await
}

async fn answer<T, H>(
    io: &mut T,
    table: &ProtocolTable<H>,
    max_attempts: usize,
) -> Result<Negotiated<H>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    H: Clone,
{
    let header = read_message(io)
        .await
        .map_err(|e| closed_early(e, "closed before the negotiation header"))?;
    if header != MULTISTREAM_PROTOCOL.as_bytes() {
        return Err(violation("unexpected negotiation header").into());
    }
    write_messages(io, &[MULTISTREAM_PROTOCOL.as_bytes()]).await?;

    let mut rejected = 0;
    loop {
        let msg = match read_message(io).await {
            Ok(msg) => msg,
            Err(e) if rejected > 0 && is_end_of_stream(&e) => {
                return Err(NegotiationError::NoCommonProtocol.into());
            }
            Err(e) => return Err(closed_early(e, "closed before proposing a protocol")),
        };

        if msg == LIST {
            let mut listing = Vec::new();
            for id in table.ids() {
                encode_message(id.as_str().as_bytes(), &mut listing);
            }
            write_messages(io, &[listing.as_slice()]).await?;
            continue;
        }

        let found = std::str::from_utf8(&msg)
            .ok()
            .and_then(|proposal| table.lookup(proposal));
        if let Some((protocol, handler)) = found {
            write_messages(io, &[msg.as_slice()]).await?;
            tracing::debug!("Accepted {}", protocol);
            return Ok(Negotiated {
                protocol: protocol.clone(),
                handler: handler.clone(),
            });
        }

        tracing::trace!("Rejecting {:?}", String::from_utf8_lossy(&msg));
        write_messages(io, &[NOT_AVAILABLE]).await?;
        rejected += 1;
        if rejected >= max_attempts {
            return Err(NegotiationError::NoCommonProtocol.into());
        }
    }
}

/// Ask the listener for its supported protocols.
///
/// # Errors
///
/// Same as [`dialer_select`], minus `NoCommonProtocol`.
pub async fn list_protocols<T>(io: &mut T, config: &NegotiationConfig) -> Result<Vec<String>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    bounded(config, request_listing(io)).await
}

async fn request_listing<T>(io: &mut T) -> Result<Vec<String>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_messages(io, &[MULTISTREAM_PROTOCOL.as_bytes(), LIST]).await?;

    let header = read_message(io).await?;
    if header != MULTISTREAM_PROTOCOL.as_bytes() {
        return Err(violation("unexpected negotiation header").into());
    }

    let listing = read_message(io).await?;
    let mut rest = listing.as_slice();
    let mut protocols = Vec::new();
    while !rest.is_empty() {
        let Some((msg, used)) = decode_message(rest)? else {
            return Err(violation("truncated protocol listing").into());
        };
        protocols.push(String::from_utf8_lossy(msg).into_owned());
        rest = &rest[used..];
    }
    Ok(protocols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &'static str) -> ProtocolId {
        ProtocolId::new(s).unwrap()
    }

    fn table(ids: &[&'static str]) -> ProtocolTable<u32> {
        let mut table = ProtocolTable::new();
        for (i, s) in ids.iter().enumerate() {
            table.insert(id(s), i as u32);
        }
        table
    }

    // ====================================================================
    // ProtocolId and messages
    // ====================================================================

    #[test]
    fn test_protocol_id_validation() {
        assert!(ProtocolId::new("/app/1.0.0").is_ok());
        assert!(ProtocolId::new("app/1.0.0").is_err());
        assert!(ProtocolId::new("/app\n").is_err());
        assert!(ProtocolId::new(format!("/{}", "a".repeat(MAX_PROTOCOL_ID_LEN))).is_err());
        assert!(ProtocolId::new(format!("/{}", "a".repeat(MAX_PROTOCOL_ID_LEN - 1))).is_ok());
    }

    #[test]
    fn test_message_encoding() {
        let mut out = Vec::new();
        encode_message(b"na", &mut out);
        assert_eq!(out, b"\x03na\n");

        let (msg, used) = decode_message(&out).unwrap().unwrap();
        assert_eq!(msg, b"na");
        assert_eq!(used, 4);
        assert_eq!(decode_message(&out[..2]).unwrap(), None);
    }

    #[test]
    fn test_message_without_newline_rejected() {
        assert!(decode_message(b"\x03nax").is_err());
        assert!(decode_message(b"\x00").is_err());
    }

    #[test]
    fn test_table_replaces_existing() {
        let mut table = table(&["/a/1.0.0", "/b/1.0.0"]);
        table.insert(id("/a/1.0.0"), 9);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("/a/1.0.0"), Some(&9));
        assert_eq!(table.get("/a/1.0.1"), None);
    }

    // ====================================================================
    // Dialer / listener
    // ====================================================================

    #[tokio::test]
    async fn test_first_proposal_accepted() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let config = NegotiationConfig::default();
        let table = table(&["/app/1.0.0"]);

        let listener = tokio::spawn(async move {
            let cfg = NegotiationConfig::default();
            listener_select(&mut b, &table, &cfg).await.map(|n| n.handler)
        });

        let agreed = dialer_select(&mut a, &[id("/app/1.0.0")], &config).await.unwrap();
        assert_eq!(agreed, id("/app/1.0.0"));
        assert_eq!(listener.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fallback_to_second_proposal() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let table = table(&["/x/1.0.0", "/b/1.0.0"]);

        let listener = tokio::spawn(async move {
            listener_select(&mut b, &table, &NegotiationConfig::default()).await
        });

        let agreed = dialer_select(
            &mut a,
            &[id("/a/1.0.0"), id("/b/1.0.0")],
            &NegotiationConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(agreed, id("/b/1.0.0"));

        let negotiated = listener.await.unwrap().unwrap();
        assert_eq!(negotiated.protocol, id("/b/1.0.0"));
        assert_eq!(negotiated.handler, 1);
    }

    #[tokio::test]
    async fn test_no_common_protocol_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let table = table(&["/x/1.0.0"]);

        let listener = tokio::spawn(async move {
            listener_select(&mut b, &table, &NegotiationConfig::default()).await
        });

        let result = dialer_select(
            &mut a,
            &[id("/a/1.0.0"), id("/b/1.0.0")],
            &NegotiationConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::Negotiation(NegotiationError::NoCommonProtocol))
        ));

        drop(a);
        assert!(matches!(
            listener.await.unwrap(),
            Err(Error::Negotiation(NegotiationError::NoCommonProtocol))
        ));
    }

    #[tokio::test]
    async fn test_listener_attempt_limit() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let config = NegotiationConfig {
            max_attempts: 2,
            ..NegotiationConfig::default()
        };
        let table = table(&["/x/1.0.0"]);

        let listener =
            tokio::spawn(async move { listener_select(&mut b, &table, &config).await });

        let proposals = [id("/a/1.0.0"), id("/b/1.0.0"), id("/c/1.0.0")];
        let _ = dialer_select(&mut a, &proposals, &NegotiationConfig::default()).await;
        assert!(matches!(
            listener.await.unwrap(),
            Err(Error::Negotiation(NegotiationError::NoCommonProtocol))
        ));
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let config = NegotiationConfig {
            timeout: Duration::from_millis(50),
            ..NegotiationConfig::default()
        };
        assert!(matches!(
            dialer_select(&mut a, &[id("/a/1.0.0")], &config).await,
            Err(Error::Negotiation(NegotiationError::NegotiationTimeout))
        ));
    }

    #[tokio::test]
    async fn test_bad_header_is_violation() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let table = table(&["/a/1.0.0"]);

        let mut out = Vec::new();
        encode_message(b"/multistream/2.0.0", &mut out);
        a.write_all(&out).await.unwrap();

        assert!(matches!(
            listener_select(&mut b, &table, &NegotiationConfig::default()).await,
            Err(Error::Negotiation(NegotiationError::ProtocolViolation(_)))
        ));
    }

    #[tokio::test]
    async fn test_hangup_before_header_is_violation() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);

        let result = listener_select(&mut b, &table(&["/a/1.0.0"]), &NegotiationConfig::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation(NegotiationError::ProtocolViolation(_))
        ));
        assert!(!err.is_fatal_to_connection());
    }

    #[tokio::test]
    async fn test_hangup_before_proposal_is_violation() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut out = Vec::new();
        encode_message(MULTISTREAM_PROTOCOL.as_bytes(), &mut out);
        a.write_all(&out).await.unwrap();
        a.shutdown().await.unwrap();

        assert!(matches!(
            listener_select(&mut b, &table(&["/a/1.0.0"]), &NegotiationConfig::default()).await,
            Err(Error::Negotiation(NegotiationError::ProtocolViolation(_)))
        ));
    }

    #[tokio::test]
    async fn test_ls_then_select() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let table = table(&["/a/1.0.0", "/b/1.0.0"]);

        let listener = tokio::spawn(async move {
            listener_select(&mut b, &table, &NegotiationConfig::default()).await
        });

        let listed = list_protocols(&mut a, &NegotiationConfig::default()).await.unwrap();
        assert_eq!(listed, vec!["/a/1.0.0".to_string(), "/b/1.0.0".to_string()]);

        write_messages(&mut a, &[b"/b/1.0.0".as_slice()]).await.unwrap();
        assert_eq!(read_message(&mut a).await.unwrap(), b"/b/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap().handler, 1);
    }

    #[tokio::test]
    async fn test_trailing_data_left_in_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let table = table(&["/a/1.0.0"]);

        let mut out = Vec::new();
        encode_message(MULTISTREAM_PROTOCOL.as_bytes(), &mut out);
        encode_message(b"/a/1.0.0", &mut out);
        out.extend_from_slice(b"payload");
        a.write_all(&out).await.unwrap();

        listener_select(&mut b, &table, &NegotiationConfig::default())
            .await
            .unwrap();
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }
}

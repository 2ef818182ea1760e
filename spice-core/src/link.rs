//! Link handshake run once per transport connection.
//!
//! ## Wire format
//!
//! ```text
//! Client ──[LinkHeader + LinkMess + caps]──────► Server
//! Server ──[LinkHeader + LinkReply + caps]─────► Client
//! Client ──[encrypted ticket (128 bytes)]──────► Server
//! Server ──[result: u32]───────────────────────► Client
//! ```
//!
//! **LinkHeader** (16 bytes): `magic "REDQ" | major u32 | minor u32 | size u32`
//!
//! **LinkMess** (18 bytes): `connection_id u32 | channel_type u8 |
//! channel_id u8 | num_common_caps u32 | num_channel_caps u32 |
//! caps_offset u32`, followed by the capability words. `caps_offset` is
//! relative to the start of `LinkMess`.
//!
//! **LinkReply** (178 bytes): `error u32 | pub_key [u8; 162] |
//! num_common_caps u32 | num_channel_caps u32 | caps_offset u32`,
//! followed by the capability words.

use rsa::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capabilities::{Capabilities, CapabilitySet};
use crate::error::SpiceError;
use crate::message::ChannelIdentity;
use crate::protocol::{decode, encode};
use crate::transport::Peer;

/// `"REDQ"` read as a little-endian `u32`.
pub const LINK_MAGIC: u32 = u32::from_le_bytes(*b"REDQ");
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

pub const PUB_KEY_SIZE: usize = 162;
pub const TICKET_SIZE: usize = 128;
pub const MAX_PASSWORD_LENGTH: usize = 60;

/// Upper bound on a link message body; anything larger is garbage.
const MAX_LINK_SIZE: usize = 4096;

// ── LinkError ────────────────────────────────────────────────────

/// Non-zero link result codes returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("generic link error")]
    Error,
    #[error("invalid magic")]
    InvalidMagic,
    #[error("invalid data")]
    InvalidData,
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("server requires a secure connection")]
    NeedSecured,
    #[error("server requires an unsecure connection")]
    NeedUnsecured,
    #[error("permission denied")]
    PermissionDenied,
    #[error("bad connection id")]
    BadConnectionId,
    #[error("channel not available")]
    ChannelNotAvailable,
    #[error("unknown link error {0}")]
    Unknown(u32),
}

impl LinkError {
    /// `None` for the success code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => return None,
            1 => LinkError::Error,
            2 => LinkError::InvalidMagic,
            3 => LinkError::InvalidData,
            4 => LinkError::VersionMismatch,
            5 => LinkError::NeedSecured,
            6 => LinkError::NeedUnsecured,
            7 => LinkError::PermissionDenied,
            8 => LinkError::BadConnectionId,
            9 => LinkError::ChannelNotAvailable,
            other => LinkError::Unknown(other),
        })
    }

    pub fn code(&self) -> u32 {
        match self {
            LinkError::Error => 1,
            LinkError::InvalidMagic => 2,
            LinkError::InvalidData => 3,
            LinkError::VersionMismatch => 4,
            LinkError::NeedSecured => 5,
            LinkError::NeedUnsecured => 6,
            LinkError::PermissionDenied => 7,
            LinkError::BadConnectionId => 8,
            LinkError::ChannelNotAvailable => 9,
            LinkError::Unknown(code) => *code,
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHeader {
    pub magic: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub size: u32,
}

impl LinkHeader {
    pub const SIZE: usize = 16;

    pub fn new(size: u32) -> Self {
        Self {
            magic: LINK_MAGIC,
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            size,
        }
    }

    /// Decode and check magic and major version.
    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        let header: LinkHeader = decode(bytes)?;
        if header.magic != LINK_MAGIC {
            return Err(SpiceError::protocol(format!("bad link magic {:#x}", header.magic)));
        }
        if header.major_version != VERSION_MAJOR {
            return Err(SpiceError::protocol(format!(
                "link version {}.{} not supported",
                header.major_version, header.minor_version
            )));
        }
        if header.size as usize > MAX_LINK_SIZE {
            return Err(SpiceError::protocol(format!("link message of {} bytes", header.size)));
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LinkMessFixed {
    connection_id: u32,
    channel_type: u8,
    channel_id: u8,
    num_common_caps: u32,
    num_channel_caps: u32,
    caps_offset: u32,
}

/// The client's link request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMess {
    pub connection_id: u32,
    pub channel_type: u8,
    pub channel_id: u8,
    pub caps: Capabilities,
}

impl LinkMess {
    pub const FIXED_SIZE: usize = 18;

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        let mut out = encode(&LinkMessFixed {
            connection_id: self.connection_id,
            channel_type: self.channel_type,
            channel_id: self.channel_id,
            num_common_caps: self.caps.common.len() as u32,
            num_channel_caps: self.caps.channel.len() as u32,
            caps_offset: Self::FIXED_SIZE as u32,
        })?;
        put_caps(&mut out, &self.caps);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        let fixed: LinkMessFixed = decode(bytes)?;
        let caps = read_caps(
            bytes,
            fixed.caps_offset,
            fixed.num_common_caps,
            fixed.num_channel_caps,
        )?;
        Ok(Self {
            connection_id: fixed.connection_id,
            channel_type: fixed.channel_type,
            channel_id: fixed.channel_id,
            caps,
        })
    }
}

/// The server's answer to [`LinkMess`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReply {
    pub error: u32,
    pub pub_key: Vec<u8>,
    pub caps: Capabilities,
}

impl LinkReply {
    pub const FIXED_SIZE: usize = 4 + PUB_KEY_SIZE + 12;

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        if self.pub_key.len() != PUB_KEY_SIZE {
            return Err(SpiceError::Encoding(format!(
                "public key must be {PUB_KEY_SIZE} bytes, got {}",
                self.pub_key.len()
            )));
        }
        let mut out = Vec::with_capacity(Self::FIXED_SIZE);
        out.extend_from_slice(&self.error.to_le_bytes());
        out.extend_from_slice(&self.pub_key);
        out.extend_from_slice(&(self.caps.common.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.caps.channel.len() as u32).to_le_bytes());
        out.extend_from_slice(&(Self::FIXED_SIZE as u32).to_le_bytes());
        put_caps(&mut out, &self.caps);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        if bytes.len() < Self::FIXED_SIZE {
            return Err(SpiceError::protocol(format!(
                "link reply too short: {} < {}",
                bytes.len(),
                Self::FIXED_SIZE
            )));
        }
        let error: u32 = decode(&bytes[0..4])?;
        let pub_key = bytes[4..4 + PUB_KEY_SIZE].to_vec();
        let (num_common, num_channel, caps_offset): (u32, u32, u32) =
            decode(&bytes[4 + PUB_KEY_SIZE..])?;
        let caps = read_caps(bytes, caps_offset, num_common, num_channel)?;
        Ok(Self {
            error,
            pub_key,
            caps,
        })
    }
}

fn put_caps(out: &mut Vec<u8>, caps: &Capabilities) {
    for w in caps.common.words().iter().chain(caps.channel.words()) {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

fn read_caps(
    bytes: &[u8],
    offset: u32,
    num_common: u32,
    num_channel: u32,
) -> Result<Capabilities, SpiceError> {
    let start = offset as usize;
    let total = num_common as usize + num_channel as usize;
    let end = start + total * 4;
    if end > bytes.len() {
        return Err(SpiceError::protocol("capability words out of bounds"));
    }
    let words: Vec<u32> = bytes[start..end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let (common, channel) = words.split_at(num_common as usize);
    Ok(Capabilities::new(
        CapabilitySet::from_words(common.to_vec()),
        CapabilitySet::from_words(channel.to_vec()),
    ))
}

// ── Ticket sealing ───────────────────────────────────────────────

/// Encrypts the password against the server's link public key.
pub trait TicketSealer: Send + Sync {
    /// Produce the [`TICKET_SIZE`]-byte ticket sent after the link reply.
    fn seal(&self, pub_key: &[u8], password: &str) -> Result<Vec<u8>, SpiceError>;
}

/// RSA-OAEP (SHA-1) sealing of the NUL-terminated password.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaTicketSealer;

impl TicketSealer for RsaTicketSealer {
    fn seal(&self, pub_key: &[u8], password: &str) -> Result<Vec<u8>, SpiceError> {
        if password.len() > MAX_PASSWORD_LENGTH {
            return Err(SpiceError::Encoding(format!(
                "password longer than {MAX_PASSWORD_LENGTH} bytes"
            )));
        }
        let key = rsa::RsaPublicKey::from_public_key_der(pub_key)
            .map_err(|e| SpiceError::protocol(format!("bad link public key: {e}")))?;
        let mut plain = password.as_bytes().to_vec();
        plain.push(0);
        let sealed = key
            .encrypt(&mut rand::thread_rng(), rsa::Oaep::new::<sha1::Sha1>(), &plain)
            .map_err(|e| SpiceError::Encoding(format!("ticket encryption failed: {e}")))?;
        if sealed.len() != TICKET_SIZE {
            return Err(SpiceError::Encoding(format!(
                "ticket is {} bytes, expected {TICKET_SIZE}",
                sealed.len()
            )));
        }
        Ok(sealed)
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// What the client offers in a link.
pub struct LinkRequest<'a> {
    pub connection_id: u32,
    pub identity: ChannelIdentity,
    pub caps: &'a Capabilities,
    pub password: &'a str,
}

/// Run the client side of the link exchange and return the server's
/// capability vectors.
pub async fn link(
    peer: &mut Peer,
    request: &LinkRequest<'_>,
    sealer: &dyn TicketSealer,
) -> Result<Capabilities, SpiceError> {
    let mess = LinkMess {
        connection_id: request.connection_id,
        channel_type: request.identity.channel_type as u8,
        channel_id: request.identity.id,
        caps: request.caps.clone(),
    }
    .encode()?;
    let mut out = encode(&LinkHeader::new(mess.len() as u32))?;
    out.extend(mess);
    peer.send(&out).await?;

    let mut head = [0u8; LinkHeader::SIZE];
    peer.receive(&mut head).await?;
    let header = LinkHeader::decode(&head)?;
    let mut body = vec![0u8; header.size as usize];
    peer.receive(&mut body).await?;
    let reply = LinkReply::decode(&body)?;
    if let Some(err) = LinkError::from_code(reply.error) {
        return Err(err.into());
    }

    let ticket = sealer.seal(&reply.pub_key, request.password)?;
    peer.send(&ticket).await?;

    let mut result = [0u8; 4];
    peer.receive(&mut result).await?;
    if let Some(err) = LinkError::from_code(u32::from_le_bytes(result)) {
        return Err(err.into());
    }

    debug!(
        channel = %request.identity,
        connection_id = request.connection_id,
        "link established"
    );
    Ok(reply.caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChannelType;
    use crate::transport::PeerStream;
    use crate::transport::peer::connect_tcp;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, server) = tokio::join!(connect_tcp("127.0.0.1", port), listener.accept());
        (Peer::from_stream(PeerStream::Plain(client.unwrap())), server.unwrap().0)
    }

    struct PlainSealer;

    impl TicketSealer for PlainSealer {
        fn seal(&self, _pub_key: &[u8], password: &str) -> Result<Vec<u8>, SpiceError> {
            let mut t = password.as_bytes().to_vec();
            t.resize(TICKET_SIZE, 0);
            Ok(t)
        }
    }

    fn caps() -> Capabilities {
        Capabilities::new(CapabilitySet::new().with(1), CapabilitySet::new().with(0).with(40))
    }

    #[test]
    fn magic_is_redq() {
        assert_eq!(&LINK_MAGIC.to_le_bytes(), b"REDQ");
    }

    #[test]
    fn link_mess_layout() {
        let mess = LinkMess {
            connection_id: 9,
            channel_type: ChannelType::Inputs as u8,
            channel_id: 0,
            caps: caps(),
        };
        let bytes = mess.encode().unwrap();
        assert_eq!(bytes.len(), LinkMess::FIXED_SIZE + 3 * 4);
        assert_eq!(bytes[4], 3);
        assert_eq!(LinkMess::decode(&bytes).unwrap(), mess);
    }

    #[test]
    fn link_reply_layout() {
        let reply = LinkReply {
            error: 0,
            pub_key: vec![0xAB; PUB_KEY_SIZE],
            caps: caps(),
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), LinkReply::FIXED_SIZE + 12);
        assert_eq!(LinkReply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut h = LinkHeader::new(18);
        h.magic = 0x1234;
        assert!(LinkHeader::decode(&encode(&h).unwrap()).is_err());
        let mut h = LinkHeader::new(18);
        h.major_version = 2;
        assert!(LinkHeader::decode(&encode(&h).unwrap()).is_err());
    }

    #[test]
    fn link_error_codes() {
        assert_eq!(LinkError::from_code(0), None);
        assert_eq!(LinkError::from_code(5), Some(LinkError::NeedSecured));
        assert_eq!(LinkError::from_code(77), Some(LinkError::Unknown(77)));
        assert_eq!(LinkError::PermissionDenied.code(), 7);
    }

    #[test]
    fn rsa_sealer_rejects_long_password() {
        let long = "x".repeat(MAX_PASSWORD_LENGTH + 1);
        assert!(RsaTicketSealer.seal(&[0u8; PUB_KEY_SIZE], &long).is_err());
    }

    #[tokio::test]
    async fn handshake_against_scripted_server() {
        let (mut client, mut server) = pair().await;

        let server_task = tokio::spawn(async move {
            let mut head = [0u8; LinkHeader::SIZE];
            server.read_exact(&mut head).await.unwrap();
            let header = LinkHeader::decode(&head).unwrap();
            let mut body = vec![0u8; header.size as usize];
            server.read_exact(&mut body).await.unwrap();
            let mess = LinkMess::decode(&body).unwrap();

            let reply = LinkReply {
                error: 0,
                pub_key: vec![0; PUB_KEY_SIZE],
                caps: Capabilities::new(CapabilitySet::new().with(3), CapabilitySet::new()),
            }
            .encode()
            .unwrap();
            let mut out = encode(&LinkHeader::new(reply.len() as u32)).unwrap();
            out.extend(reply);
            server.write_all(&out).await.unwrap();

            let mut ticket = [0u8; TICKET_SIZE];
            server.read_exact(&mut ticket).await.unwrap();
            server.write_all(&0u32.to_le_bytes()).await.unwrap();
            (mess, ticket)
        });

        let local = caps();
        let request = LinkRequest {
            connection_id: 42,
            identity: ChannelIdentity::new(ChannelType::Display, 1),
            caps: &local,
            password: "secret",
        };
        let remote = link(&mut client, &request, &PlainSealer).await.unwrap();
        assert!(remote.common.test(3));

        let (mess, ticket) = server_task.await.unwrap();
        assert_eq!(mess.connection_id, 42);
        assert_eq!(mess.channel_type, ChannelType::Display as u8);
        assert_eq!(mess.channel_id, 1);
        assert_eq!(mess.caps, local);
        assert_eq!(&ticket[..6], b"secret");
    }

    #[tokio::test]
    async fn server_link_error_is_typed() {
        let (mut client, mut server) = pair().await;
        tokio::spawn(async move {
            let mut head = [0u8; LinkHeader::SIZE];
            server.read_exact(&mut head).await.unwrap();
            let header = LinkHeader::decode(&head).unwrap();
            let mut body = vec![0u8; header.size as usize];
            server.read_exact(&mut body).await.unwrap();
            let reply = LinkReply {
                error: LinkError::NeedSecured.code(),
                pub_key: vec![0; PUB_KEY_SIZE],
                caps: Capabilities::default(),
            }
            .encode()
            .unwrap();
            let mut out = encode(&LinkHeader::new(reply.len() as u32)).unwrap();
            out.extend(reply);
            server.write_all(&out).await.unwrap();
        });

        let local = Capabilities::default();
        let request = LinkRequest {
            connection_id: 0,
            identity: ChannelIdentity::MAIN,
            caps: &local,
            password: "",
        };
        let err = link(&mut client, &request, &PlainSealer).await.unwrap_err();
        assert!(matches!(err, SpiceError::Link(LinkError::NeedSecured)));
    }
}

// Framed wire protocol between the gateway and a remote broker.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u32 = 0x57534731;
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large: {length} bytes (cap {cap})")]
    FrameTooLarge { length: usize, cap: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        // Network byte order throughout.
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        // Validate the header before trusting the declared length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Messages exchanged with the broker, framed as JSON payloads.
///
/// ```
/// use wsgate_bridge::wire::WireMessage;
///
/// let message = WireMessage::Publish {
///     tenant: "t1".to_string(),
///     namespace: "ns1".to_string(),
///     topic: "orders".to_string(),
///     payload: b"hello".to_vec(),
///     request_id: 1,
/// };
/// let encoded = message.encode().expect("encode");
/// let decoded = WireMessage::decode_payload(&encoded[12..]).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    // Publish one payload; the broker answers with PublishOk or PublishError.
    Publish {
        tenant: String,
        namespace: String,
        topic: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        request_id: u64,
    },
    PublishOk {
        request_id: u64,
    },
    PublishError {
        request_id: u64,
        message: String,
    },
    // Attach to a named subscription; the broker answers with Subscribed.
    Subscribe {
        tenant: String,
        namespace: String,
        topic: String,
        subscription: String,
    },
    Subscribed,
    // One delivered message; message_id is only meaningful for Ack.
    Event {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        message_id: u64,
    },
    Ack {
        message_id: u64,
    },
    Error {
        message: String,
    },
}

impl WireMessage {
    /// Encode into a complete frame (header + JSON body).
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self).map_err(Error::Serialize)?;
        if body.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge {
                length: body.len(),
                cap: u32::MAX as usize,
            });
        }
        let header = FrameHeader::new(0, body.len() as u32);
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body.len());
        let mut header_bytes = [0u8; FrameHeader::LEN];
        header.encode_into(&mut header_bytes);
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}

/// Write one message to the stream.
pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message from the stream. `Ok(None)` means the peer closed the
/// connection at a frame boundary.
pub async fn read_message<R>(
    reader: &mut R,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::decode(&header_bytes)?;
    let length = header.length as usize;

    // Enforce the frame cap before allocating for the payload.
    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            length,
            cap: max_frame_bytes,
        });
    }

    // The caller-owned scratch buffer keeps frame reads allocation-free.
    scratch.clear();
    scratch.resize(length, 0u8);
    reader.read_exact(&mut scratch[..]).await?;
    let message = WireMessage::decode_payload(&scratch[..])?;
    Ok(Some(message))
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

use std::net::SocketAddr;

use blogmesh_types::PeerId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, NetResult};

/// Maximum payload size of a single frame (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Messages exchanged by [`TcpPeerLink`](crate::TcpPeerLink)s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message on every connection, in both directions.
    Hello {
        peer: PeerId,
        protocols: Vec<String>,
        /// Port the sender accepts connections on.
        listen_port: u16,
        /// Peers the sender is connected to, at their listen addresses.
        known_peers: Vec<(PeerId, SocketAddr)>,
    },
    IdentifyRequest {
        id: u64,
    },
    IdentifyResponse {
        id: u64,
        protocols: Vec<String>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
}

impl WireMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => 0x01,
            Self::IdentifyRequest { .. } => 0x02,
            Self::IdentifyResponse { .. } => 0x03,
            Self::Publish { .. } => 0x10,
        }
    }
}

/// Frame layout: `[4 bytes len][1 byte tag][bincode payload]`, where `len`
/// counts the tag and the payload.
pub struct WireCodec;

impl WireCodec {
    pub fn encode(msg: &WireMessage) -> NetResult<Vec<u8>> {
        let payload =
            bincode::serialize(msg).map_err(|e| NetError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `data`. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> NetResult<(WireMessage, usize)> {
        if data.len() < 5 {
            return Err(NetError::Framing("too short".into()));
        }
        let len = frame_len([data[0], data[1], data[2], data[3]])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(NetError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = Self::decode_body(data[4], &data[5..total])?;
        Ok((msg, total))
    }

    fn decode_body(tag: u8, payload: &[u8]) -> NetResult<WireMessage> {
        let msg: WireMessage = bincode::deserialize(payload)
            .map_err(|e| NetError::Deserialization(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(NetError::Framing(format!(
                "tag {tag:#04x} does not match payload {:#04x}",
                msg.type_tag()
            )));
        }
        Ok(msg)
    }
}

fn frame_len(header: [u8; 4]) -> NetResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len < 1 {
        return Err(NetError::Framing("zero-length frame".into()));
    }
    if len - 1 > MAX_MESSAGE_SIZE {
        return Err(NetError::MessageTooLarge {
            size: len - 1,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

/// Read one frame. Returns `None` on a clean end of stream before a header.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> NetResult<Option<WireMessage>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    WireCodec::decode_body(body[0], &body[1..]).map(Some)
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> NetResult<()> {
    let frame = WireCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> WireMessage {
        WireMessage::Hello {
            peer: PeerId::from_raw([7; 32]),
            protocols: vec!["/blogmesh/heads/blogmesh/abc".into()],
            listen_port: 4100,
            known_peers: vec![(PeerId::from_raw([8; 32]), "127.0.0.1:4101".parse().unwrap())],
        }
    }

    #[test]
    fn frame_header_counts_tag_and_payload() {
        let encoded = WireCodec::encode(&hello()).unwrap();
        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 4);
        assert_eq!(encoded[4], 0x01);
        let (decoded, consumed) = WireCodec::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, hello());
    }

    #[test]
    fn decode_consumes_one_frame_of_many() {
        let mut buf = WireCodec::encode(&WireMessage::IdentifyRequest { id: 1 }).unwrap();
        let first = buf.len();
        buf.extend(WireCodec::encode(&WireMessage::IdentifyRequest { id: 2 }).unwrap());
        let (msg, consumed) = WireCodec::decode(&buf).unwrap();
        assert_eq!(msg, WireMessage::IdentifyRequest { id: 1 });
        assert_eq!(consumed, first);
    }

    #[test]
    fn rejects_short_and_truncated_input() {
        assert!(matches!(WireCodec::decode(&[0, 0]), Err(NetError::Framing(_))));
        let encoded = WireCodec::encode(&hello()).unwrap();
        assert!(matches!(
            WireCodec::decode(&encoded[..encoded.len() - 1]),
            Err(NetError::Framing(_))
        ));
    }

    #[test]
    fn rejects_mismatched_tag() {
        let mut encoded = WireCodec::encode(&WireMessage::IdentifyRequest { id: 3 }).unwrap();
        encoded[4] = 0x10;
        assert!(matches!(WireCodec::decode(&encoded), Err(NetError::Framing(_))));
    }

    #[test]
    fn rejects_oversized_header() {
        let mut data = ((MAX_MESSAGE_SIZE + 2) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&[0x10, 0]);
        assert!(matches!(
            WireCodec::decode(&data),
            Err(NetError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn async_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = WireMessage::Publish {
            topic: "blogmesh/announce/v1".into(),
            data: b"/blogmesh/abc".to_vec(),
        };
        write_message(&mut a, &msg).await.unwrap();
        drop(a);
        assert_eq!(read_message(&mut b).await.unwrap(), Some(msg));
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }
}

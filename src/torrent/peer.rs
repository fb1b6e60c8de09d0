//! Peer Wire Protocol
//!
//! Message framing for the BitTorrent peer wire protocol (BEP 3) plus the
//! Fast Extension (BEP 6) and Extension Protocol (BEP 10) envelopes, and the
//! fixed 68-byte protocol handshake that precedes framed traffic.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes: a
//! type tag and the type-specific fields. A zero length is a keep-alive.

use bitvec::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::metainfo::Sha1Hash;
use crate::error::{HandshakeError, WireError};

/// Protocol string for BitTorrent
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Length-prefixed protocol string, the first 20 bytes of a plaintext handshake
pub const PROTOCOL_HEADER: &[u8; 20] = b"\x13BitTorrent protocol";

/// Size of the handshake message
pub const HANDSHAKE_SIZE: usize = 68; // 1 + 19 + 8 + 20 + 20

/// Default block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Message type tags
pub mod message_id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 0x0D;
    pub const HAVE_ALL: u8 = 0x0E;
    pub const HAVE_NONE: u8 = 0x0F;
    pub const REJECT: u8 = 0x10;
    pub const ALLOWED_FAST: u8 = 0x11;
    pub const EXTENDED: u8 = 20;
}

/// Reserved bytes for extensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservedBytes(pub [u8; 8]);

impl ReservedBytes {
    /// Create reserved bytes with extension support flags
    pub fn with_extensions() -> Self {
        let mut reserved = [0u8; 8];
        // Bit 20 (from the right, byte 5 bit 4) = Extension Protocol (BEP 10)
        reserved[5] |= 0x10;
        // Bit 2 (from the right, byte 7 bit 2) = Fast Extension (BEP 6)
        reserved[7] |= 0x04;
        Self(reserved)
    }

    /// Advertise DHT support (BEP 5)
    pub fn set_dht(&mut self) {
        self.0[7] |= 0x01;
    }

    /// Check if Extension Protocol is supported
    pub fn supports_extension_protocol(&self) -> bool {
        (self.0[5] & 0x10) != 0
    }

    /// Check if DHT is supported (BEP 5)
    pub fn supports_dht(&self) -> bool {
        (self.0[7] & 0x01) != 0
    }

    /// Check if Fast Extension is supported (BEP 6)
    pub fn supports_fast(&self) -> bool {
        (self.0[7] & 0x04) != 0
    }
}

/// Peer wire protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep connection alive (no payload)
    KeepAlive,

    /// Choke the peer (stop sending data)
    Choke,

    /// Unchoke the peer (start sending data)
    Unchoke,

    /// Interested in peer's data
    Interested,

    /// Not interested in peer's data
    NotInterested,

    /// Have a specific piece
    Have { piece_index: u32 },

    /// Bitfield of pieces we have, most significant bit first.
    ///
    /// The frame carries whole bytes and no bit count, so a decoded
    /// bitfield is padded with zero bits to a multiple of 8. Receivers
    /// truncate it to the torrent's piece count.
    Bitfield { bitfield: BitVec<u8, Msb0> },

    /// Request a block
    Request { index: u32, begin: u32, length: u32 },

    /// Piece data (response to request)
    Piece { index: u32, begin: u32, block: Bytes },

    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },

    /// DHT port (BEP 5)
    Port { port: u16 },

    /// Suggest a piece to download (BEP 6)
    SuggestPiece { piece_index: u32 },

    /// Peer has all pieces (BEP 6)
    HaveAll,

    /// Peer has no pieces (BEP 6)
    HaveNone,

    /// Reject a request (BEP 6)
    RejectRequest { index: u32, begin: u32, length: u32 },

    /// Piece may be requested while choked (BEP 6)
    AllowedFast { piece_index: u32 },

    /// Extension message (BEP 10)
    Extended { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Get the message ID
    pub fn id(&self) -> Option<u8> {
        use message_id::*;
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(CHOKE),
            Self::Unchoke => Some(UNCHOKE),
            Self::Interested => Some(INTERESTED),
            Self::NotInterested => Some(NOT_INTERESTED),
            Self::Have { .. } => Some(HAVE),
            Self::Bitfield { .. } => Some(BITFIELD),
            Self::Request { .. } => Some(REQUEST),
            Self::Piece { .. } => Some(PIECE),
            Self::Cancel { .. } => Some(CANCEL),
            Self::Port { .. } => Some(PORT),
            Self::SuggestPiece { .. } => Some(SUGGEST),
            Self::HaveAll => Some(HAVE_ALL),
            Self::HaveNone => Some(HAVE_NONE),
            Self::RejectRequest { .. } => Some(REJECT),
            Self::AllowedFast { .. } => Some(ALLOWED_FAST),
            Self::Extended { .. } => Some(EXTENDED),
        }
    }

    /// Length of the frame body (tag + fields), excluding the length prefix
    pub fn body_len(&self) -> usize {
        match self {
            Self::KeepAlive => 0,
            Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested
            | Self::HaveAll
            | Self::HaveNone => 1,
            Self::Have { .. } | Self::SuggestPiece { .. } | Self::AllowedFast { .. } => 5,
            Self::Bitfield { bitfield } => 1 + bitfield.len().div_ceil(8),
            Self::Request { .. } | Self::Cancel { .. } | Self::RejectRequest { .. } => 13,
            Self::Piece { block, .. } => 9 + block.len(),
            Self::Port { .. } => 3,
            Self::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    /// Encode the message, length prefix included
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.body_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded message to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.body_len());
        buf.put_u32(self.body_len() as u32);

        let Some(id) = self.id() else {
            return;
        };
        buf.put_u8(id);

        match self {
            Self::Have { piece_index }
            | Self::SuggestPiece { piece_index }
            | Self::AllowedFast { piece_index } => buf.put_u32(*piece_index),

            Self::Bitfield { bitfield } => {
                let mut packed = vec![0u8; bitfield.len().div_ceil(8)];
                for i in bitfield.iter_ones() {
                    packed[i / 8] |= 0x80 >> (i % 8);
                }
                buf.put_slice(&packed);
            }

            Self::Request {
                index,
                begin,
                length,
            }
            | Self::Cancel {
                index,
                begin,
                length,
            }
            | Self::RejectRequest {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }

            Self::Port { port } => buf.put_u16(*port),

            Self::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }

            Self::KeepAlive
            | Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested
            | Self::HaveAll
            | Self::HaveNone => {}
        }
    }

    /// Parse a frame body (type tag + fields, no length prefix).
    ///
    /// An empty body is a keep-alive. Bytes left over after the fields of the
    /// type are an error, never silently dropped.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        use message_id::*;

        let Some((&id, payload)) = frame.split_first() else {
            return Ok(Self::KeepAlive);
        };
        let mut fields = Fields::new(payload);

        let msg = match id {
            CHOKE => Self::Choke,
            UNCHOKE => Self::Unchoke,
            INTERESTED => Self::Interested,
            NOT_INTERESTED => Self::NotInterested,
            HAVE_ALL => Self::HaveAll,
            HAVE_NONE => Self::HaveNone,

            HAVE => Self::Have {
                piece_index: fields.u32()?,
            },
            SUGGEST => Self::SuggestPiece {
                piece_index: fields.u32()?,
            },
            ALLOWED_FAST => Self::AllowedFast {
                piece_index: fields.u32()?,
            },

            REQUEST | CANCEL | REJECT => {
                let index = fields.u32()?;
                let begin = fields.u32()?;
                let length = fields.u32()?;
                match id {
                    REQUEST => Self::Request {
                        index,
                        begin,
                        length,
                    },
                    CANCEL => Self::Cancel {
                        index,
                        begin,
                        length,
                    },
                    _ => Self::RejectRequest {
                        index,
                        begin,
                        length,
                    },
                }
            }

            BITFIELD => Self::Bitfield {
                bitfield: BitVec::from_vec(fields.rest().to_vec()),
            },

            PIECE => {
                let index = fields.u32()?;
                let begin = fields.u32()?;
                Self::Piece {
                    index,
                    begin,
                    block: Bytes::copy_from_slice(fields.rest()),
                }
            }

            PORT => Self::Port {
                port: fields.u16()?,
            },

            EXTENDED => {
                let ext_id = fields.u8()?;
                Self::Extended {
                    id: ext_id,
                    payload: Bytes::copy_from_slice(fields.rest()),
                }
            }

            other => return Err(WireError::UnknownMessageType(other)),
        };

        let unused = fields.remaining();
        if unused != 0 {
            return Err(WireError::TrailingBytes {
                count: unused,
                message_type: id,
            });
        }

        Ok(msg)
    }
}

/// Big-endian field reader over one frame body
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(WireError::UnexpectedEnd)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Reads framed messages from a byte stream
pub struct MessageDecoder<R> {
    reader: R,
    max_length: u32,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageDecoder<R> {
    /// Create a decoder that rejects frames longer than `max_length`
    pub fn new(reader: R, max_length: u32) -> Self {
        Self {
            reader,
            max_length,
            buffer: BytesMut::new(),
        }
    }

    /// Largest accepted frame body
    pub fn max_length(&self) -> u32 {
        self.max_length
    }

    /// Decode the next message.
    ///
    /// Returns `WireError::Ended` if the stream closes exactly on a frame
    /// boundary and `WireError::UnexpectedEnd` if it closes inside a frame.
    pub async fn decode(&mut self) -> Result<PeerMessage, WireError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    WireError::Ended
                } else {
                    WireError::UnexpectedEnd
                });
            }
            filled += n;
        }

        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > self.max_length {
            return Err(WireError::MessageTooLong {
                length,
                max: self.max_length,
            });
        }

        self.buffer.clear();
        self.buffer.resize(length as usize, 0);
        self.reader
            .read_exact(&mut self.buffer)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => WireError::UnexpectedEnd,
                _ => WireError::Io(e),
            })?;

        PeerMessage::parse(&self.buffer)
    }

    /// Mutable access to the underlying stream
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Encode and write one message
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &PeerMessage,
) -> Result<(), WireError> {
    writer.write_all(&msg.encode()).await?;
    Ok(())
}

/// The fixed-size protocol handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: ReservedBytes,
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: ReservedBytes::with_extensions(),
            info_hash,
            peer_id,
        }
    }

    /// Serialize to the 68-byte wire form
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[..20].copy_from_slice(PROTOCOL_HEADER);
        buf[20..28].copy_from_slice(&self.reserved.0);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse the 68-byte wire form
    pub fn parse(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Self, HandshakeError> {
        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(HandshakeError::InvalidProtocol(format!(
                "Invalid protocol string length: {}",
                pstrlen
            )));
        }
        if &buf[1..20] != PROTOCOL_STRING {
            return Err(HandshakeError::InvalidProtocol(
                "Invalid protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved: ReservedBytes(reserved),
            info_hash,
            peer_id,
        })
    }
}

/// Write our handshake
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    handshake: &Handshake,
) -> Result<(), HandshakeError> {
    writer.write_all(&handshake.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the remote handshake
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Handshake, HandshakeError> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut buf).await?;
    Handshake::parse(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode_all(bytes: &[u8], max: u32) -> Result<PeerMessage, WireError> {
        let mut decoder = MessageDecoder::new(bytes, max);
        decoder.decode().await
    }

    #[test]
    fn test_keepalive_encoding() {
        assert_eq!(&PeerMessage::KeepAlive.encode()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_have_encoding() {
        let encoded = PeerMessage::Have { piece_index: 42 }.encode();
        assert_eq!(&encoded[..], b"\x00\x00\x00\x05\x04\x00\x00\x00\x2a");
    }

    #[test]
    fn test_bitfield_encoding() {
        let mut bits = bitvec![u8, Msb0; 0; 37];
        bits.set(2, true);
        bits.set(7, true);
        bits.set(32, true);
        let encoded = PeerMessage::Bitfield { bitfield: bits }.encode();
        assert_eq!(&encoded[..4], &[0, 0, 0, 6]);
        assert_eq!(encoded[4], message_id::BITFIELD);
        assert_eq!(&encoded[5..], b"\x21\x00\x00\x00\x80");
    }

    #[tokio::test]
    async fn test_bitfield_decodes_padded() {
        let mut bits = bitvec![u8, Msb0; 0; 37];
        bits.set(2, true);
        bits.set(36, true);
        let encoded = PeerMessage::Bitfield {
            bitfield: bits.clone(),
        }
        .encode();

        let PeerMessage::Bitfield { bitfield } = decode_all(&encoded, 64).await.unwrap() else {
            panic!("expected a bitfield");
        };
        assert_eq!(bitfield.len(), 40);
        assert_eq!(&bitfield[..37], &bits[..]);
        assert!(bitfield[37..].not_any());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let messages = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have { piece_index: 7 },
            PeerMessage::Bitfield {
                bitfield: bitvec![u8, Msb0; 1, 0, 1, 0, 0, 0, 0, 1, 1, 1, 0, 0, 0, 0, 0, 0],
            },
            PeerMessage::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            PeerMessage::Piece {
                index: 3,
                begin: 0,
                block: Bytes::from_static(b"some block data"),
            },
            PeerMessage::Cancel {
                index: u32::MAX,
                begin: 2,
                length: 3,
            },
            PeerMessage::Port { port: 6881 },
            PeerMessage::SuggestPiece { piece_index: 9 },
            PeerMessage::HaveAll,
            PeerMessage::HaveNone,
            PeerMessage::RejectRequest {
                index: 4,
                begin: 5,
                length: 6,
            },
            PeerMessage::AllowedFast { piece_index: 11 },
            PeerMessage::Extended {
                id: 1,
                payload: Bytes::from_static(b"d1:md6:ut_pexi1eee"),
            },
        ];

        for msg in messages {
            let encoded = msg.encode();
            assert_eq!(encoded.len(), 4 + msg.body_len());
            let decoded = decode_all(&encoded, encoded.len() as u32).await.unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[tokio::test]
    async fn test_keepalive_consumes_only_prefix() {
        let mut stream: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 1, 1];
        let mut decoder = MessageDecoder::new(&mut stream, 1024);
        assert_eq!(decoder.decode().await.unwrap(), PeerMessage::KeepAlive);
        assert_eq!(decoder.decode().await.unwrap(), PeerMessage::Unchoke);
        assert!(matches!(decoder.decode().await, Err(WireError::Ended)));
    }

    #[tokio::test]
    async fn test_trailing_bytes() {
        // Have declared as 6 bytes: one byte left after the index
        let bytes = b"\x00\x00\x00\x06\x04\x00\x00\x00\x2a\x00";
        match decode_all(bytes, 1024).await {
            Err(WireError::TrailingBytes {
                count,
                message_type,
            }) => {
                assert_eq!(count, 1);
                assert_eq!(message_type, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let encoded = PeerMessage::Request {
            index: 1,
            begin: 2,
            length: 3,
        }
        .encode();

        for cut in 1..encoded.len() {
            let result = decode_all(&encoded[..cut], 1024).await;
            assert!(
                matches!(result, Err(WireError::UnexpectedEnd)),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_short_fields_inside_frame() {
        // Request declared with only 5 bytes of fields
        let bytes = b"\x00\x00\x00\x06\x06\x00\x00\x00\x01\x00";
        assert!(matches!(
            decode_all(bytes, 1024).await,
            Err(WireError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn test_message_too_long() {
        let encoded = PeerMessage::Piece {
            index: 0,
            begin: 0,
            block: Bytes::from(vec![0u8; 100]),
        }
        .encode();
        match decode_all(&encoded, 50).await {
            Err(WireError::MessageTooLong { length, max }) => {
                assert_eq!(length, 109);
                assert_eq!(max, 50);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let bytes = b"\x00\x00\x00\x01\x63";
        assert!(matches!(
            decode_all(bytes, 1024).await,
            Err(WireError::UnknownMessageType(0x63))
        ));
    }

    #[tokio::test]
    async fn test_ended_on_empty_stream() {
        let result = decode_all(&[], 1024).await;
        assert!(result.unwrap_err().is_clean_close());
    }

    #[test]
    fn test_reserved_bytes() {
        let mut reserved = ReservedBytes::with_extensions();
        assert!(reserved.supports_extension_protocol());
        assert!(reserved.supports_fast());
        assert!(!reserved.supports_dht());
        reserved.set_dht();
        assert!(reserved.supports_dht());
    }

    #[tokio::test]
    async fn test_handshake_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let ours = Handshake::new([7u8; 20], *b"-GB0001-abcdefghijkl");
        write_handshake(&mut a, &ours).await.unwrap();
        let theirs = read_handshake(&mut b).await.unwrap();
        assert_eq!(theirs, ours);
        assert!(theirs.reserved.supports_fast());
    }

    #[test]
    fn test_handshake_rejects_bad_protocol() {
        let mut buf = Handshake::new([0u8; 20], [0u8; 20]).encode();
        buf[5] = b'X';
        assert!(matches!(
            Handshake::parse(&buf),
            Err(HandshakeError::InvalidProtocol(_))
        ));
    }
}

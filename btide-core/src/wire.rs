//! Framing: fixed-size packets, `kind:u16 | error:u16 | payload[4092]`.
//! Integers are little-endian; text fields are NUL-padded.
//!
//! REQUEST payload:  `offset:u32 | length:u32 | hash[64] | ident[1024]`
//! RESPONSE payload: `offset:u32 | data[2998] | data_len:u16 | hash[64] | ident[1024]`
//! Other kinds leave the payload zero-filled.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    ChunkRequest, ChunkResponse, Message, Packet, PacketKind, HASH_FIELD_LEN, HEADER_SIZE,
    IDENT_FIELD_LEN, PACKET_SIZE, SEGMENT_CAPACITY,
};

const REQ_OFFSET: usize = 0;
const REQ_LENGTH: usize = 4;
const REQ_HASH: usize = 8;
const REQ_IDENT: usize = REQ_HASH + HASH_FIELD_LEN;

const RES_OFFSET: usize = 0;
const RES_DATA: usize = 4;
const RES_DATA_LEN: usize = RES_DATA + SEGMENT_CAPACITY;
const RES_HASH: usize = RES_DATA_LEN + 2;
const RES_IDENT: usize = RES_HASH + HASH_FIELD_LEN;

/// Error encoding a packet (a field does not fit its fixed slot).
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("`{field}` is {len} bytes, slot holds {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("`{0}` contains a NUL byte")]
    EmbeddedNul(&'static str),
    #[error("segment of {0} bytes exceeds segment capacity")]
    SegmentTooLarge(usize),
}

/// Error decoding a packet (short buffer, unknown kind or bad field).
#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("packet is {0} bytes, shorter than a full packet")]
    Truncated(usize),
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u16),
    #[error("declared segment length {0} exceeds segment capacity")]
    SegmentTooLarge(u16),
    #[error("`{0}` is not valid UTF-8")]
    InvalidText(&'static str),
}

/// Error moving packets over a peer channel.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] PacketEncodeError),
    #[error(transparent)]
    Decode(#[from] PacketDecodeError),
}

/// Encode a packet into exactly [`PACKET_SIZE`] bytes, zero-padding unused payload.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, PacketEncodeError> {
    let mut out = vec![0u8; PACKET_SIZE];
    out[0..2].copy_from_slice(&packet.kind().code().to_le_bytes());
    out[2..4].copy_from_slice(&packet.error.to_le_bytes());
    let payload = &mut out[HEADER_SIZE..];
    match &packet.message {
        Message::Request(req) => {
            put_u32(payload, REQ_OFFSET, req.offset);
            put_u32(payload, REQ_LENGTH, req.length);
            put_text(payload, REQ_HASH, HASH_FIELD_LEN, "hash", &req.hash)?;
            put_text(payload, REQ_IDENT, IDENT_FIELD_LEN, "ident", &req.ident)?;
        }
        Message::Response(res) => {
            let len = res.data.len();
            if len > SEGMENT_CAPACITY {
                return Err(PacketEncodeError::SegmentTooLarge(len));
            }
            put_u32(payload, RES_OFFSET, res.offset);
            payload[RES_DATA..RES_DATA + len].copy_from_slice(&res.data);
            payload[RES_DATA_LEN..RES_DATA_LEN + 2].copy_from_slice(&(len as u16).to_le_bytes());
            put_text(payload, RES_HASH, HASH_FIELD_LEN, "hash", &res.hash)?;
            put_text(payload, RES_IDENT, IDENT_FIELD_LEN, "ident", &res.ident)?;
        }
        Message::Hello | Message::Ack | Message::Disconnect | Message::Ping | Message::Pong => {}
    }
    Ok(out)
}

/// Decode one packet from the front of `bytes`. Needs at least [`PACKET_SIZE`] bytes.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, PacketDecodeError> {
    if bytes.len() < PACKET_SIZE {
        return Err(PacketDecodeError::Truncated(bytes.len()));
    }
    let code = u16::from_le_bytes([bytes[0], bytes[1]]);
    let error = u16::from_le_bytes([bytes[2], bytes[3]]);
    let kind = PacketKind::from_code(code).ok_or(PacketDecodeError::UnknownKind(code))?;
    let payload = &bytes[HEADER_SIZE..PACKET_SIZE];
    let message = match kind {
        PacketKind::Hello => Message::Hello,
        PacketKind::Ack => Message::Ack,
        PacketKind::Disconnect => Message::Disconnect,
        PacketKind::Ping => Message::Ping,
        PacketKind::Pong => Message::Pong,
        PacketKind::Request => Message::Request(ChunkRequest {
            offset: get_u32(payload, REQ_OFFSET),
            length: get_u32(payload, REQ_LENGTH),
            hash: get_text(payload, REQ_HASH, HASH_FIELD_LEN, "hash")?,
            ident: get_text(payload, REQ_IDENT, IDENT_FIELD_LEN, "ident")?,
        }),
        PacketKind::Response => {
            let len = u16::from_le_bytes([payload[RES_DATA_LEN], payload[RES_DATA_LEN + 1]]);
            if usize::from(len) > SEGMENT_CAPACITY {
                return Err(PacketDecodeError::SegmentTooLarge(len));
            }
            Message::Response(ChunkResponse {
                offset: get_u32(payload, RES_OFFSET),
                data: payload[RES_DATA..RES_DATA + usize::from(len)].to_vec(),
                hash: get_text(payload, RES_HASH, HASH_FIELD_LEN, "hash")?,
                ident: get_text(payload, RES_IDENT, IDENT_FIELD_LEN, "ident")?,
            })
        }
    };
    Ok(Packet { error, message })
}

/// Encode and write one packet, then flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_packet(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one packet. `Ok(None)` if the channel closed cleanly before a new packet began.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; PACKET_SIZE];
    let mut filled = 0;
    while filled < PACKET_SIZE {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("channel closed after {filled} of {PACKET_SIZE} bytes"),
            )));
        }
        filled += n;
    }
    Ok(Some(decode_packet(&frame)?))
}

fn put_u32(payload: &mut [u8], at: usize, v: u32) {
    payload[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn put_text(
    payload: &mut [u8],
    at: usize,
    width: usize,
    field: &'static str,
    text: &str,
) -> Result<(), PacketEncodeError> {
    let bytes = text.as_bytes();
    if bytes.len() > width {
        return Err(PacketEncodeError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width,
        });
    }
    if bytes.contains(&0) {
        return Err(PacketEncodeError::EmbeddedNul(field));
    }
    payload[at..at + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn get_text(
    payload: &[u8],
    at: usize,
    width: usize,
    field: &'static str,
) -> Result<String, PacketDecodeError> {
    let slot = &payload[at..at + width];
    let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8(slot[..end].to_vec()).map_err(|_| PacketDecodeError::InvalidText(field))
}

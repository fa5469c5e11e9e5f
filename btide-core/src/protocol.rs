//! btide wire protocol: packet kinds, message bodies and fixed sizes.

/// Every packet on the wire is exactly this many bytes.
pub const PACKET_SIZE: usize = 4096;
/// `kind:u16 | error:u16`.
pub const HEADER_SIZE: usize = 4;
/// Fixed payload region following the header.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;
/// Most file bytes one RESPONSE packet can carry.
pub const SEGMENT_CAPACITY: usize = 2998;
/// Width of the hash field in REQUEST and RESPONSE payloads.
pub const HASH_FIELD_LEN: usize = 64;
/// Width of the identity field in REQUEST and RESPONSE payloads.
pub const IDENT_FIELD_LEN: usize = 1024;

/// Packet kind tag, first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    Pong = 0x00,
    /// Sent by the accepting side when a connection opens.
    Hello = 0x02,
    Disconnect = 0x03,
    Request = 0x06,
    Response = 0x07,
    Ack = 0x0C,
    Ping = 0xFF,
}

impl PacketKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x00 => Self::Pong,
            0x02 => Self::Hello,
            0x03 => Self::Disconnect,
            0x06 => Self::Request,
            0x07 => Self::Response,
            0x0C => Self::Ack,
            0xFF => Self::Ping,
            _ => return None,
        })
    }
}

/// Failure codes a responder puts in the error field of a RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    UnknownPackage = 1,
    FileUnavailable = 2,
    TruncatedSource = 3,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::UnknownPackage),
            2 => Some(Self::FileUnavailable),
            3 => Some(Self::TruncatedSource),
            _ => None,
        }
    }
}

/// Ask a peer for `length` bytes of package `ident` starting at absolute file `offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRequest {
    pub offset: u32,
    pub length: u32,
    pub hash: String,
    pub ident: String,
}

/// One segment of a requested range. `data.len()` never exceeds [`SEGMENT_CAPACITY`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkResponse {
    pub offset: u32,
    pub data: Vec<u8>,
    pub hash: String,
    pub ident: String,
}

impl ChunkResponse {
    /// One past the last file byte this segment covers.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + self.data.len() as u64
    }
}

/// Packet body, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello,
    Ack,
    Disconnect,
    Ping,
    Pong,
    Request(ChunkRequest),
    Response(ChunkResponse),
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::Hello => PacketKind::Hello,
            Message::Ack => PacketKind::Ack,
            Message::Disconnect => PacketKind::Disconnect,
            Message::Ping => PacketKind::Ping,
            Message::Pong => PacketKind::Pong,
            Message::Request(_) => PacketKind::Request,
            Message::Response(_) => PacketKind::Response,
        }
    }
}

/// A decoded packet: error code (0 = success) plus its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub error: u16,
    pub message: Message,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self { error: 0, message }
    }

    /// RESPONSE carrying `code` and echoing the request's offset, hash and identity.
    pub fn error_response(code: ErrorCode, request: &ChunkRequest) -> Self {
        Self {
            error: code.code(),
            message: Message::Response(ChunkResponse {
                offset: request.offset,
                data: Vec::new(),
                hash: request.hash.clone(),
                ident: request.ident.clone(),
            }),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.message.kind()
    }

    pub fn is_error(&self) -> bool {
        self.error != 0
    }
}

impl From<Message> for Packet {
    fn from(message: Message) -> Self {
        Packet::new(message)
    }
}

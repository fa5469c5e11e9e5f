//! btide package engine: manifests, Merkle verification, completion queries
//! and the fixed-frame chunk transfer protocol.
//!
//! File and channel I/O is async (tokio); tree and completion queries are pure.

pub mod chunk;
pub mod completion;
pub mod integrity;
pub mod manifest;
pub mod merkle;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod wire;

pub use completion::{minimum_covering_hashes, CompletedChunks};
pub use manifest::{Chunk, Manifest, ManifestError};
pub use merkle::{MerkleNode, MerkleTree};
pub use protocol::{ChunkRequest, ChunkResponse, ErrorCode, Message, Packet, PacketKind};
pub use registry::{Package, Registry, RegistryError, SharedRegistry};
pub use session::{fetch, serve_request, FetchOptions, TransferError};
pub use wire::{decode_packet, encode_packet, read_packet, write_packet, WireError};

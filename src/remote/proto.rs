//! Wire messages and framing for the remote filesystem protocol.
//!
//! Frames are length-delimited: a 4-byte big-endian length, a 1-byte message
//! type, then the protobuf body. Streaming calls (`Get`, `Put`, `Replicate`)
//! send a sequence of chunk frames terminated by an empty chunk.

use prost::Message;
use std::io::{self, Read, Write};

/// Frames larger than this are rejected as protocol errors.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Minimum chunk size a `Get` may request.
pub const MIN_CHUNK_SIZE: u32 = 1024;

/// Default chunk size for streamed reads.
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// One contiguous range of the 64-bit hash space, inclusive on both ends.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Range {
    /// First hash this range covers.
    #[prost(uint64, tag = "1")]
    pub start: u64,
    /// Last hash this range covers.
    #[prost(uint64, tag = "2")]
    pub end: u64,
}

/// One cluster node and the ranges it owns.
#[derive(Clone, PartialEq, Message)]
pub struct Node {
    /// Unique node name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// host:port the node serves on.
    #[prost(string, tag = "2")]
    pub address: String,
    /// Hash ranges this node owns.
    #[prost(message, repeated, tag = "3")]
    pub ranges: Vec<Range>,
    /// Whether the node is believed reachable.
    #[prost(bool, tag = "4")]
    pub online: bool,
}

/// Requests the server's view of the cluster.
#[derive(Clone, PartialEq, Message)]
pub struct InfoRequest {}

/// The server's view of the cluster.
#[derive(Clone, PartialEq, Message)]
pub struct InfoResponse {
    /// All known nodes.
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
    /// The responding node.
    #[prost(message, optional, tag = "2")]
    pub this_node: Option<Node>,
}

/// Requests one object, streamed back in chunks.
#[derive(Clone, PartialEq, Message)]
pub struct GetRequest {
    /// Placement hash of the object.
    #[prost(uint64, tag = "1")]
    pub hash: u64,
    /// Object name; (hash, name) together identify it.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Requested chunk size; 0 means the server default. Clamped to at
    /// least [`MIN_CHUNK_SIZE`].
    #[prost(uint32, tag = "3")]
    pub chunk_size: u32,
}

/// First frame of a `Get` response, before any chunks.
#[derive(Clone, PartialEq, Message)]
pub struct GetResponse {
    /// Whether the object exists; chunks follow only if true.
    #[prost(bool, tag = "1")]
    pub found: bool,
    /// Human-readable error, when neither found nor a clean miss.
    #[prost(string, tag = "2")]
    pub error: String,
}

/// One chunk of streamed object content. An empty chunk ends the stream.
#[derive(Clone, PartialEq, Message)]
pub struct Chunk {
    /// Up to `chunk_size` bytes of content.
    #[prost(bytes = "vec", tag = "1")]
    pub chunk: Vec<u8>,
}

/// First frame of a `Put` or `Replicate` stream; carries the object
/// identity and the first chunk. Subsequent frames are [`Chunk`]s.
#[derive(Clone, PartialEq, Message)]
pub struct PutRequest {
    /// Placement hash of the object.
    #[prost(uint64, tag = "1")]
    pub hash: u64,
    /// Object name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// First chunk of content (possibly empty).
    #[prost(bytes = "vec", tag = "3")]
    pub chunk: Vec<u8>,
}

/// Acknowledges a `Put` or `Replicate`.
#[derive(Clone, PartialEq, Message)]
pub struct PutResponse {
    /// Whether the object was stored.
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Error text when not successful.
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Announces a node to the cluster.
#[derive(Clone, PartialEq, Message)]
pub struct RegisterRequest {
    /// The joining node (name + address).
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
    /// Tokens the node asserts from a previous membership; empty to request
    /// fresh ones.
    #[prost(uint64, repeated, tag = "2")]
    pub tokens: Vec<u64>,
}

/// Whether the cluster accepted a registration.
#[derive(Clone, PartialEq, Message)]
pub struct RegisterResponse {
    /// Whether the node was accepted.
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    /// Human-readable reason when rejected.
    #[prost(string, tag = "2")]
    pub msg: String,
    /// The cluster's nodes after the (attempted) registration.
    #[prost(message, repeated, tag = "3")]
    pub nodes: Vec<Node>,
}

/// Requests a diagnostic health view.
#[derive(Clone, PartialEq, Message)]
pub struct ClusterInfoRequest {}

/// Diagnostic health view.
#[derive(Clone, PartialEq, Message)]
pub struct ClusterInfoResponse {
    /// Whether ring verification passes.
    #[prost(bool, tag = "1")]
    pub healthy: bool,
    /// Verification findings, empty when healthy.
    #[prost(string, repeated, tag = "2")]
    pub messages: Vec<String>,
    /// All known nodes.
    #[prost(message, repeated, tag = "3")]
    pub nodes: Vec<Node>,
}

/// Discriminates frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// [`InfoRequest`]
    Info = 1,
    /// [`InfoResponse`]
    InfoResponse = 2,
    /// [`GetRequest`]
    Get = 3,
    /// [`GetResponse`]
    GetResponse = 4,
    /// [`Chunk`]
    Chunk = 5,
    /// [`PutRequest`]
    Put = 6,
    /// [`PutResponse`]
    PutResponse = 7,
    /// [`RegisterRequest`]
    Register = 8,
    /// [`RegisterResponse`]
    RegisterResponse = 9,
    /// [`PutRequest`] framed as node-to-node replication (not re-replicated)
    Replicate = 10,
    /// [`ClusterInfoRequest`]
    ClusterInfo = 11,
    /// [`ClusterInfoResponse`]
    ClusterInfoResponse = 12,
}

impl MsgType {
    /// Decodes a frame type byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Info,
            2 => Self::InfoResponse,
            3 => Self::Get,
            4 => Self::GetResponse,
            5 => Self::Chunk,
            6 => Self::Put,
            7 => Self::PutResponse,
            8 => Self::Register,
            9 => Self::RegisterResponse,
            10 => Self::Replicate,
            11 => Self::ClusterInfo,
            12 => Self::ClusterInfoResponse,
            _ => return None,
        })
    }
}

/// Writes one frame.
pub fn write_frame(w: &mut impl Write, msg_type: MsgType, msg: &impl Message) -> io::Result<()> {
    let body = msg.encode_to_vec();
    let len = body.len() as u32 + 1;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&[msg_type as u8])?;
    w.write_all(&body)?;
    w.flush()
}

/// Reads one frame, returning its type and body bytes.
pub fn read_frame(r: &mut impl Read) -> io::Result<(MsgType, Vec<u8>)> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }
    let mut type_byte = [0u8; 1];
    r.read_exact(&mut type_byte)?;
    let msg_type = MsgType::from_u8(type_byte[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame type {}", type_byte[0]),
        )
    })?;
    let mut body = vec![0u8; len as usize - 1];
    r.read_exact(&mut body)?;
    Ok((msg_type, body))
}

/// Decodes a frame body.
pub fn decode<M: Message + Default>(body: &[u8]) -> io::Result<M> {
    M::decode(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let msg = GetRequest {
            hash: 0xdead_beef,
            name: "pkg/lib/out.bin".into(),
            chunk_size: 4096,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, MsgType::Get, &msg).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (msg_type, body) = read_frame(&mut cursor).unwrap();
        assert_eq!(msg_type, MsgType::Get);
        let back: GetRequest = decode(&body).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(200);
        buf.push(0);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        buf.push(1);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn msg_type_roundtrip() {
        for t in [
            MsgType::Info,
            MsgType::InfoResponse,
            MsgType::Get,
            MsgType::GetResponse,
            MsgType::Chunk,
            MsgType::Put,
            MsgType::PutResponse,
            MsgType::Register,
            MsgType::RegisterResponse,
            MsgType::Replicate,
            MsgType::ClusterInfo,
            MsgType::ClusterInfoResponse,
        ] {
            assert_eq!(MsgType::from_u8(t as u8), Some(t));
        }
        assert_eq!(MsgType::from_u8(0), None);
    }
}

//! Client side of the remote filesystem protocol.
//!
//! A client learns the ring from any reachable node's `Info` and then routes
//! each request straight to the owner of the hash in question. Servers
//! forward misrouted requests anyway, so a stale ring view degrades to an
//! extra hop, not an error.

use super::proto::{
    self, Chunk, ClusterInfoRequest, ClusterInfoResponse, GetRequest, GetResponse, InfoRequest,
    InfoResponse, MsgType, Node, PutRequest, PutResponse, RegisterRequest, RegisterResponse,
};
use parking_lot::RwLock;
use std::io::{self, BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-socket read/write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a remote filesystem call failed. Not-found is not an error; reads
/// report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network or framing failure.
    #[error("remote fs i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer violated the protocol.
    #[error("remote fs protocol error: {0}")]
    Protocol(String),
    /// The cluster refused the request, with its reason.
    #[error("remote fs rejected request: {0}")]
    Rejected(String),
    /// No configured node could be reached.
    #[error("no remote fs node reachable")]
    NoNodes,
}

/// A connection-per-request client over the cluster.
pub struct Client {
    nodes: RwLock<Vec<Node>>,
    chunk_size: u32,
}

impl Client {
    /// Connects to the first reachable seed URL and adopts its ring view.
    pub fn connect(urls: &[String], chunk_size: u32) -> Result<Self, RemoteError> {
        for url in urls {
            match Self::info(url) {
                Ok(info) => {
                    debug!(seed = %url, nodes = info.nodes.len(), "connected to remote fs");
                    return Ok(Self {
                        nodes: RwLock::new(info.nodes),
                        chunk_size,
                    });
                }
                Err(err) => debug!(seed = %url, %err, "remote fs seed unreachable"),
            }
        }
        Err(RemoteError::NoNodes)
    }

    /// Replaces the client's view of the ring.
    pub fn update_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.write() = nodes;
    }

    /// The address of the node owning `hash`, per our ring view; any node
    /// at all if the view has no covering range.
    fn address_for(&self, hash: u64) -> Option<String> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .find(|node| {
                node.ranges
                    .iter()
                    .any(|range| range.start <= hash && hash <= range.end)
            })
            .or_else(|| nodes.first())
            .map(|node| node.address.clone())
    }

    /// Reads an object; `None` on a clean miss.
    pub fn get(&self, hash: u64, name: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let addr = self.address_for(hash).ok_or(RemoteError::NoNodes)?;
        Self::get_from(&addr, hash, name, self.chunk_size)
    }

    /// Stores an object.
    pub fn put(&self, hash: u64, name: &str, data: &[u8]) -> Result<(), RemoteError> {
        let addr = self.address_for(hash).ok_or(RemoteError::NoNodes)?;
        Self::stream_object(&addr, MsgType::Put, hash, name, data, self.chunk_size)
    }

    // ---- single-shot calls, also used node-to-node ----

    /// Fetches a node's cluster view.
    pub fn info(addr: &str) -> Result<InfoResponse, RemoteError> {
        let mut conn = Conn::dial(addr)?;
        conn.send(MsgType::Info, &InfoRequest {})?;
        conn.expect::<InfoResponse>(MsgType::InfoResponse)
    }

    /// Fetches a node's diagnostic health view.
    pub fn cluster_info(addr: &str) -> Result<ClusterInfoResponse, RemoteError> {
        let mut conn = Conn::dial(addr)?;
        conn.send(MsgType::ClusterInfo, &ClusterInfoRequest {})?;
        conn.expect::<ClusterInfoResponse>(MsgType::ClusterInfoResponse)
    }

    /// Registers a node with the cluster member at `addr`.
    pub fn register(
        addr: &str,
        node: Node,
        tokens: &[u64],
    ) -> Result<RegisterResponse, RemoteError> {
        let mut conn = Conn::dial(addr)?;
        conn.send(
            MsgType::Register,
            &RegisterRequest {
                node: Some(node),
                tokens: tokens.to_vec(),
            },
        )?;
        conn.expect::<RegisterResponse>(MsgType::RegisterResponse)
    }

    /// Reads an object from a specific node.
    pub fn get_from(
        addr: &str,
        hash: u64,
        name: &str,
        chunk_size: u32,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = Conn::dial(addr)?;
        conn.send(
            MsgType::Get,
            &GetRequest {
                hash,
                name: name.to_owned(),
                chunk_size,
            },
        )?;
        let header: GetResponse = conn.expect(MsgType::GetResponse)?;
        if !header.found {
            if header.error.is_empty() {
                return Ok(None);
            }
            return Err(RemoteError::Rejected(header.error));
        }
        let mut data = Vec::new();
        loop {
            let chunk: Chunk = conn.expect(MsgType::Chunk)?;
            if chunk.chunk.is_empty() {
                return Ok(Some(data));
            }
            data.extend_from_slice(&chunk.chunk);
        }
    }

    /// Replicates an object to a specific node; the receiver stores it
    /// without replicating further.
    pub fn replicate_to(
        addr: &str,
        hash: u64,
        name: &str,
        data: &[u8],
        chunk_size: u32,
    ) -> Result<(), RemoteError> {
        Self::stream_object(addr, MsgType::Replicate, hash, name, data, chunk_size)
    }

    /// Stores an object on a specific node (which replicates it onward).
    pub fn put_to(
        addr: &str,
        hash: u64,
        name: &str,
        data: &[u8],
        chunk_size: u32,
    ) -> Result<(), RemoteError> {
        Self::stream_object(addr, MsgType::Put, hash, name, data, chunk_size)
    }

    fn stream_object(
        addr: &str,
        msg_type: MsgType,
        hash: u64,
        name: &str,
        data: &[u8],
        chunk_size: u32,
    ) -> Result<(), RemoteError> {
        let chunk_size = chunk_size.max(proto::MIN_CHUNK_SIZE) as usize;
        let mut conn = Conn::dial(addr)?;
        let (first, rest) = data.split_at(data.len().min(chunk_size));
        conn.send(
            msg_type,
            &PutRequest {
                hash,
                name: name.to_owned(),
                chunk: first.to_vec(),
            },
        )?;
        for chunk in rest.chunks(chunk_size) {
            conn.send(
                MsgType::Chunk,
                &Chunk {
                    chunk: chunk.to_vec(),
                },
            )?;
        }
        conn.send(MsgType::Chunk, &Chunk { chunk: Vec::new() })?;
        let ack: PutResponse = conn.expect(MsgType::PutResponse)?;
        if ack.success {
            Ok(())
        } else {
            Err(RemoteError::Rejected(ack.error))
        }
    }
}

/// One framed connection.
struct Conn {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Conn {
    fn dial(addr: &str) -> Result<Self, RemoteError> {
        let mut last_err = None;
        for sockaddr in addr.to_socket_addrs().map_err(RemoteError::Io)? {
            match TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(IO_TIMEOUT))?;
                    stream.set_write_timeout(Some(IO_TIMEOUT))?;
                    let reader = BufReader::new(stream.try_clone()?);
                    return Ok(Self {
                        reader,
                        writer: BufWriter::new(stream),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(RemoteError::Io)
            .unwrap_or(RemoteError::NoNodes))
    }

    fn send(&mut self, msg_type: MsgType, msg: &impl prost::Message) -> Result<(), RemoteError> {
        proto::write_frame(&mut self.writer, msg_type, msg)?;
        Ok(())
    }

    fn expect<M: prost::Message + Default>(&mut self, want: MsgType) -> Result<M, RemoteError> {
        let (got, body) = proto::read_frame(&mut self.reader)?;
        if got != want {
            return Err(RemoteError::Protocol(format!(
                "expected {want:?} frame, got {got:?}"
            )));
        }
        Ok(proto::decode(&body)?)
    }
}

//! Server side of the remote filesystem protocol.
//!
//! One thread per connection; a connection carries a sequence of framed
//! requests. Streaming uploads are assembled here and handed to the
//! cluster, which decides between storing locally, replicating onward, or
//! forwarding to the owner.

use super::cluster::Cluster;
use super::proto::{
    self, Chunk, ClusterInfoRequest, GetRequest, GetResponse, MsgType, PutRequest, PutResponse,
    RegisterRequest,
};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// A running remote FS server.
pub struct Server {
    /// Address the server actually bound (useful with port 0).
    pub local_addr: SocketAddr,
}

impl Server {
    /// Binds `bind_addr` and serves the cluster on background threads.
    pub fn start(cluster: Arc<Cluster>, bind_addr: &str) -> io::Result<Self> {
        Self::serve(cluster, TcpListener::bind(bind_addr)?)
    }

    /// Serves the cluster on an already-bound listener; callers that need
    /// to advertise the bound port before constructing the cluster bind
    /// first and pass the listener here.
    pub fn serve(cluster: Arc<Cluster>, listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        info!(node = cluster.name(), addr = %local_addr, "remote fs node serving");
        thread::Builder::new()
            .name(format!("rfs-accept-{}", cluster.name()))
            .spawn(move || accept_loop(&cluster, &listener))?;
        Ok(Self { local_addr })
    }
}

fn accept_loop(cluster: &Arc<Cluster>, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "remote fs connection");
                let cluster = Arc::clone(cluster);
                let spawned = thread::Builder::new()
                    .name("rfs-conn".to_owned())
                    .spawn(move || {
                        if let Err(err) = handle_connection(&cluster, stream) {
                            // Disconnects are routine; anything else is worth a line.
                            if err.kind() != io::ErrorKind::UnexpectedEof {
                                debug!(%peer, %err, "connection ended with error");
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!(%err, "failed to spawn connection handler");
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                return;
            }
        }
    }
}

fn handle_connection(cluster: &Arc<Cluster>, stream: TcpStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    loop {
        let (msg_type, body) = match proto::read_frame(&mut reader) {
            Ok(frame) => frame,
            // Clean end of connection.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match msg_type {
            MsgType::Info => {
                let _req: proto::InfoRequest = proto::decode(&body)?;
                proto::write_frame(&mut writer, MsgType::InfoResponse, &cluster.info())?;
            }
            MsgType::ClusterInfo => {
                let _req: ClusterInfoRequest = proto::decode(&body)?;
                proto::write_frame(
                    &mut writer,
                    MsgType::ClusterInfoResponse,
                    &cluster.cluster_info(),
                )?;
            }
            MsgType::Register => {
                let req: RegisterRequest = proto::decode(&body)?;
                let resp = cluster.handle_register(&req);
                proto::write_frame(&mut writer, MsgType::RegisterResponse, &resp)?;
            }
            MsgType::Get => {
                let req: GetRequest = proto::decode(&body)?;
                serve_get(cluster, &req, &mut writer)?;
            }
            MsgType::Put | MsgType::Replicate => {
                let first: PutRequest = proto::decode(&body)?;
                let data = read_stream(&mut reader, first.chunk)?;
                let result =
                    cluster.put(first.hash, &first.name, &data, msg_type == MsgType::Replicate);
                let resp = match result {
                    Ok(()) => PutResponse {
                        success: true,
                        error: String::new(),
                    },
                    Err(err) => PutResponse {
                        success: false,
                        error: err.to_string(),
                    },
                };
                proto::write_frame(&mut writer, MsgType::PutResponse, &resp)?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected frame {other:?}"),
                ));
            }
        }
    }
}

/// Reads chunk frames until the empty terminator.
fn read_stream(reader: &mut impl Read, first: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut data = first;
    loop {
        let (msg_type, body) = proto::read_frame(reader)?;
        if msg_type != MsgType::Chunk {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected chunk frame, got {msg_type:?}"),
            ));
        }
        let chunk: Chunk = proto::decode(&body)?;
        if chunk.chunk.is_empty() {
            return Ok(data);
        }
        data.extend_from_slice(&chunk.chunk);
    }
}

/// Streams one object back in chunks of the requested size.
fn serve_get(cluster: &Arc<Cluster>, req: &GetRequest, writer: &mut impl Write) -> io::Result<()> {
    let chunk_size = if req.chunk_size == 0 {
        proto::DEFAULT_CHUNK_SIZE
    } else {
        req.chunk_size.max(proto::MIN_CHUNK_SIZE)
    } as usize;
    match cluster.get(req.hash, &req.name) {
        Ok(Some(data)) => {
            proto::write_frame(
                writer,
                MsgType::GetResponse,
                &GetResponse {
                    found: true,
                    error: String::new(),
                },
            )?;
            for chunk in data.chunks(chunk_size) {
                proto::write_frame(
                    writer,
                    MsgType::Chunk,
                    &Chunk {
                        chunk: chunk.to_vec(),
                    },
                )?;
            }
            proto::write_frame(writer, MsgType::Chunk, &Chunk { chunk: Vec::new() })
        }
        Ok(None) => proto::write_frame(
            writer,
            MsgType::GetResponse,
            &GetResponse {
                found: false,
                error: String::new(),
            },
        ),
        Err(err) => proto::write_frame(
            writer,
            MsgType::GetResponse,
            &GetResponse {
                found: false,
                error: err.to_string(),
            },
        ),
    }
}

//! Cluster membership and object placement for one remote FS node.
//!
//! A node starting up tries each seed URL and adopts the ring advertised by
//! the first cluster member that accepts its registration. With no seeds
//! reachable it falls back to the ring it last persisted, and with nothing
//! persisted either it seeds a fresh ring. Every ring mutation is persisted
//! to a local JSON blob before it is acted on.

use super::client::{Client, RemoteError};
use super::proto::{
    ClusterInfoResponse, InfoResponse, Node, Range, RegisterRequest, RegisterResponse,
};
use super::ring::{Ring, RingError};
use super::store::Store;
use crate::util::fs as ufs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a cluster node is configured.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Unique node name.
    pub name: String,
    /// Advertised host:port.
    pub address: String,
    /// Seed URLs to contact on startup.
    pub seeds: Vec<String>,
    /// Directory object contents are stored in.
    pub store_dir: PathBuf,
    /// Path of the persisted ring blob.
    pub config_file: PathBuf,
    /// Total copies of each object (1 = no replication).
    pub replicas: usize,
    /// Tokens a new node claims.
    pub token_count: usize,
    /// Chunk size for node-to-node streaming.
    pub chunk_size: u32,
}

/// Serialised form of the ring, written after every mutation.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCluster {
    this_node: String,
    nodes: Vec<PersistedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    name: String,
    address: String,
    online: bool,
    ranges: Vec<(u64, u64)>,
}

impl From<&Node> for PersistedNode {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            address: node.address.clone(),
            online: node.online,
            ranges: node.ranges.iter().map(|r| (r.start, r.end)).collect(),
        }
    }
}

impl PersistedNode {
    fn to_proto(&self) -> Node {
        Node {
            name: self.name.clone(),
            address: self.address.clone(),
            online: self.online,
            ranges: self
                .ranges
                .iter()
                .map(|&(start, end)| Range { start, end })
                .collect(),
        }
    }
}

/// One node's view of the cluster, plus its local object store.
pub struct Cluster {
    name: String,
    address: String,
    replicas: usize,
    token_count: usize,
    chunk_size: u32,
    ring: RwLock<Ring>,
    config_file: PathBuf,
    store: Store,
}

impl Cluster {
    /// Brings a node up: join via a seed, else resume the persisted ring,
    /// else seed a new one.
    pub fn start(opts: &ClusterOptions) -> Result<Arc<Self>, RemoteError> {
        let mut ring = Ring::new();
        let persisted = load_persisted(&opts.config_file);
        let my_tokens = persisted
            .as_ref()
            .map(|nodes| tokens_of(nodes, &opts.name))
            .unwrap_or_default();

        let mut joined = false;
        for seed in &opts.seeds {
            let me = Node {
                name: opts.name.clone(),
                address: opts.address.clone(),
                ranges: Vec::new(),
                online: true,
            };
            match Client::register(seed, me, &my_tokens) {
                Ok(resp) if resp.accepted => {
                    ring.update(&resp.nodes)
                        .map_err(|e| RemoteError::Protocol(e.to_string()))?;
                    info!(seed = %seed, nodes = ring.node_count(), "joined remote fs cluster");
                    joined = true;
                    break;
                }
                Ok(resp) => return Err(RemoteError::Rejected(resp.msg)),
                Err(err) => debug!(seed = %seed, %err, "seed unreachable"),
            }
        }
        if !joined {
            if let Some(nodes) = persisted {
                match ring.update(&nodes) {
                    Ok(()) => info!("resumed persisted ring"),
                    Err(err) => warn!(%err, "persisted ring is invalid, reseeding"),
                }
            }
            if !ring.has_node(&opts.name) {
                let tokens = ring.generate_tokens(opts.token_count)?;
                ring.add_node(&opts.name, &opts.address, &tokens)
                    .map_err(|e| RemoteError::Protocol(e.to_string()))?;
                info!(tokens = tokens.len(), "seeded a new ring");
            }
        }

        if let Err(err) = ring.verify() {
            // Ring inconsistency is reported, not fatal; ClusterInfo exposes
            // the same findings.
            warn!(%err, "ring verification failed at startup");
        }

        let cluster = Arc::new(Self {
            name: opts.name.clone(),
            address: opts.address.clone(),
            replicas: opts.replicas.max(1),
            token_count: opts.token_count,
            chunk_size: opts.chunk_size,
            ring: RwLock::new(ring),
            config_file: opts.config_file.clone(),
            store: Store::new(&opts.store_dir),
        });
        cluster.persist();
        Ok(cluster)
    }

    /// This node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ring as exported nodes.
    pub fn export(&self) -> Vec<Node> {
        self.ring.read().export()
    }

    /// This node with its currently owned ranges.
    pub fn this_node(&self) -> Node {
        self.export()
            .into_iter()
            .find(|node| node.name == self.name)
            .unwrap_or(Node {
                name: self.name.clone(),
                address: self.address.clone(),
                ranges: Vec::new(),
                online: true,
            })
    }

    /// Verifies the ring invariants.
    pub fn verify(&self) -> Result<(), RingError> {
        self.ring.read().verify()
    }

    /// Serves `Info`.
    pub fn info(&self) -> InfoResponse {
        InfoResponse {
            nodes: self.export(),
            this_node: Some(self.this_node()),
        }
    }

    /// Serves `ClusterInfo`.
    pub fn cluster_info(&self) -> ClusterInfoResponse {
        let (healthy, messages) = match self.verify() {
            Ok(()) => (true, Vec::new()),
            Err(err) => (false, err.issues().to_vec()),
        };
        ClusterInfoResponse {
            healthy,
            messages,
            nodes: self.export(),
        }
    }

    /// Serves `Register`: admits the node (issuing fresh tokens if it has
    /// none) or rejects it with a reason. The ring is persisted after every
    /// accepted mutation.
    pub fn handle_register(&self, req: &RegisterRequest) -> RegisterResponse {
        let Some(node) = &req.node else {
            return RegisterResponse {
                accepted: false,
                msg: "registration carries no node".to_owned(),
                nodes: self.export(),
            };
        };
        let outcome = {
            let mut ring = self.ring.write();
            let tokens = if req.tokens.is_empty() && !ring.has_node(&node.name) {
                ring.generate_tokens(self.token_count)
                    .map_err(|err| format!("failed to issue tokens: {err}"))
            } else {
                Ok(req.tokens.clone())
            };
            tokens.and_then(|tokens| {
                ring.add_node(&node.name, &node.address, &tokens)
                    .map_err(|err| err.to_string())
            })
        };
        match outcome {
            Ok(()) => {
                self.persist();
                info!(node = %node.name, "accepted cluster registration");
                RegisterResponse {
                    accepted: true,
                    msg: String::new(),
                    nodes: self.export(),
                }
            }
            Err(msg) => RegisterResponse {
                accepted: false,
                msg,
                nodes: self.export(),
            },
        }
    }

    /// Stores an object. Owners store locally and replicate synchronously to
    /// their ring successors; non-owners forward the whole write to the
    /// owner. Replication receipts (`from_replication`) store locally and
    /// never cascade.
    pub fn put(
        &self,
        hash: u64,
        name: &str,
        data: &[u8],
        from_replication: bool,
    ) -> Result<(), RemoteError> {
        if from_replication {
            self.store.put(hash, name, data)?;
            return Ok(());
        }
        let (owner_is_me, owner_addr, successors) = {
            let ring = self.ring.read();
            let owner = ring.owner(hash).map(str::to_owned);
            let owner_is_me = owner.as_deref() == Some(self.name.as_str());
            (
                owner_is_me,
                ring.owner_address(hash).map(str::to_owned),
                ring.successors(hash, self.replicas.saturating_sub(1)),
            )
        };
        if owner_is_me {
            self.store.put(hash, name, data)?;
            for (succ_name, succ_addr) in successors {
                if let Err(err) = Client::replicate_to(&succ_addr, hash, name, data, self.chunk_size)
                {
                    warn!(node = %succ_name, %err, "replication failed");
                    self.ring.write().mark_offline(&succ_name);
                    self.persist();
                }
            }
            Ok(())
        } else {
            let addr = owner_addr.ok_or(RemoteError::NoNodes)?;
            Client::put_to(&addr, hash, name, data, self.chunk_size)
        }
    }

    /// Reads an object. Non-owners forward to the owner; an owner miss is a
    /// miss (replicas are durability, not a read path).
    pub fn get(&self, hash: u64, name: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let (owner_is_me, owner_addr) = {
            let ring = self.ring.read();
            let owner_is_me = ring.owner(hash) == Some(self.name.as_str());
            (owner_is_me, ring.owner_address(hash).map(str::to_owned))
        };
        if owner_is_me {
            Ok(self.store.get(hash, name)?)
        } else {
            let addr = owner_addr.ok_or(RemoteError::NoNodes)?;
            Client::get_from(&addr, hash, name, self.chunk_size)
        }
    }

    /// Direct access to the local store, for replication receipts and tests.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    fn persist(&self) {
        let blob = PersistedCluster {
            this_node: self.name.clone(),
            nodes: self.export().iter().map(PersistedNode::from).collect(),
        };
        match serde_json::to_vec_pretty(&blob) {
            Ok(bytes) => {
                if let Err(err) = ufs::atomic_write(&self.config_file, &bytes) {
                    warn!(%err, "failed to persist cluster config");
                }
            }
            Err(err) => warn!(%err, "failed to serialise cluster config"),
        }
    }
}

fn load_persisted(path: &PathBuf) -> Option<Vec<Node>> {
    let bytes = std::fs::read(path).ok()?;
    let blob: PersistedCluster = serde_json::from_slice(&bytes).ok()?;
    Some(blob.nodes.iter().map(PersistedNode::to_proto).collect())
}

fn tokens_of(nodes: &[Node], name: &str) -> Vec<u64> {
    nodes
        .iter()
        .filter(|node| node.name == name)
        .flat_map(|node| node.ranges.iter().map(|r| r.start))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &std::path::Path, name: &str) -> ClusterOptions {
        ClusterOptions {
            name: name.to_owned(),
            address: format!("127.0.0.1:0/{name}"),
            seeds: Vec::new(),
            store_dir: dir.join(name).join("store"),
            config_file: dir.join(name).join("cluster.json"),
            replicas: 1,
            token_count: 8,
            chunk_size: 32 * 1024,
        }
    }

    #[test]
    fn seeds_fresh_ring_without_seeds_or_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&options(dir.path(), "a")).unwrap();
        cluster.verify().unwrap();
        assert_eq!(cluster.this_node().name, "a");
        assert!(dir.path().join("a/cluster.json").is_file());
    }

    #[test]
    fn restart_resumes_persisted_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), "a");
        let tokens_before = {
            let cluster = Cluster::start(&opts).unwrap();
            let mut tokens: Vec<u64> = cluster
                .this_node()
                .ranges
                .iter()
                .map(|r| r.start)
                .collect();
            tokens.sort_unstable();
            tokens
        };
        let cluster = Cluster::start(&opts).unwrap();
        let mut tokens_after: Vec<u64> = cluster
            .this_node()
            .ranges
            .iter()
            .map(|r| r.start)
            .collect();
        tokens_after.sort_unstable();
        assert_eq!(tokens_before, tokens_after);
    }

    #[test]
    fn local_put_get_roundtrip_when_owner() {
        let dir = tempfile::tempdir().unwrap();
        // A single-node ring owns every hash.
        let cluster = Cluster::start(&options(dir.path(), "a")).unwrap();
        cluster.put(1234, "obj", b"bytes", false).unwrap();
        assert_eq!(cluster.get(1234, "obj").unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(cluster.get(999, "missing").unwrap(), None);
    }

    #[test]
    fn register_issues_tokens_and_rejects_mismatched_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&options(dir.path(), "a")).unwrap();

        let joiner = Node {
            name: "b".into(),
            address: "127.0.0.1:1".into(),
            ranges: Vec::new(),
            online: true,
        };
        let resp = cluster.handle_register(&RegisterRequest {
            node: Some(joiner.clone()),
            tokens: Vec::new(),
        });
        assert!(resp.accepted, "{}", resp.msg);
        assert_eq!(resp.nodes.len(), 2);
        super::super::ring::verify_ranges(&resp.nodes).unwrap();

        // Rejoining with a different token set is refused with a reason.
        let resp = cluster.handle_register(&RegisterRequest {
            node: Some(joiner),
            tokens: vec![1, 2, 3],
        });
        assert!(!resp.accepted);
        assert!(resp.msg.contains("recorded set"));
    }

    #[test]
    fn replication_receipt_stores_locally_even_when_not_owner() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&options(dir.path(), "a")).unwrap();
        // Make another node the owner of everything except our ranges is
        // impossible in one process; replication receipts must bypass
        // ownership entirely, which we can check directly.
        cluster.put(77, "replica", b"copy", true).unwrap();
        assert!(cluster.store().contains(77, "replica"));
    }
}

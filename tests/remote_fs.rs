//! Remote filesystem cluster behaviour over real sockets.

use plz::remote::proto::DEFAULT_CHUNK_SIZE;
use plz::remote::{Client, Cluster, ClusterOptions, Server, verify_ranges};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

fn options(dir: &Path, name: &str, address: String, seeds: Vec<String>) -> ClusterOptions {
    ClusterOptions {
        name: name.to_owned(),
        address,
        seeds,
        store_dir: dir.join(name).join("store"),
        config_file: dir.join(name).join("cluster.json"),
        replicas: 2,
        token_count: 12,
        chunk_size: DEFAULT_CHUNK_SIZE,
    }
}

/// Binds a node: listener first (to learn the port), then cluster, then
/// server. Returns the cluster and its address.
fn start_node(dir: &Path, name: &str, seeds: Vec<String>) -> (Arc<Cluster>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let cluster = Cluster::start(&options(dir, name, address.clone(), seeds)).unwrap();
    Server::serve(Arc::clone(&cluster), listener).unwrap();
    (cluster, address)
}

/// A hash owned by `owner` per that node's exported ranges.
fn hash_owned_by(cluster: &Cluster, owner: &str) -> u64 {
    cluster
        .export()
        .iter()
        .find(|node| node.name == owner)
        .and_then(|node| node.ranges.first())
        .map(|range| range.start)
        .expect("owner has at least one range")
}

#[test]
fn two_node_ring_join_put_get_and_replication() {
    let dir = tempfile::tempdir().unwrap();

    // Node A seeds a fresh ring and claims its tokens.
    let (cluster_a, addr_a) = start_node(dir.path(), "a", Vec::new());
    cluster_a.verify().unwrap();
    assert_eq!(cluster_a.this_node().ranges.len(), 12);

    // Node B joins via A; both now verify a two-node ring.
    let (cluster_b, addr_b) = start_node(dir.path(), "b", vec![addr_a.clone()]);
    cluster_b.verify().unwrap();
    let info_a = Client::info(&addr_a).unwrap();
    let info_b = Client::info(&addr_b).unwrap();
    assert_eq!(info_a.nodes.len(), 2);
    verify_ranges(&info_a.nodes).unwrap();
    verify_ranges(&info_b.nodes).unwrap();
    assert_eq!(info_b.this_node.unwrap().name, "b");

    // Put an object owned by A onto B: it is forwarded to the owner and
    // afterwards retrievable through either node.
    let hash = hash_owned_by(&cluster_a, "a");
    let payload: Vec<u8> = (0..100_000u32).flat_map(u32::to_le_bytes).collect();
    Client::put_to(&addr_b, hash, "x", &payload, DEFAULT_CHUNK_SIZE).unwrap();

    let via_a = Client::get_from(&addr_a, hash, "x", DEFAULT_CHUNK_SIZE).unwrap();
    assert_eq!(via_a.as_deref(), Some(payload.as_slice()));
    let via_b = Client::get_from(&addr_b, hash, "x", DEFAULT_CHUNK_SIZE).unwrap();
    assert_eq!(via_b.as_deref(), Some(payload.as_slice()));

    // Replication factor 2 left a copy on both nodes' local stores.
    assert!(cluster_a.store().contains(hash, "x"));
    assert!(cluster_b.store().contains(hash, "x"));

    // Misses are clean, from both nodes.
    assert_eq!(
        Client::get_from(&addr_a, hash.wrapping_add(1), "nope", 0).unwrap(),
        None
    );
    assert_eq!(
        Client::get_from(&addr_b, hash.wrapping_add(1), "nope", 0).unwrap(),
        None
    );
}

#[test]
fn client_routes_by_ring_view() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster_a, addr_a) = start_node(dir.path(), "a", Vec::new());
    let (_cluster_b, _addr_b) = start_node(dir.path(), "b", vec![addr_a.clone()]);

    let client = Client::connect(&[addr_a.clone()], DEFAULT_CHUNK_SIZE).unwrap();
    // Refresh the view so the client sees both nodes.
    client.update_nodes(Client::info(&addr_a).unwrap().nodes);

    let hash = hash_owned_by(&cluster_a, "b");
    client.put(hash, "routed", b"via-owner").unwrap();
    assert_eq!(
        client.get(hash, "routed").unwrap(),
        Some(b"via-owner".to_vec())
    );
    assert_eq!(client.get(hash, "missing").unwrap(), None);
}

#[test]
fn rejoin_with_wrong_tokens_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_cluster_a, addr_a) = start_node(dir.path(), "a", Vec::new());
    let (_cluster_b, addr_b) = start_node(dir.path(), "b", vec![addr_a.clone()]);

    // B is already a member; asserting a different token set must fail.
    let node = plz::remote::proto::Node {
        name: "b".to_owned(),
        address: addr_b,
        ranges: Vec::new(),
        online: true,
    };
    let resp = Client::register(&addr_a, node, &[1, 2, 3]).unwrap();
    assert!(!resp.accepted);
    assert!(resp.msg.contains("recorded set"), "{}", resp.msg);
}

#[test]
fn cluster_info_reports_health() {
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, addr) = start_node(dir.path(), "solo", Vec::new());
    let info = Client::cluster_info(&addr).unwrap();
    assert!(info.healthy, "findings: {:?}", info.messages);
    assert!(info.messages.is_empty());
    assert_eq!(info.nodes.len(), 1);
}

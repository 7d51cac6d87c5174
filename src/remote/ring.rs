//! The consistent-hash ring.
//!
//! The cluster shards the 64-bit hash space by tokens: each node claims a set
//! of positions, and a token owns the range from itself up to (but not
//! including) the next token. The ring is seeded with a token at position 0,
//! so the derived ranges always cover exactly `[0, 2^64)`, abutting and
//! never overlapping, and `update(export())` reconstructs the identical ring.
//!
//! Token sets are persistent: once issued to a node they are never silently
//! reassigned, and a rejoining node is accepted only if it asserts exactly
//! the token set on record.

use super::proto::{Node, Range};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

/// How many tokens a freshly seeded or joining node claims by default.
pub const DEFAULT_TOKEN_COUNT: usize = 12;

/// Everything wrong with a ring, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingError {
    issues: Vec<String>,
}

impl RingError {
    fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    fn one(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }

    /// The individual findings.
    #[must_use]
    pub fn issues(&self) -> &[String] {
        &self.issues
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring verification failed: {}", self.issues.join("; "))
    }
}

impl std::error::Error for RingError {}

#[derive(Debug, Clone)]
struct NodeMeta {
    address: String,
    online: bool,
}

/// The token ring.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    /// token position → owning node name.
    tokens: BTreeMap<u64, String>,
    nodes: HashMap<String, NodeMeta>,
}

impl Ring {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True before any node joins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of member nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `name` is a member.
    #[must_use]
    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// The tokens `name` owns, sorted.
    pub fn tokens_of(&self, name: &str) -> Vec<u64> {
        self.tokens
            .iter()
            .filter(|(_, owner)| owner.as_str() == name)
            .map(|(token, _)| *token)
            .collect()
    }

    /// Draws `count` fresh tokens spread evenly across the space: one
    /// uniform draw inside each of `count` equal slices. The first ring
    /// member anchors its first token at 0 so coverage starts there.
    pub fn generate_tokens(&self, count: usize) -> std::io::Result<Vec<u64>> {
        assert!(count > 0, "a node must claim at least one token");
        let slice = u64::MAX / count as u64;
        let mut tokens = Vec::with_capacity(count);
        let mut buf = [0u8; 8];
        for i in 0..count as u64 {
            let token = if i == 0 && self.is_empty() {
                0
            } else {
                loop {
                    getrandom::fill(&mut buf)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    let offset = u64::from_le_bytes(buf) % slice;
                    let candidate = i * slice + offset;
                    if !self.tokens.contains_key(&candidate) && !tokens.contains(&candidate) {
                        break candidate;
                    }
                }
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Adds a node claiming `tokens`. Rejoining with the exact recorded
    /// token set is accepted (and marks the node online); any other
    /// collision or mismatch is rejected.
    pub fn add_node(&mut self, name: &str, address: &str, tokens: &[u64]) -> Result<(), RingError> {
        if tokens.is_empty() {
            return Err(RingError::one(format!("node {name} claims no tokens")));
        }
        if self.nodes.contains_key(name) {
            let mut recorded = self.tokens_of(name);
            recorded.sort_unstable();
            let mut asserted = tokens.to_vec();
            asserted.sort_unstable();
            asserted.dedup();
            if recorded != asserted {
                return Err(RingError::one(format!(
                    "node {name} asserts tokens that do not match its recorded set",
                )));
            }
            if let Some(meta) = self.nodes.get_mut(name) {
                meta.online = true;
                meta.address = address.to_owned();
            }
            return Ok(());
        }
        let mut issues = Vec::new();
        for token in tokens {
            if let Some(owner) = self.tokens.get(token) {
                issues.push(format!("token {token} is already owned by node {owner}"));
            }
        }
        if self.is_empty() && !tokens.contains(&0) {
            issues.push("the first node must anchor a token at position 0".to_owned());
        }
        if !issues.is_empty() {
            return Err(RingError::new(issues));
        }
        for token in tokens {
            self.tokens.insert(*token, name.to_owned());
        }
        self.nodes.insert(
            name.to_owned(),
            NodeMeta {
                address: address.to_owned(),
                online: true,
            },
        );
        Ok(())
    }

    /// The node owning `hash`.
    pub fn owner(&self, hash: u64) -> Option<&str> {
        self.tokens
            .range(..=hash)
            .next_back()
            .map(|(_, name)| name.as_str())
    }

    /// The address of the node owning `hash`.
    pub fn owner_address(&self, hash: u64) -> Option<&str> {
        self.owner(hash)
            .and_then(|name| self.nodes.get(name))
            .map(|meta| meta.address.as_str())
    }

    /// Up to `count` distinct nodes following the owner of `hash` around the
    /// ring; replication targets.
    pub fn successors(&self, hash: u64, count: usize) -> Vec<(String, String)> {
        let Some(owner) = self.owner(hash) else {
            return Vec::new();
        };
        let mut out: Vec<(String, String)> = Vec::new();
        let walk = self
            .tokens
            .range(hash.saturating_add(1)..)
            .chain(self.tokens.range(..=hash));
        for (_, name) in walk {
            if out.len() == count {
                break;
            }
            if name == owner || out.iter().any(|(n, _)| n == name) {
                continue;
            }
            if let Some(meta) = self.nodes.get(name) {
                out.push((name.clone(), meta.address.clone()));
            }
        }
        out
    }

    /// Exports the ring as per-node range lists: each token owns from its
    /// position up to the next token; the last token runs to the end of the
    /// space.
    pub fn export(&self) -> Vec<Node> {
        let mut ranges_by_node: HashMap<&str, Vec<Range>> = HashMap::new();
        let tokens: Vec<(&u64, &String)> = self.tokens.iter().collect();
        for (i, (start, name)) in tokens.iter().enumerate() {
            let end = tokens
                .get(i + 1)
                .map_or(u64::MAX, |(next, _)| *next - 1);
            ranges_by_node
                .entry(name.as_str())
                .or_default()
                .push(Range { start: **start, end });
        }
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|(name, meta)| Node {
                name: name.clone(),
                address: meta.address.clone(),
                ranges: ranges_by_node.remove(name.as_str()).unwrap_or_default(),
                online: meta.online,
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Replaces this ring with an exported one. `update(export())` is a
    /// no-op. The import is verified first; a bad ring leaves this one
    /// untouched.
    pub fn update(&mut self, nodes: &[Node]) -> Result<(), RingError> {
        verify_ranges(nodes)?;
        self.tokens.clear();
        self.nodes.clear();
        for node in nodes {
            for range in &node.ranges {
                self.tokens.insert(range.start, node.name.clone());
            }
            self.nodes.insert(
                node.name.clone(),
                NodeMeta {
                    address: node.address.clone(),
                    online: node.online,
                },
            );
        }
        Ok(())
    }

    /// Verifies the ring invariants on the current state.
    pub fn verify(&self) -> Result<(), RingError> {
        if self.is_empty() {
            return Err(RingError::one("ring has no nodes"));
        }
        verify_ranges(&self.export())
    }

    /// Marks a node offline (e.g. after a failed replication).
    pub fn mark_offline(&mut self, name: &str) {
        if let Some(meta) = self.nodes.get_mut(name) {
            meta.online = false;
        }
    }
}

/// Checks that a set of exported nodes partitions `[0, 2^64)` exactly:
/// coverage starts at 0, ends at 2^64−1, adjacent ranges abut, nothing
/// overlaps, and every range is well-formed. All findings are reported.
pub fn verify_ranges(nodes: &[Node]) -> Result<(), RingError> {
    let mut ranges: Vec<(&str, Range)> = nodes
        .iter()
        .flat_map(|node| node.ranges.iter().map(move |r| (node.name.as_str(), *r)))
        .collect();
    let mut issues = Vec::new();
    if ranges.is_empty() {
        return Err(RingError::one("ring has no ranges"));
    }
    for (name, range) in &ranges {
        if range.start > range.end {
            issues.push(format!(
                "node {name} has an inverted range [{}, {}]",
                range.start, range.end
            ));
        }
    }
    ranges.sort_by_key(|(_, r)| r.start);
    if let Some((name, first)) = ranges.first()
        && first.start != 0
    {
        issues.push(format!(
            "coverage starts at {} (node {name}), not 0",
            first.start
        ));
    }
    if let Some((name, last)) = ranges.last()
        && last.end != u64::MAX
    {
        issues.push(format!(
            "coverage ends at {} (node {name}), not 2^64-1",
            last.end
        ));
    }
    for pair in ranges.windows(2) {
        let (prev_name, prev) = pair[0];
        let (next_name, next) = pair[1];
        if next.start <= prev.end {
            issues.push(format!(
                "ranges overlap: {prev_name} [{}, {}] and {next_name} [{}, {}]",
                prev.start, prev.end, next.start, next.end
            ));
        } else if prev.end + 1 != next.start {
            issues.push(format!(
                "gap between {prev_name} ending {} and {next_name} starting {}",
                prev.end, next.start
            ));
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(RingError::new(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seeded_ring() -> Ring {
        let mut ring = Ring::new();
        let tokens = ring.generate_tokens(DEFAULT_TOKEN_COUNT).unwrap();
        ring.add_node("a", "127.0.0.1:7777", &tokens).unwrap();
        ring
    }

    #[test]
    fn seed_node_covers_whole_space() {
        let ring = seeded_ring();
        ring.verify().unwrap();
        assert_eq!(ring.node_count(), 1);
        assert_eq!(ring.owner(0), Some("a"));
        assert_eq!(ring.owner(u64::MAX), Some("a"));
        assert_eq!(ring.tokens_of("a").len(), DEFAULT_TOKEN_COUNT);
    }

    #[test]
    fn second_node_shrinks_incumbent_ranges() {
        let mut ring = seeded_ring();
        let tokens = ring.generate_tokens(DEFAULT_TOKEN_COUNT).unwrap();
        ring.add_node("b", "127.0.0.1:7778", &tokens).unwrap();
        ring.verify().unwrap();
        assert_eq!(ring.node_count(), 2);
        // Both nodes own something.
        assert!(!ring.tokens_of("a").is_empty());
        assert!(!ring.tokens_of("b").is_empty());
        // Every hash has exactly one owner.
        for hash in [0u64, 1, u64::MAX / 2, u64::MAX] {
            assert!(ring.owner(hash).is_some());
        }
    }

    #[test]
    fn empty_ring_rejects_unanchored_seed() {
        let mut ring = Ring::new();
        let err = ring.add_node("a", "addr", &[5, 10]).unwrap_err();
        assert!(err.to_string().contains("position 0"));
    }

    #[test]
    fn token_collision_is_rejected() {
        let mut ring = Ring::new();
        ring.add_node("a", "addr-a", &[0, 100]).unwrap();
        let err = ring.add_node("b", "addr-b", &[100, 200]).unwrap_err();
        assert!(err.to_string().contains("already owned"));
        assert_eq!(ring.node_count(), 1);
    }

    #[test]
    fn rejoin_requires_exact_token_set() {
        let mut ring = Ring::new();
        ring.add_node("a", "addr", &[0, 100, 200]).unwrap();
        // Exact set (any order) is accepted.
        ring.add_node("a", "addr2", &[200, 0, 100]).unwrap();
        // Anything else is rejected.
        assert!(ring.add_node("a", "addr", &[0, 100]).is_err());
        assert!(ring.add_node("a", "addr", &[0, 100, 200, 300]).is_err());
        // The recorded set is unchanged.
        assert_eq!(ring.tokens_of("a"), vec![0, 100, 200]);
    }

    #[test]
    fn export_update_is_noop() {
        let mut ring = seeded_ring();
        let tokens = ring.generate_tokens(8).unwrap();
        ring.add_node("b", "127.0.0.1:7778", &tokens).unwrap();

        let exported = ring.export();
        let mut other = Ring::new();
        other.update(&exported).unwrap();
        assert_eq!(other.export(), exported);
        // Ownership agrees everywhere we look.
        for hash in [0u64, 42, u64::MAX / 3, u64::MAX] {
            assert_eq!(other.owner(hash), ring.owner(hash));
        }
    }

    #[test]
    fn verify_reports_every_defect_at_once() {
        let nodes = vec![Node {
            name: "a".into(),
            address: "addr".into(),
            ranges: vec![Range { start: 10, end: 5000 }, Range { start: 6000, end: 9000 }],
            online: true,
        }];
        let err = verify_ranges(&nodes).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("starts at 10"));
        assert!(text.contains("gap between"));
        assert!(text.contains("not 2^64-1"));
        assert_eq!(err.issues().len(), 3);
    }

    #[test]
    fn verify_rejects_overlaps() {
        let nodes = vec![
            Node {
                name: "a".into(),
                address: String::new(),
                ranges: vec![Range { start: 0, end: 100 }],
                online: true,
            },
            Node {
                name: "b".into(),
                address: String::new(),
                ranges: vec![Range {
                    start: 50,
                    end: u64::MAX,
                }],
                online: true,
            },
        ];
        let err = verify_ranges(&nodes).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn successors_walk_the_ring_to_distinct_nodes() {
        let mut ring = Ring::new();
        ring.add_node("a", "addr-a", &[0, 300]).unwrap();
        ring.add_node("b", "addr-b", &[100, 400]).unwrap();
        ring.add_node("c", "addr-c", &[200, 500]).unwrap();

        // hash 0 is owned by a; the next distinct nodes around the ring are
        // b (token 100) then c (token 200).
        assert_eq!(ring.owner(0), Some("a"));
        let succ = ring.successors(0, 2);
        assert_eq!(
            succ,
            vec![
                ("b".to_owned(), "addr-b".to_owned()),
                ("c".to_owned(), "addr-c".to_owned())
            ]
        );
        // Asking for more than exist caps out at the other members.
        assert_eq!(ring.successors(0, 10).len(), 2);
        // Wrap-around: hash owned by the last token still finds successors.
        assert_eq!(ring.owner(500), Some("c"));
        let succ = ring.successors(500, 1);
        assert_eq!(succ[0].0, "a");
    }

    proptest! {
        #[test]
        fn any_token_layout_partitions_the_space(
            tokens in proptest::collection::btree_set(1u64.., 1..40)
        ) {
            let mut ring = Ring::new();
            let mut all: Vec<u64> = vec![0];
            all.extend(tokens.iter().copied());
            // Split tokens across three nodes round-robin.
            let mut per_node: [Vec<u64>; 3] = [vec![], vec![], vec![]];
            for (i, token) in all.iter().enumerate() {
                per_node[i % 3].push(*token);
            }
            for (i, node_tokens) in per_node.iter().enumerate() {
                if !node_tokens.is_empty() {
                    ring.add_node(&format!("n{i}"), "addr", node_tokens).unwrap();
                }
            }
            ring.verify().unwrap();
            // Ownership is defined for arbitrary probes.
            for probe in [0u64, 17, u64::MAX / 2, u64::MAX] {
                prop_assert!(ring.owner(probe).is_some());
            }
            let mut other = Ring::new();
            other.update(&ring.export()).unwrap();
            prop_assert_eq!(other.export(), ring.export());
        }
    }
}

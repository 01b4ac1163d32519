//! Tuple locator: maps a row's distribution-key value to the subset of
//! backend nodes that must receive it.
//!
//! A [`Locator`] is a short-lived object built per execution from a
//! relation's [`RelationLocInfo`]. Construction validates the
//! policy/type/intent combination and picks one dispatch strategy; after
//! that, [`Locator::locate`] is pure node-map math; it performs no I/O and
//! never suspends.

use std::fmt;

use rand::seq::IndexedRandom;
use smallvec::SmallVec;
use trellis_errors::{internal_err, FabricError, FabricResult};

pub mod hash;
pub mod modulo;

pub use hash::{hash_for_type, unsigned_for_type, Datum, KeyType};
pub use modulo::compute_modulo;

/// Node lists are almost always small; keep them inline.
pub type NodeList<R> = SmallVec<[R; 8]>;

/// Anything that can stand for a backend node in a node map. Catalog code
/// uses oids, the executor uses small integers; the locator is monomorphized
/// over whichever the caller holds.
pub trait NodeRef: Copy + Eq + fmt::Debug {}
impl<T: Copy + Eq + fmt::Debug> NodeRef for T {}

/// How a relation's rows are spread over its node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionPolicy {
    /// Every node holds every row.
    Replicated,
    /// Rows are dealt to nodes in turn.
    RoundRobin,
    /// Rows are placed by a hash of the distribution key.
    Hash,
    /// Rows are placed by the raw unsigned value of the distribution key.
    Modulo,
    /// The relation lives on exactly one node.
    Single,
}

/// What the executor is about to do with the located nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    Insert,
    Update,
    Read,
    ReadForUpdate,
}

impl AccessIntent {
    fn is_write(self) -> bool {
        matches!(self, AccessIntent::Insert | AccessIntent::Update)
    }
}

/// The distribution descriptor of one relation. The order of `nodes` is part
/// of the placement function: `hash mod N` picks by index.
#[derive(Debug, Clone)]
pub struct RelationLocInfo<R: NodeRef> {
    pub policy: DistributionPolicy,
    /// Name of the distribution-key column; required for hash and modulo.
    pub partition_attr: Option<String>,
    pub nodes: NodeList<R>,
    /// For replicated relations: the node to write first.
    pub primary_node: Option<R>,
    round_robin: usize,
}

impl<R: NodeRef> RelationLocInfo<R> {
    pub fn new(policy: DistributionPolicy, nodes: impl IntoIterator<Item = R>) -> Self {
        RelationLocInfo {
            policy,
            partition_attr: None,
            nodes: nodes.into_iter().collect(),
            primary_node: None,
            round_robin: 0,
        }
    }

    pub fn with_partition_attr(mut self, attr: impl Into<String>) -> Self {
        self.partition_attr = Some(attr.into());
        self
    }

    pub fn with_primary(mut self, primary: R) -> Self {
        self.primary_node = Some(primary);
        self
    }
}

/// The dispatch strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Full node map, with the primary split out for replicated writes.
    Static,
    /// One node, advancing the relation's persistent cursor.
    RoundRobin,
    /// Null → first node; otherwise hash mod N.
    HashInsert,
    /// Null → all nodes; otherwise hash mod N.
    HashSelect,
    /// Null → first node; otherwise raw value mod N.
    ModuloInsert,
    /// Null → all nodes; otherwise raw value mod N.
    ModuloSelect,
}

/// Where a located row must go. `primary` is non-empty only for replicated
/// writes on relations with a designated primary: those destinations must be
/// written before `nodes`.
#[derive(Debug, PartialEq, Eq)]
pub struct Placement<'a, R: NodeRef> {
    pub primary: &'a [R],
    pub nodes: &'a [R],
}

impl<R: NodeRef> Placement<'_, R> {
    pub fn all(&self) -> impl Iterator<Item = R> + '_ {
        self.primary.iter().chain(self.nodes.iter()).copied()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-execution locator. Borrows the relation descriptor so round-robin
/// state persists across executions; the result buffers are owned and
/// reused between calls.
#[derive(Debug)]
pub struct Locator<'rel, R: NodeRef> {
    strategy: Strategy,
    key_type: Option<KeyType>,
    intent: AccessIntent,
    rel: &'rel mut RelationLocInfo<R>,
    preferred: NodeList<R>,
    results: NodeList<R>,
    primary_results: NodeList<R>,
}

/// Build a locator for one execution.
///
/// `key_type` is required for hash and modulo policies. `preferred` lists
/// nodes the caller would rather read from (replicated reads only); entries
/// not present in the relation's node set are ignored.
pub fn create_locator<'rel, R: NodeRef>(
    rel: &'rel mut RelationLocInfo<R>,
    intent: AccessIntent,
    key_type: Option<KeyType>,
    preferred: &[R],
) -> FabricResult<Locator<'rel, R>> {
    if rel.nodes.is_empty() {
        return Err(FabricError::Config(
            "relation has an empty node set".into(),
        ));
    }
    let strategy = match (rel.policy, intent) {
        (DistributionPolicy::Single, _) => Strategy::Static,
        (
            DistributionPolicy::Replicated,
            AccessIntent::Insert | AccessIntent::Update | AccessIntent::ReadForUpdate,
        ) => Strategy::Static,
        (DistributionPolicy::Replicated, AccessIntent::Read) => Strategy::RoundRobin,
        (DistributionPolicy::RoundRobin, AccessIntent::Insert) => Strategy::RoundRobin,
        // a round-robin row can be anywhere, so everything but insert scans all
        (DistributionPolicy::RoundRobin, _) => Strategy::Static,
        (DistributionPolicy::Hash, AccessIntent::Insert) => Strategy::HashInsert,
        (DistributionPolicy::Hash, _) => Strategy::HashSelect,
        (DistributionPolicy::Modulo, AccessIntent::Insert) => Strategy::ModuloInsert,
        (DistributionPolicy::Modulo, _) => Strategy::ModuloSelect,
    };

    match strategy {
        Strategy::HashInsert | Strategy::HashSelect => {
            if key_type.is_none() {
                return Err(FabricError::Config(format!(
                    "hash distribution requires a key type (relation attr {:?})",
                    rel.partition_attr
                )));
            }
        }
        Strategy::ModuloInsert | Strategy::ModuloSelect => match key_type {
            None => {
                return Err(FabricError::Config(format!(
                    "modulo distribution requires a key type (relation attr {:?})",
                    rel.partition_attr
                )))
            }
            Some(ty) if !ty.supports_modulo() => {
                return Err(FabricError::Config(format!(
                    "type {ty:?} cannot be distributed by modulo"
                )))
            }
            Some(_) => {}
        },
        _ => {}
    }

    let node_count = rel.nodes.len();
    let preferred = preferred
        .iter()
        .copied()
        .filter(|p| rel.nodes.contains(p))
        .collect();
    Ok(Locator {
        strategy,
        key_type,
        intent,
        rel,
        preferred,
        results: NodeList::with_capacity(node_count),
        primary_results: NodeList::with_capacity(1),
    })
}

impl<R: NodeRef> Locator<'_, R> {
    /// Destinations for one row. `value` is the evaluated distribution-key
    /// datum, or `None` for a null key (and for policies that ignore the
    /// key entirely).
    pub fn locate(&mut self, value: Option<&Datum>) -> FabricResult<Placement<'_, R>> {
        self.results.clear();
        self.primary_results.clear();
        match self.strategy {
            Strategy::Static => self.locate_static(),
            Strategy::RoundRobin => self.locate_round_robin(),
            Strategy::HashInsert => self.locate_keyed(value, false, true)?,
            Strategy::HashSelect => self.locate_keyed(value, true, true)?,
            Strategy::ModuloInsert => self.locate_keyed(value, false, false)?,
            Strategy::ModuloSelect => self.locate_keyed(value, true, false)?,
        }
        Ok(Placement {
            primary: &self.primary_results,
            nodes: &self.results,
        })
    }

    /// The full node map, copied into the locator's own buffer. For
    /// replicated writes with a designated primary and more than one node,
    /// the primary goes to its own list so it is written first.
    fn locate_static(&mut self) {
        let split_primary = self.intent.is_write()
            && self.rel.policy == DistributionPolicy::Replicated
            && self.rel.nodes.len() > 1;
        match self.rel.primary_node {
            Some(primary) if split_primary && self.rel.nodes.contains(&primary) => {
                self.primary_results.push(primary);
                self.results
                    .extend(self.rel.nodes.iter().copied().filter(|n| *n != primary));
            }
            _ => self.results.extend(self.rel.nodes.iter().copied()),
        }
    }

    /// One node for load balancing: for replicated reads, the first
    /// preferred node present in the map; else the relation's round-robin
    /// cursor.
    fn locate_round_robin(&mut self) {
        if self.rel.policy == DistributionPolicy::Replicated {
            if let Some(&p) = self.preferred.first() {
                self.results.push(p);
                return;
            }
        }
        let idx = self.rel.round_robin % self.rel.nodes.len();
        self.rel.round_robin = (self.rel.round_robin + 1) % self.rel.nodes.len();
        self.results.push(self.rel.nodes[idx]);
    }

    fn locate_keyed(
        &mut self,
        value: Option<&Datum>,
        null_scans_all: bool,
        hashed: bool,
    ) -> FabricResult<()> {
        // checked at construction
        let ty = self
            .key_type
            .ok_or_else(|| internal_err!("keyed locator without a key type"))?;
        match value {
            None if null_scans_all => self.results.extend(self.rel.nodes.iter().copied()),
            None => self.results.push(self.rel.nodes[0]),
            Some(v) => {
                let n = if hashed {
                    hash_for_type(ty, v)?
                } else {
                    unsigned_for_type(ty, v)?
                };
                let idx = compute_modulo(n, self.rel.nodes.len() as u32) as usize;
                self.results.push(self.rel.nodes[idx]);
            }
        }
        Ok(())
    }
}

/// Pick one data node to run a node-agnostic query on: uniformly at random
/// from the preferred nodes present in `set`, else uniformly from `set`.
///
/// Deliberately random rather than a stateful cursor: with small sets a
/// persistent index skews load toward whichever node follows the most
/// common caller's position.
pub fn get_any_data_node<R: NodeRef>(set: &[R], preferred: &[R]) -> Option<R> {
    let mut rng = rand::rng();
    let eligible: NodeList<R> = set
        .iter()
        .copied()
        .filter(|n| preferred.contains(n))
        .collect();
    if eligible.is_empty() {
        set.choose(&mut rng).copied()
    } else {
        eligible.choose(&mut rng).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn rel(policy: DistributionPolicy, nodes: &[u32]) -> RelationLocInfo<u32> {
        RelationLocInfo::new(policy, nodes.iter().copied())
    }

    #[test]
    fn replicated_write_splits_primary() {
        let mut info = rel(DistributionPolicy::Replicated, &[1, 2, 3]).with_primary(2);
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap();
        let placement = locator.locate(None).unwrap();
        assert_eq!(placement.primary, &[2]);
        assert_eq!(placement.nodes, &[1, 3]);
        assert_eq!(placement.all().collect::<Vec<_>>(), vec![2, 1, 3]);
    }

    #[test]
    fn replicated_write_without_primary_returns_all() {
        let mut info = rel(DistributionPolicy::Replicated, &[1, 2, 3]);
        let mut locator =
            create_locator(&mut info, AccessIntent::Update, None, &[]).unwrap();
        let placement = locator.locate(None).unwrap();
        assert_eq!(placement.primary, &[] as &[u32]);
        assert_eq!(placement.nodes, &[1, 2, 3]);
    }

    #[test]
    fn single_node_primary_is_not_split() {
        let mut info = rel(DistributionPolicy::Replicated, &[5]).with_primary(5);
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap();
        let placement = locator.locate(None).unwrap();
        assert_eq!(placement.primary, &[] as &[u32]);
        assert_eq!(placement.nodes, &[5]);
    }

    #[test]
    fn replicated_read_prefers_preferred_nodes() {
        let mut info = rel(DistributionPolicy::Replicated, &[1, 2, 3]);
        let mut locator =
            create_locator(&mut info, AccessIntent::Read, None, &[9, 3]).unwrap();
        // node 9 is not in the map and is ignored
        for _ in 0..5 {
            let placement = locator.locate(None).unwrap();
            assert_eq!(placement.nodes, &[3]);
        }
    }

    #[test]
    fn replicated_read_round_robins_without_preference() {
        let mut info = rel(DistributionPolicy::Replicated, &[1, 2, 3]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let mut locator =
                create_locator(&mut info, AccessIntent::Read, None, &[]).unwrap();
            seen.push(locator.locate(None).unwrap().nodes[0]);
        }
        // cursor persists in the relation across locator lifetimes
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn round_robin_insert_is_fair() {
        let nodes = [10u32, 20, 30, 40];
        let mut info = rel(DistributionPolicy::RoundRobin, &nodes);
        let mut counts: HashMap<u32, usize> = HashMap::new();
        let k = 7;
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap();
        for _ in 0..k * nodes.len() {
            let placement = locator.locate(None).unwrap();
            assert_eq!(placement.len(), 1);
            *counts.entry(placement.nodes[0]).or_default() += 1;
        }
        for node in nodes {
            assert_eq!(counts[&node], k);
        }
    }

    #[test]
    fn round_robin_read_scans_all() {
        let mut info = rel(DistributionPolicy::RoundRobin, &[1, 2]);
        let mut locator = create_locator(&mut info, AccessIntent::Read, None, &[]).unwrap();
        assert_eq!(locator.locate(None).unwrap().nodes, &[1, 2]);
    }

    #[test]
    fn hash_insert_routes_by_backend_hash() {
        let mut info = rel(DistributionPolicy::Hash, &[100, 101, 102, 103])
            .with_partition_attr("c");
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Int4), &[]).unwrap();
        // hash_int4(42) = 0x59FCFEC8; 0x59FCFEC8 mod 4 = 0
        let placement = locator.locate(Some(&Datum::Int4(42))).unwrap();
        assert_eq!(placement.nodes, &[100]);
        // same value, same node
        let placement = locator.locate(Some(&Datum::Int4(42))).unwrap();
        assert_eq!(placement.nodes, &[100]);
    }

    #[test]
    fn hash_insert_null_goes_to_first_node() {
        let mut info = rel(DistributionPolicy::Hash, &[100, 101, 102, 103]);
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Int4), &[]).unwrap();
        assert_eq!(locator.locate(None).unwrap().nodes, &[100]);
    }

    #[test]
    fn hash_select_null_scans_all() {
        let mut info = rel(DistributionPolicy::Hash, &[100, 101, 102, 103]);
        let mut locator =
            create_locator(&mut info, AccessIntent::Read, Some(KeyType::Int4), &[]).unwrap();
        assert_eq!(locator.locate(None).unwrap().nodes, &[100, 101, 102, 103]);
    }

    #[test]
    fn modulo_uses_raw_value() {
        let mut info = rel(DistributionPolicy::Modulo, &[7, 8, 9, 10]);
        let mut locator =
            create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Int4), &[]).unwrap();
        // 10 mod 4 = 2
        assert_eq!(locator.locate(Some(&Datum::Int4(10))).unwrap().nodes, &[9]);
        // -1 is interpreted unsigned: 0xFFFFFFFF mod 4 = 3
        assert_eq!(locator.locate(Some(&Datum::Int4(-1))).unwrap().nodes, &[10]);
    }

    #[test]
    fn modulo_rejects_unsupported_types() {
        let mut info = rel(DistributionPolicy::Modulo, &[1, 2]);
        let err =
            create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Text), &[]).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
        let err = create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[test]
    fn hash_requires_key_type() {
        let mut info = rel(DistributionPolicy::Hash, &[1, 2]);
        let err = create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[test]
    fn empty_node_set_is_a_config_error() {
        let mut info = rel(DistributionPolicy::Hash, &[]);
        let err =
            create_locator(&mut info, AccessIntent::Read, Some(KeyType::Int4), &[]).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[test]
    fn get_any_data_node_respects_preference() {
        let set = [1u32, 2, 3, 4];
        for _ in 0..32 {
            let picked = get_any_data_node(&set, &[3]).unwrap();
            assert_eq!(picked, 3);
        }
        // unknown preferred nodes are ignored entirely
        for _ in 0..32 {
            let picked = get_any_data_node(&set, &[99]).unwrap();
            assert!(set.contains(&picked));
        }
        assert_eq!(get_any_data_node::<u32>(&[], &[]), None);
    }

    #[test]
    fn get_any_data_node_reaches_every_member() {
        let set = [1u32, 2, 3];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(get_any_data_node(&set, &[]).unwrap());
        }
        assert_eq!(seen.len(), set.len());
    }

    proptest! {
        #[test]
        fn keyed_location_is_deterministic(v: i64, n in 1usize..16) {
            let nodes: Vec<u32> = (0..n as u32).collect();
            let mut info = rel(DistributionPolicy::Hash, &nodes);
            let mut locator =
                create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Int8), &[]).unwrap();
            let datum = Datum::Int8(v);
            let first = locator.locate(Some(&datum)).unwrap().nodes.to_vec();
            let second = locator.locate(Some(&datum)).unwrap().nodes.to_vec();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), 1);
            prop_assert!(nodes.contains(&first[0]));
        }

        #[test]
        fn round_robin_covers_each_node_exactly_k_times(
            n in 1usize..8,
            k in 1usize..8,
        ) {
            let nodes: Vec<u32> = (0..n as u32).collect();
            let mut info = rel(DistributionPolicy::RoundRobin, &nodes);
            let mut locator =
                create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap();
            let mut counts = vec![0usize; n];
            for _ in 0..n * k {
                let node = locator.locate(None).unwrap().nodes[0];
                counts[node as usize] += 1;
            }
            prop_assert!(counts.iter().all(|&c| c == k));
        }
    }
}

//! The narrow graph surface the channel store writes through, plus the two
//! query caches layered over it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, BlockHash, OutPoint};

use crate::codec::{outpoint_key, Reader, Writer};
use crate::error::Error;
use crate::kvdb::{Bucket, Store, Tx};

/// Top-level bucket holding graph node records and the node indexes.
pub(crate) const NODE_BUCKET: &[u8] = b"node-bucket";
pub(crate) const ALIAS_INDEX_BUCKET: &[u8] = b"alias-index-bucket";
pub(crate) const NODE_UPDATE_INDEX_BUCKET: &[u8] = b"node-update-index-bucket";
/// Top-level bucket holding edge policies and the edge indexes.
pub(crate) const EDGE_BUCKET: &[u8] = b"edge-bucket";
pub(crate) const EDGE_INDEX_BUCKET: &[u8] = b"edge-index-bucket";
pub(crate) const EDGE_UPDATE_INDEX_BUCKET: &[u8] = b"edge-update-index-bucket";
pub(crate) const CHANNEL_POINT_BUCKET: &[u8] = b"chan-point-bucket";
pub(crate) const ZOMBIE_BUCKET: &[u8] = b"zombie-bucket";
/// Top-level bucket for graph maintenance state.
pub(crate) const GRAPH_META_BUCKET: &[u8] = b"graph-meta-bucket";
pub(crate) const PRUNE_LOG_BUCKET: &[u8] = b"prune-log-bucket";

/// Key under `node-bucket` pointing at the self node's identity key.
const SOURCE_KEY: &[u8] = b"source";

/// Policy direction bit: clear when node1 authored the update, set when
/// node2 did.
pub const CHAN_UPDATE_DIRECTION: u8 = 1;

/// Sentinel payload standing in for a policy the network has not announced.
pub(crate) const UNKNOWN_POLICY: &[u8] = &[0xff];

/// A node announcement as the graph stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct LightningNode {
    pub pub_key: PublicKey,
    /// Unix timestamp of the latest update for this node.
    pub last_update: u64,
    pub alias: String,
    pub addresses: Vec<SocketAddr>,
}

/// The symmetric half of a channel edge, keyed by short channel id. The
/// participant with the smaller serialized key is always `node_key1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEdgeInfo {
    pub channel_id: u64,
    pub chain_hash: BlockHash,
    pub node_key1: PublicKey,
    pub node_key2: PublicKey,
    pub capacity: Amount,
    pub channel_point: OutPoint,
}

/// One direction of a channel edge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEdgePolicy {
    pub channel_id: u64,
    /// Unix timestamp of this update, from the injected clock.
    pub last_update: u64,
    /// Flag bits, including the direction bit.
    pub flags: u8,
    pub timelock_delta: u16,
    pub htlc_min_msat: u64,
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
}

/// An edge and both of its directed policies, as cached.
#[derive(Debug, Clone)]
pub struct ChannelEdge {
    pub info: ChannelEdgeInfo,
    pub policy1: Option<ChannelEdgePolicy>,
    pub policy2: Option<ChannelEdgePolicy>,
}

pub(crate) fn serialize_lightning_node(node: &LightningNode) -> Result<Vec<u8>, Error> {
    let mut w = Writer::new();
    w.write_pubkey(&node.pub_key);
    w.write_u64(node.last_update);
    w.write_var_bytes(node.alias.as_bytes())?;
    w.write_addrs(&node.addresses)?;
    Ok(w.into_vec())
}

pub(crate) fn deserialize_lightning_node(bytes: &[u8]) -> Result<LightningNode, Error> {
    let mut r = Reader::new(bytes);
    let pub_key = r.read_pubkey()?;
    let last_update = r.read_u64()?;
    let alias_bytes = r.read_var_bytes()?;
    let alias = String::from_utf8(alias_bytes)
        .map_err(|_| Error::codec("node alias is not valid utf-8"))?;
    let addresses = r.read_addrs()?;
    Ok(LightningNode { pub_key, last_update, alias, addresses })
}

pub(crate) fn serialize_edge_info(edge: &ChannelEdgeInfo) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_block_hash(&edge.chain_hash);
    w.write_pubkey(&edge.node_key1);
    w.write_pubkey(&edge.node_key2);
    w.write_outpoint(&edge.channel_point);
    w.write_u64(edge.capacity.to_sat());
    w.write_u64(edge.channel_id);
    w.into_vec()
}

pub(crate) fn deserialize_edge_info(bytes: &[u8]) -> Result<ChannelEdgeInfo, Error> {
    let mut r = Reader::new(bytes);
    Ok(ChannelEdgeInfo {
        chain_hash: r.read_block_hash()?,
        node_key1: r.read_pubkey()?,
        node_key2: r.read_pubkey()?,
        channel_point: r.read_outpoint()?,
        capacity: Amount::from_sat(r.read_u64()?),
        channel_id: r.read_u64()?,
    })
}

pub(crate) fn serialize_edge_policy(policy: &ChannelEdgePolicy) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u64(policy.channel_id);
    w.write_u64(policy.last_update);
    w.write_u8(policy.flags);
    w.write_u16(policy.timelock_delta);
    w.write_u64(policy.htlc_min_msat);
    w.write_u64(policy.fee_base_msat);
    w.write_u64(policy.fee_proportional_millionths);
    w.into_vec()
}

/// Decode an edge policy. The unknown-policy sentinel decodes to `None`.
pub(crate) fn deserialize_edge_policy(bytes: &[u8]) -> Result<Option<ChannelEdgePolicy>, Error> {
    if bytes == UNKNOWN_POLICY {
        return Ok(None);
    }
    let mut r = Reader::new(bytes);
    Ok(Some(ChannelEdgePolicy {
        channel_id: r.read_u64()?,
        last_update: r.read_u64()?,
        flags: r.read_u8()?,
        timelock_delta: r.read_u16()?,
        htlc_min_msat: r.read_u64()?,
        fee_base_msat: r.read_u64()?,
        fee_proportional_millionths: r.read_u64()?,
    }))
}

/// The edge-bucket key of one policy direction.
pub(crate) fn edge_policy_key(channel_id: u64, direction: u8) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[..8].copy_from_slice(&channel_id.to_be_bytes());
    key[8] = direction & CHAN_UPDATE_DIRECTION;
    key
}

pub(crate) fn update_index_key(last_update: u64, target: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + target.len());
    key.extend_from_slice(&last_update.to_be_bytes());
    key.extend_from_slice(target);
    key
}

/// Fetch a graph node record by serialized identity key.
pub(crate) fn fetch_lightning_node(
    nodes: &Bucket,
    pub_key: &[u8],
) -> Result<LightningNode, Error> {
    let bytes = nodes.get(pub_key)?.ok_or(Error::GraphNodeNotFound)?;
    deserialize_lightning_node(&bytes)
}

/// Write a graph node record and keep the node update index in sync.
pub(crate) fn put_lightning_node(nodes: &Bucket, node: &LightningNode) -> Result<(), Error> {
    let update_index = nodes
        .bucket(NODE_UPDATE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("node update index bucket not created"))?;
    let pub_key = node.pub_key.serialize();
    if let Some(existing) = nodes.get(&pub_key)? {
        let old = deserialize_lightning_node(&existing)?;
        update_index.delete(&update_index_key(old.last_update, &pub_key))?;
    }
    update_index.put(&update_index_key(node.last_update, &pub_key), &[])?;
    nodes.put(&pub_key, &serialize_lightning_node(node)?)?;
    Ok(())
}

/// The self node of the graph.
pub(crate) fn source_node(nodes: &Bucket) -> Result<LightningNode, Error> {
    let pub_key = nodes.get(SOURCE_KEY)?.ok_or(Error::SourceNodeNotSet)?;
    fetch_lightning_node(nodes, &pub_key)
}

pub(crate) fn set_source_node(tx: &Tx, node: &LightningNode) -> Result<(), Error> {
    let nodes = tx.create_bucket_if_not_exists(NODE_BUCKET)?;
    put_lightning_node(&nodes, node)?;
    nodes.put(SOURCE_KEY, &node.pub_key.serialize())?;
    Ok(())
}

/// Install an edge info record in the edge index, maintaining the channel
/// point index alongside it. `EdgeAlreadyExist` if the channel id is taken.
pub(crate) fn add_channel_edge(tx: &Tx, edge: &ChannelEdgeInfo) -> Result<(), Error> {
    if edge.node_key1.serialize() >= edge.node_key2.serialize() {
        return Err(Error::corrupt("edge participants are not canonically ordered"));
    }
    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    let edge_index = edges
        .bucket(EDGE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge index bucket not created"))?;
    let chan_key = edge.channel_id.to_be_bytes();
    if edge_index.get(&chan_key)?.is_some() {
        return Err(Error::EdgeAlreadyExist);
    }
    edge_index.put(&chan_key, &serialize_edge_info(edge))?;

    let chan_point_index = edges
        .bucket(CHANNEL_POINT_BUCKET)?
        .ok_or_else(|| Error::corrupt("channel point bucket not created"))?;
    chan_point_index.put(&outpoint_key(&edge.channel_point), &chan_key)?;
    Ok(())
}

/// Upsert one direction of an edge policy and keep the edge update index in
/// sync, dropping the entry of the update this one replaces.
pub(crate) fn update_edge_policy(tx: &Tx, policy: &ChannelEdgePolicy) -> Result<(), Error> {
    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    let update_index = edges
        .bucket(EDGE_UPDATE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge update index bucket not created"))?;

    let key = edge_policy_key(policy.channel_id, policy.flags & CHAN_UPDATE_DIRECTION);
    if let Some(existing) = edges.get(&key)? {
        if let Some(old) = deserialize_edge_policy(&existing)? {
            update_index.delete(&update_index_key(old.last_update, &policy.channel_id.to_be_bytes()))?;
        }
    }
    update_index.put(&update_index_key(policy.last_update, &policy.channel_id.to_be_bytes()), &[])?;
    edges.put(&key, &serialize_edge_policy(policy))?;
    Ok(())
}

/// Fetch an edge and both of its policies straight from disk.
pub(crate) fn fetch_channel_edge(tx: &Tx, channel_id: u64) -> Result<ChannelEdge, Error> {
    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    let edge_index = edges
        .bucket(EDGE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge index bucket not created"))?;
    let bytes = edge_index.get(&channel_id.to_be_bytes())?.ok_or(Error::EdgeNotFound)?;
    let info = deserialize_edge_info(&bytes)?;

    let mut policies = [None, None];
    for direction in 0..2u8 {
        if let Some(bytes) = edges.get(&edge_policy_key(channel_id, direction))? {
            policies[direction as usize] = deserialize_edge_policy(&bytes)?;
        }
    }
    let [policy1, policy2] = policies;
    Ok(ChannelEdge { info, policy1, policy2 })
}

/// An entry of the reject cache: the freshest update time seen for each
/// direction of a known channel.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RejectCacheEntry {
    pub upd1_time: u64,
    pub upd2_time: u64,
}

/// A capacity-bounded map that drops an arbitrary entry once full.
pub(crate) struct BoundedCache<V> {
    max: usize,
    map: HashMap<u64, V>,
}

impl<V> BoundedCache<V> {
    fn new(max: usize) -> Self {
        BoundedCache { max, map: HashMap::new() }
    }

    pub fn get(&self, channel_id: u64) -> Option<&V> {
        self.map.get(&channel_id)
    }

    pub fn insert(&mut self, channel_id: u64, value: V) {
        if self.map.len() >= self.max && !self.map.contains_key(&channel_id) {
            if let Some(&victim) = self.map.keys().next() {
                self.map.remove(&victim);
            }
        }
        self.map.insert(channel_id, value);
    }

    pub fn remove(&mut self, channel_id: u64) {
        self.map.remove(&channel_id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

pub(crate) struct GraphCaches {
    pub reject: BoundedCache<RejectCacheEntry>,
    pub chan: BoundedCache<ChannelEdge>,
}

/// The channel graph as seen by the channel store: the write surface used
/// during shell restoration and the caches that must stay coherent with it.
///
/// Both caches sit behind a single reader-writer lock. Mutation paths hold
/// the write half across their whole transaction so readers observe either
/// the pre-mutation or the post-mutation world, never a mix.
pub struct ChannelGraph {
    store: Arc<Store>,
    pub(crate) caches: RwLock<GraphCaches>,
}

impl ChannelGraph {
    pub(crate) fn new(store: Arc<Store>, reject_cache_size: usize, channel_cache_size: usize) -> Self {
        ChannelGraph {
            store,
            caches: RwLock::new(GraphCaches {
                reject: BoundedCache::new(reject_cache_size),
                chan: BoundedCache::new(channel_cache_size),
            }),
        }
    }

    /// The self node of the graph.
    pub fn source_node(&self) -> Result<LightningNode, Error> {
        self.store.view(|tx| {
            let nodes = tx.bucket(NODE_BUCKET)?.ok_or(Error::GraphNotFound)?;
            source_node(&nodes)
        })
    }

    /// Set the self node of the graph, creating its node record.
    pub fn set_source_node(&self, node: &LightningNode) -> Result<(), Error> {
        self.store.update(|tx| set_source_node(tx, node))
    }

    /// Upsert a node announcement.
    pub fn add_lightning_node(&self, node: &LightningNode) -> Result<(), Error> {
        self.store.update(|tx| {
            let nodes = tx.create_bucket_if_not_exists(NODE_BUCKET)?;
            put_lightning_node(&nodes, node)
        })
    }

    /// Fetch a node announcement.
    pub fn fetch_lightning_node(&self, pub_key: &PublicKey) -> Result<LightningNode, Error> {
        self.store.view(|tx| {
            let nodes = tx.bucket(NODE_BUCKET)?.ok_or(Error::GraphNotFound)?;
            fetch_lightning_node(&nodes, &pub_key.serialize())
        })
    }

    /// Whether the graph knows an edge with this channel id, answered from
    /// the reject cache when possible. A known edge reports the freshest
    /// update time of each direction.
    pub fn has_channel_edge(&self, channel_id: u64) -> Result<Option<(u64, u64)>, Error> {
        if let Some(entry) = self.caches.read().unwrap().reject.get(channel_id) {
            return Ok(Some((entry.upd1_time, entry.upd2_time)));
        }
        let edge = match self.fetch_edge_from_disk(channel_id) {
            Ok(edge) => edge,
            Err(Error::EdgeNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry = RejectCacheEntry {
            upd1_time: edge.policy1.as_ref().map(|p| p.last_update).unwrap_or(0),
            upd2_time: edge.policy2.as_ref().map(|p| p.last_update).unwrap_or(0),
        };
        self.caches.write().unwrap().reject.insert(channel_id, entry);
        Ok(Some((entry.upd1_time, entry.upd2_time)))
    }

    /// Fetch an edge and its policies, answered from the channel cache when
    /// possible.
    pub fn fetch_channel_edge(&self, channel_id: u64) -> Result<ChannelEdge, Error> {
        if let Some(edge) = self.caches.read().unwrap().chan.get(channel_id) {
            return Ok(edge.clone());
        }
        let edge = self.fetch_edge_from_disk(channel_id)?;
        self.caches.write().unwrap().chan.insert(channel_id, edge.clone());
        Ok(edge)
    }

    fn fetch_edge_from_disk(&self, channel_id: u64) -> Result<ChannelEdge, Error> {
        self.store.view(|tx| fetch_channel_edge(tx, channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::Txid;

    fn test_pubkey(b: u8) -> PublicKey {
        let sk = SecretKey::from_slice(&[b; 32]).unwrap();
        PublicKey::from_secret_key(&Secp256k1::new(), &sk)
    }

    fn ordered_keys(a: u8, b: u8) -> (PublicKey, PublicKey) {
        let (ka, kb) = (test_pubkey(a), test_pubkey(b));
        if ka.serialize() < kb.serialize() {
            (ka, kb)
        } else {
            (kb, ka)
        }
    }

    fn test_edge(channel_id: u64) -> ChannelEdgeInfo {
        let (node_key1, node_key2) = ordered_keys(1, 2);
        ChannelEdgeInfo {
            channel_id,
            chain_hash: BlockHash::from_byte_array([0x33; 32]),
            node_key1,
            node_key2,
            capacity: Amount::from_sat(500_000),
            channel_point: OutPoint { txid: Txid::from_byte_array([0x44; 32]), vout: 0 },
        }
    }

    #[test]
    fn lightning_node_roundtrip() {
        let node = LightningNode {
            pub_key: test_pubkey(7),
            last_update: 1_700_000_000,
            alias: "carol".to_string(),
            addresses: vec!["192.168.1.1:9735".parse().unwrap()],
        };
        let bytes = serialize_lightning_node(&node).unwrap();
        assert_eq!(deserialize_lightning_node(&bytes).unwrap(), node);
    }

    #[test]
    fn edge_info_roundtrip() {
        let edge = test_edge(42);
        let bytes = serialize_edge_info(&edge);
        assert_eq!(deserialize_edge_info(&bytes).unwrap(), edge);
    }

    #[test]
    fn edge_policy_roundtrip_and_sentinel() {
        let policy = ChannelEdgePolicy {
            channel_id: 42,
            last_update: 1_700_000_123,
            flags: CHAN_UPDATE_DIRECTION,
            timelock_delta: 40,
            htlc_min_msat: 1_000,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 1,
        };
        let bytes = serialize_edge_policy(&policy);
        assert_eq!(deserialize_edge_policy(&bytes).unwrap().unwrap(), policy);
        assert!(deserialize_edge_policy(UNKNOWN_POLICY).unwrap().is_none());
    }

    #[test]
    fn bounded_cache_evicts_at_capacity() {
        let mut cache = BoundedCache::new(2);
        cache.insert(1, ());
        cache.insert(2, ());
        cache.insert(3, ());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(3).is_some());
        // refreshing a present key does not evict
        cache.insert(3, ());
        assert_eq!(cache.len(), 2);
    }
}

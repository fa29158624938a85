//! The link node store: per-peer records of known reachable addresses.

use std::net::SocketAddr;

use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;

use crate::codec::{Reader, Writer};
use crate::error::Error;
use crate::kvdb::{Bucket, Tx};

/// Top-level bucket mapping peer identity keys to link node records. This is
/// also the canonical set of peers the multi-channel scans iterate.
pub(crate) const NODE_INFO_BUCKET: &[u8] = b"node-info-bucket";

/// A peer we have (or had) channels with, together with the addresses the
/// peer was known to be reachable at.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkNode {
    /// The chain the peer was seen on.
    pub network: Network,
    /// The peer's long-term identity key.
    pub identity_pub: PublicKey,
    /// Unix timestamp of the last time we saw this peer, from the injected
    /// clock.
    pub last_seen: u64,
    pub addresses: Vec<SocketAddr>,
}

impl LinkNode {
    pub fn new(
        network: Network,
        identity_pub: PublicKey,
        last_seen: u64,
        addresses: Vec<SocketAddr>,
    ) -> Self {
        let mut node = LinkNode { network, identity_pub, last_seen, addresses: Vec::new() };
        for addr in addresses {
            node.add_address(addr);
        }
        node
    }

    /// Add an address, collapsing duplicates by canonical string form.
    pub fn add_address(&mut self, addr: SocketAddr) {
        let canonical = addr.to_string();
        if self.addresses.iter().any(|a| a.to_string() == canonical) {
            return;
        }
        self.addresses.push(addr);
    }
}

fn network_to_magic(network: Network) -> Result<u32, Error> {
    match network {
        Network::Bitcoin => Ok(0xd9b4_bef9),
        Network::Testnet => Ok(0x0709_110b),
        Network::Signet => Ok(0x40cf_030a),
        Network::Regtest => Ok(0xdab5_bffa),
        n => Err(Error::codec(format!("unsupported network {:?}", n))),
    }
}

fn network_from_magic(magic: u32) -> Result<Network, Error> {
    match magic {
        0xd9b4_bef9 => Ok(Network::Bitcoin),
        0x0709_110b => Ok(Network::Testnet),
        0x40cf_030a => Ok(Network::Signet),
        0xdab5_bffa => Ok(Network::Regtest),
        n => Err(Error::codec(format!("unknown network magic {:#x}", n))),
    }
}

pub(crate) fn serialize_link_node(node: &LinkNode) -> Result<Vec<u8>, Error> {
    let mut w = Writer::new();
    w.write_u32(network_to_magic(node.network)?);
    w.write_pubkey(&node.identity_pub);
    w.write_u64(node.last_seen);
    w.write_addrs(&node.addresses)?;
    Ok(w.into_vec())
}

pub(crate) fn deserialize_link_node(bytes: &[u8]) -> Result<LinkNode, Error> {
    let mut r = Reader::new(bytes);
    let network = network_from_magic(r.read_u32()?)?;
    let identity_pub = r.read_pubkey()?;
    let last_seen = r.read_u64()?;
    let addresses = r.read_addrs()?;
    Ok(LinkNode { network, identity_pub, last_seen, addresses })
}

/// Write a link node record under its identity key.
pub(crate) fn put_link_node(node_info: &Bucket, node: &LinkNode) -> Result<(), Error> {
    let value = serialize_link_node(node)?;
    node_info.put(&node.identity_pub.serialize(), &value)?;
    Ok(())
}

/// Fetch the link node record of a peer.
pub(crate) fn fetch_link_node(tx: &Tx, identity_pub: &PublicKey) -> Result<LinkNode, Error> {
    let node_info = tx.bucket(NODE_INFO_BUCKET)?.ok_or(Error::LinkNodeNotFound)?;
    let bytes = node_info.get(&identity_pub.serialize())?.ok_or(Error::LinkNodeNotFound)?;
    deserialize_link_node(&bytes)
}

/// All link node records, in identity key order.
pub(crate) fn fetch_all_link_nodes(tx: &Tx) -> Result<Vec<LinkNode>, Error> {
    let node_info = match tx.bucket(NODE_INFO_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(Vec::new()),
    };
    let mut nodes = Vec::new();
    for (_key, value) in node_info.items()? {
        if let Some(value) = value {
            nodes.push(deserialize_link_node(&value)?);
        }
    }
    Ok(nodes)
}

/// Remove a peer's link node record. A missing bucket or record means there
/// is nothing to remove.
pub(crate) fn delete_link_node(tx: &Tx, identity_pub: &PublicKey) -> Result<(), Error> {
    if let Some(node_info) = tx.bucket(NODE_INFO_BUCKET)? {
        node_info.delete(&identity_pub.serialize())?;
    }
    Ok(())
}

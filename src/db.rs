//! The channel database facade: opens the store, owns the graph caches, and
//! exposes the channel and peer operations.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, OutPoint};
use log::{error, info};

use crate::channel::{
    close_summary_key, deserialize_close_summary, fetch_open_channel, put_open_channel,
    serialize_close_summary, ChannelCloseSummary, ChannelId, ChannelShell, ChannelStatus,
    OpenChannel, CLOSED_CHANNEL_BUCKET, FWD_LOG_BUCKET, FWD_PACKAGES_BUCKET, INVOICE_BUCKET,
    OPEN_CHANNEL_BUCKET,
};
use crate::codec::{outpoint_from_key, outpoint_key, OUTPOINT_SIZE, PUBKEY_SIZE};
use crate::error::Error;
use crate::graph::{
    add_channel_edge, fetch_lightning_node, source_node, update_edge_policy, ChannelEdgeInfo,
    ChannelEdgePolicy, ChannelGraph, ALIAS_INDEX_BUCKET, CHANNEL_POINT_BUCKET,
    CHAN_UPDATE_DIRECTION, EDGE_BUCKET, EDGE_INDEX_BUCKET, EDGE_UPDATE_INDEX_BUCKET,
    GRAPH_META_BUCKET, NODE_BUCKET, NODE_UPDATE_INDEX_BUCKET, PRUNE_LOG_BUCKET, ZOMBIE_BUCKET,
};
use crate::kvdb::{Bucket, Store, Tx};
use crate::meta::{
    fetch_meta, latest_db_version, migrations_to_apply, put_meta, Meta, Version, DB_VERSIONS,
    META_BUCKET,
};
use crate::nodes::{
    delete_link_node, fetch_all_link_nodes, fetch_link_node, put_link_node, LinkNode,
    NODE_INFO_BUCKET,
};
use crate::util::clock::{Clock, StandardClock};

/// The name of the database file inside its directory.
pub const DB_NAME: &str = "channel.db";

pub const DEFAULT_REJECT_CACHE_SIZE: usize = 50_000;
pub const DEFAULT_CHANNEL_CACHE_SIZE: usize = 20_000;

/// Tunables applied when opening the database.
pub struct Options {
    pub reject_cache_size: usize,
    pub channel_cache_size: usize,
    /// The chain peers are recorded against.
    pub network: Network,
    /// The time source for every persisted timestamp.
    pub clock: Arc<dyn Clock>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            reject_cache_size: DEFAULT_REJECT_CACHE_SIZE,
            channel_cache_size: DEFAULT_CHANNEL_CACHE_SIZE,
            network: Network::Bitcoin,
            clock: Arc::new(StandardClock()),
        }
    }
}

/// The primary datastore of the node: open and closed channels, the peer
/// address book, and the channel graph built on the same file.
pub struct DB {
    pub(crate) store: Arc<Store>,
    db_path: PathBuf,
    graph: ChannelGraph,
    network: Network,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB")
            .field("db_path", &self.db_path)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl DB {
    /// Open an existing channel database, or create and initialize one when
    /// the file does not exist yet. Outstanding schema migrations run before
    /// the handle is returned.
    pub fn open<P: AsRef<Path>>(db_path: P, options: Options) -> Result<DB, Error> {
        let db_path = db_path.as_ref().to_path_buf();
        let file_path = db_path.join(DB_NAME);
        let fresh = !file_path.exists();
        if fresh && !db_path.exists() {
            fs::create_dir_all(&db_path).map_err(|e| Error::Store(e.into()))?;
            set_permissions(&db_path, 0o700)?;
        }

        let store = Arc::new(Store::open(&file_path)?);
        if fresh {
            set_permissions(&file_path, 0o600)?;
            init_buckets(&store)?;
        }

        let db = DB {
            graph: ChannelGraph::new(
                store.clone(),
                options.reject_cache_size,
                options.channel_cache_size,
            ),
            store,
            db_path,
            network: options.network,
            clock: options.clock,
        };
        db.sync_versions(&DB_VERSIONS)?;
        Ok(db)
    }

    /// The directory this database lives in.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// The channel graph built over this database.
    pub fn channel_graph(&self) -> &ChannelGraph {
        &self.graph
    }

    /// The current schema version record.
    pub fn fetch_meta(&self) -> Result<Meta, Error> {
        self.store.view(|tx| fetch_meta(tx))
    }

    /// Delete all state from every used bucket in one transaction. The file
    /// and the meta record survive.
    pub fn wipe(&self) -> Result<(), Error> {
        self.store.update(|tx| {
            for bucket in [
                OPEN_CHANNEL_BUCKET,
                CLOSED_CHANNEL_BUCKET,
                FWD_LOG_BUCKET,
                FWD_PACKAGES_BUCKET,
                INVOICE_BUCKET,
                NODE_INFO_BUCKET,
                NODE_BUCKET,
                EDGE_BUCKET,
                GRAPH_META_BUCKET,
            ] {
                tx.delete_bucket_if_exists(bucket)?;
            }
            Ok(())
        })
    }

    /// Synchronize the stored schema version with this build, applying every
    /// outstanding migration inside a single transaction.
    pub(crate) fn sync_versions(&self, versions: &[Version]) -> Result<(), Error> {
        let meta = match self.fetch_meta() {
            Ok(meta) => meta,
            Err(Error::MetaNotFound) => Meta { db_version_number: 0 },
            Err(e) => return Err(e),
        };

        let latest_version = latest_db_version(versions);
        info!(
            "Checking for schema update: latest_version={}, db_version={}",
            latest_version, meta.db_version_number
        );

        if meta.db_version_number > latest_version {
            error!(
                "Refusing to revert from db_version={} to lower version={}",
                meta.db_version_number, latest_version
            );
            return Err(Error::DbReversion {
                stored: meta.db_version_number,
                latest: latest_version,
            });
        }
        if meta.db_version_number == latest_version {
            return Ok(());
        }

        info!("Performing database schema migration");
        self.store.update(|tx| {
            for version in migrations_to_apply(versions, meta.db_version_number) {
                if let Some(migration) = version.migration {
                    info!("Applying migration #{}", version.number);
                    migration(tx).map_err(|e| {
                        info!("Unable to apply migration #{}", version.number);
                        e
                    })?;
                }
            }
            put_meta(tx, &Meta { db_version_number: latest_version })
        })
    }

    /// All open channels with the given peer. A peer without channels yields
    /// an empty vector.
    pub fn fetch_open_channels(&self, node_id: &PublicKey) -> Result<Vec<OpenChannel>, Error> {
        self.store.view(|tx| fetch_open_channels(tx, node_id))
    }

    /// Locate a channel by its funding outpoint, walking the whole open
    /// channel tree.
    pub fn fetch_channel(&self, chan_point: &OutPoint) -> Result<OpenChannel, Error> {
        let target_key = outpoint_key(chan_point);
        self.store.view(|tx| {
            let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.ok_or(Error::NoActiveChannels)?;
            for (node_key, value) in open.items()? {
                // only peer sub-buckets keyed by a compressed pubkey matter
                if node_key.len() != PUBKEY_SIZE || value.is_some() {
                    continue;
                }
                let node_bucket = match open.bucket(&node_key)? {
                    Some(bucket) => bucket,
                    None => continue,
                };
                for (chain_key, value) in node_bucket.items()? {
                    if value.is_some() {
                        continue;
                    }
                    let chain_bucket = node_bucket.bucket(&chain_key)?.ok_or_else(|| {
                        Error::corrupt(format!(
                            "unable to read bucket for chain={}",
                            hex::encode(&chain_key)
                        ))
                    })?;
                    if let Some(chan_bucket) = chain_bucket.bucket(&target_key)? {
                        return fetch_open_channel(&chan_bucket, chan_point);
                    }
                }
            }
            Err(Error::ChannelNotFound)
        })
    }

    /// Every stored channel: open, pending open, and waiting close.
    pub fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>, Error> {
        let mut channels = self.fetch_all_open_channels()?;
        channels.extend(self.fetch_pending_channels()?);
        channels.extend(self.fetch_waiting_close_channels()?);
        Ok(channels)
    }

    /// Channels whose funding confirmed and which are not closing.
    pub fn fetch_all_open_channels(&self) -> Result<Vec<OpenChannel>, Error> {
        self.fetch_channels(false, false)
    }

    /// Channels whose funding transaction has not confirmed yet.
    pub fn fetch_pending_channels(&self) -> Result<Vec<OpenChannel>, Error> {
        self.fetch_channels(true, false)
    }

    /// Channels waiting for their closing transaction to confirm, including
    /// ones that were still pending open.
    pub fn fetch_waiting_close_channels(&self) -> Result<Vec<OpenChannel>, Error> {
        let mut channels = self.fetch_channels(false, true)?;
        channels.extend(self.fetch_channels(true, true)?);
        Ok(channels)
    }

    fn fetch_channels(&self, pending: bool, waiting_close: bool) -> Result<Vec<OpenChannel>, Error> {
        self.store.view(|tx| {
            let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.ok_or(Error::NoActiveChannels)?;
            let node_info = tx
                .bucket(NODE_INFO_BUCKET)?
                .ok_or_else(|| Error::corrupt("node info bucket not created"))?;

            let mut channels = Vec::new();
            for (peer_key, _value) in node_info.items()? {
                let node_bucket = match open.bucket(&peer_key)? {
                    Some(bucket) => bucket,
                    None => continue,
                };
                for (chain_key, value) in node_bucket.items()? {
                    if value.is_some() {
                        continue;
                    }
                    let chain_bucket = node_bucket.bucket(&chain_key)?.ok_or_else(|| {
                        Error::corrupt(format!(
                            "unable to read bucket for chain={}",
                            hex::encode(&chain_key)
                        ))
                    })?;
                    for channel in fetch_node_channels(&chain_bucket)? {
                        if channel.is_pending != pending {
                            continue;
                        }
                        // any status beyond default means the channel is on
                        // its way to being closed
                        let channel_waiting_close = !channel.chan_status().is_default();
                        if channel_waiting_close != waiting_close {
                            continue;
                        }
                        channels.push(channel);
                    }
                }
            }
            Ok(channels)
        })
    }

    /// All close summaries, optionally only the ones still pending.
    pub fn fetch_closed_channels(
        &self,
        pending_only: bool,
    ) -> Result<Vec<ChannelCloseSummary>, Error> {
        self.store.view(|tx| {
            let closed = tx.bucket(CLOSED_CHANNEL_BUCKET)?.ok_or(Error::NoClosedChannels)?;
            let mut summaries = Vec::new();
            for (_key, value) in closed.items()? {
                if let Some(value) = value {
                    let summary = deserialize_close_summary(&value)?;
                    if pending_only && !summary.is_pending {
                        continue;
                    }
                    summaries.push(summary);
                }
            }
            Ok(summaries)
        })
    }

    /// The close summary of a channel, by funding outpoint.
    pub fn fetch_closed_channel(
        &self,
        chan_point: &OutPoint,
    ) -> Result<ChannelCloseSummary, Error> {
        self.store.view(|tx| {
            let closed = tx.bucket(CLOSED_CHANNEL_BUCKET)?.ok_or(Error::ClosedChannelNotFound)?;
            let bytes =
                closed.get(&outpoint_key(chan_point))?.ok_or(Error::ClosedChannelNotFound)?;
            deserialize_close_summary(&bytes)
        })
    }

    /// The close summary of a channel, by channel id. The first 30 bytes of
    /// a channel id and its outpoint key agree, so candidates come from a
    /// prefix seek over the closed bucket.
    pub fn fetch_closed_channel_for_id(
        &self,
        chan_id: &ChannelId,
    ) -> Result<ChannelCloseSummary, Error> {
        self.store.view(|tx| {
            let closed = tx.bucket(CLOSED_CHANNEL_BUCKET)?.ok_or(Error::ClosedChannelNotFound)?;
            let prefix = &chan_id.0[..30];
            for (key, value) in closed.range_from(prefix)? {
                if key.len() != OUTPOINT_SIZE {
                    continue;
                }
                if &key[..30] > prefix {
                    break;
                }
                let chan_point = outpoint_from_key(&key)?;
                if !chan_id.is_chan_point(&chan_point) {
                    continue;
                }
                return deserialize_close_summary(&value);
            }
            Err(Error::ClosedChannelNotFound)
        })
    }

    /// Move a channel from the open tree into the closed bucket, writing the
    /// supplied close summary. Empty parent buckets are removed on the way
    /// out.
    pub fn close_channel(&self, summary: &ChannelCloseSummary) -> Result<(), Error> {
        self.store.update(|tx| close_channel(tx, summary))
    }

    /// Flip a close summary out of the pending state once a cooperative
    /// close confirmed or all force-close funds are swept, then garbage
    /// collect the peer if this was its last channel.
    pub fn mark_chan_fully_closed(&self, chan_point: &OutPoint) -> Result<(), Error> {
        self.store.update(|tx| {
            let closed = tx.create_bucket_if_not_exists(CLOSED_CHANNEL_BUCKET)?;
            let key = outpoint_key(chan_point);
            let bytes = closed.get(&key)?.ok_or(Error::ClosedChannelNotFound)?;
            let mut summary = deserialize_close_summary(&bytes)?;
            summary.is_pending = false;
            closed.put(&key, &serialize_close_summary(&summary))?;

            // with the channel closed, check whether any channels with this
            // peer remain before keeping its address record around
            prune_link_node(tx, &summary.remote_pub)
        })
    }

    /// Apply the zero-open-channels pruning rule to every peer record.
    pub fn prune_link_nodes(&self) -> Result<(), Error> {
        self.store.update(|tx| {
            for link_node in fetch_all_link_nodes(tx)? {
                prune_link_node(tx, &link_node.identity_pub)?;
            }
            Ok(())
        })
    }

    /// All link node records.
    pub fn fetch_all_link_nodes(&self) -> Result<Vec<LinkNode>, Error> {
        self.store.view(|tx| fetch_all_link_nodes(tx))
    }

    /// Remove a channel that never made it to chain. Re-running against an
    /// already abandoned channel succeeds without touching anything.
    pub fn abandon_channel(&self, chan_point: &OutPoint, best_height: u32) -> Result<(), Error> {
        let channel = match self.fetch_channel(chan_point) {
            Err(Error::ChannelNotFound) => {
                // possibly abandoned before; only a closed entry makes the
                // call succeed
                self.fetch_closed_channel(chan_point)?;
                return Ok(());
            }
            other => other?,
        };

        let summary = ChannelCloseSummary {
            chan_point: *chan_point,
            short_chan_id: channel.short_channel_id,
            chain_hash: channel.chain_hash,
            close_height: best_height,
            remote_pub: channel.identity_pub,
            capacity: channel.capacity,
            settled_balance: channel.settled_balance(),
            close_type: crate::channel::CloseType::Abandoned,
            is_pending: false,
            remote_current_revocation: channel.remote_current_revocation,
            local_chan_cfg: Some(channel.local_chan_cfg),
            remote_next_revocation: channel.remote_next_revocation,
        };
        self.store.update(|tx| {
            close_channel(tx, &summary)?;
            prune_link_node(tx, &summary.remote_pub)
        })
    }

    /// Insert a channel record and make sure a link node exists for its
    /// peer. Idempotent on the (peer, chain, outpoint) key.
    pub fn sync_new_channel(
        &self,
        channel: &OpenChannel,
        addrs: &[SocketAddr],
    ) -> Result<(), Error> {
        self.store.update(|tx| self.sync_new_channel_tx(tx, channel, addrs))
    }

    fn sync_new_channel_tx(
        &self,
        tx: &Tx,
        channel: &OpenChannel,
        addrs: &[SocketAddr],
    ) -> Result<(), Error> {
        let open = tx.create_bucket_if_not_exists(OPEN_CHANNEL_BUCKET)?;
        let peer_key = channel.identity_pub.serialize();
        let node_bucket = open.create_bucket_if_not_exists(&peer_key)?;
        let chain_bucket =
            node_bucket.create_bucket_if_not_exists(&channel.chain_hash.to_byte_array())?;
        let point_key = outpoint_key(&channel.funding_outpoint);
        if chain_bucket.bucket(&point_key)?.is_none() {
            let chan_bucket = chain_bucket.create_bucket_if_not_exists(&point_key)?;
            put_open_channel(&chan_bucket, channel)?;
        }

        let node_info = tx.create_bucket_if_not_exists(NODE_INFO_BUCKET)?;
        if node_info.get(&peer_key)?.is_none() {
            let link_node = LinkNode::new(
                self.network,
                channel.identity_pub,
                self.clock.now().as_secs(),
                addrs.to_vec(),
            );
            put_link_node(&node_info, &link_node)?;
        }
        Ok(())
    }

    /// Reconstruct channels from external shells: write the channel and link
    /// node records, then install a graph edge and a policy for each shell
    /// so the partial network view includes them. Both graph caches are held
    /// locked across the whole restore and invalidated for every restored
    /// channel id.
    pub fn restore_channel_shells(&self, shells: &[ChannelShell]) -> Result<(), Error> {
        let mut caches = self.graph.caches.write().unwrap();

        let restored: Vec<u64> = self.store.update(|tx| {
            let mut restored = Vec::with_capacity(shells.len());
            for shell in shells {
                let mut channel = shell.chan.clone();
                // flag the record so other subsystems will not treat this
                // like a fully operational channel
                channel.chan_status |= ChannelStatus::RESTORED;
                self.sync_new_channel_tx(tx, &channel, &shell.node_addrs)?;

                let nodes = tx.bucket(NODE_BUCKET)?.ok_or(Error::GraphNotFound)?;
                let self_node = source_node(&nodes)?;
                let self_key = self_node.pub_key.serialize();
                let peer_key = channel.identity_pub.serialize();
                let self_is_smaller = self_key < peer_key;
                let (node_key1, node_key2) = if self_is_smaller {
                    (self_node.pub_key, channel.identity_pub)
                } else {
                    (channel.identity_pub, self_node.pub_key)
                };

                let edge_info = ChannelEdgeInfo {
                    channel_id: channel.short_channel_id.to_u64(),
                    chain_hash: channel.chain_hash,
                    node_key1,
                    node_key2,
                    capacity: channel.capacity,
                    channel_point: channel.funding_outpoint,
                };
                match add_channel_edge(tx, &edge_info) {
                    Err(Error::EdgeAlreadyExist) => {}
                    other => other?,
                }

                let mut policy = ChannelEdgePolicy {
                    channel_id: edge_info.channel_id,
                    last_update: self.clock.now().as_secs(),
                    flags: 0,
                    timelock_delta: 0,
                    htlc_min_msat: 0,
                    fee_base_msat: 0,
                    fee_proportional_millionths: 0,
                };
                // a larger self key means we are node2, so flag the update
                // as coming from the second node
                if !self_is_smaller {
                    policy.flags |= CHAN_UPDATE_DIRECTION;
                }
                update_edge_policy(tx, &policy)?;

                restored.push(edge_info.channel_id);
            }
            Ok::<_, Error>(restored)
        })?;

        for channel_id in restored {
            caches.reject.remove(channel_id);
            caches.chan.remove(channel_id);
        }
        Ok(())
    }

    /// Every address known for a peer: the union of its link node record and
    /// its graph node announcement, deduplicated by canonical form. Missing
    /// either source just shrinks the union.
    pub fn addrs_for_node(&self, node_pub: &PublicKey) -> Result<Vec<SocketAddr>, Error> {
        let (link_addrs, graph_addrs) = self.store.view(|tx| {
            let link_addrs = match fetch_link_node(tx, node_pub) {
                Ok(node) => node.addresses,
                Err(Error::LinkNodeNotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            let nodes = tx.bucket(NODE_BUCKET)?.ok_or(Error::GraphNotFound)?;
            let graph_addrs = match fetch_lightning_node(&nodes, &node_pub.serialize()) {
                Ok(node) => node.addresses,
                Err(Error::GraphNodeNotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            Ok((link_addrs, graph_addrs))
        })?;

        let mut seen = HashSet::new();
        let mut addrs = Vec::new();
        for addr in link_addrs.into_iter().chain(graph_addrs) {
            if seen.insert(addr.to_string()) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::Store(e.into()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

/// Populate every top-level bucket and the nested index buckets, and stamp
/// the file with the latest schema version.
fn init_buckets(store: &Store) -> Result<(), Error> {
    store.update(|tx| {
        tx.create_bucket_if_not_exists(OPEN_CHANNEL_BUCKET)?;
        tx.create_bucket_if_not_exists(CLOSED_CHANNEL_BUCKET)?;
        tx.create_bucket_if_not_exists(FWD_LOG_BUCKET)?;
        tx.create_bucket_if_not_exists(FWD_PACKAGES_BUCKET)?;
        tx.create_bucket_if_not_exists(INVOICE_BUCKET)?;
        tx.create_bucket_if_not_exists(NODE_INFO_BUCKET)?;

        let nodes = tx.create_bucket_if_not_exists(NODE_BUCKET)?;
        nodes.create_bucket_if_not_exists(ALIAS_INDEX_BUCKET)?;
        nodes.create_bucket_if_not_exists(NODE_UPDATE_INDEX_BUCKET)?;

        let edges = tx.create_bucket_if_not_exists(EDGE_BUCKET)?;
        edges.create_bucket_if_not_exists(EDGE_INDEX_BUCKET)?;
        edges.create_bucket_if_not_exists(EDGE_UPDATE_INDEX_BUCKET)?;
        edges.create_bucket_if_not_exists(CHANNEL_POINT_BUCKET)?;
        edges.create_bucket_if_not_exists(ZOMBIE_BUCKET)?;

        let graph_meta = tx.create_bucket_if_not_exists(GRAPH_META_BUCKET)?;
        graph_meta.create_bucket_if_not_exists(PRUNE_LOG_BUCKET)?;

        tx.create_bucket_if_not_exists(META_BUCKET)?;
        put_meta(tx, &Meta { db_version_number: latest_db_version(&DB_VERSIONS) })
    })
}

/// All open channels with a peer, inside an existing transaction.
fn fetch_open_channels(tx: &Tx, node_id: &PublicKey) -> Result<Vec<OpenChannel>, Error> {
    let open = match tx.bucket(OPEN_CHANNEL_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(Vec::new()),
    };
    let node_bucket = match open.bucket(&node_id.serialize())? {
        Some(bucket) => bucket,
        None => return Ok(Vec::new()),
    };

    let mut channels = Vec::new();
    for (chain_key, value) in node_bucket.items()? {
        // a value here is not a chain sub-bucket, ignore it
        if value.is_some() {
            continue;
        }
        let chain_bucket = node_bucket.bucket(&chain_key)?.ok_or_else(|| {
            Error::corrupt(format!("unable to read bucket for chain={}", hex::encode(&chain_key)))
        })?;
        channels.extend(fetch_node_channels(&chain_bucket)?);
    }
    Ok(channels)
}

/// All channels under one chain bucket.
fn fetch_node_channels(chain_bucket: &Bucket) -> Result<Vec<OpenChannel>, Error> {
    let mut channels = Vec::new();
    for (point_key, value) in chain_bucket.items()? {
        if value.is_some() {
            continue;
        }
        let chan_bucket = chain_bucket
            .bucket(&point_key)?
            .ok_or_else(|| Error::corrupt("channel bucket vanished mid-scan"))?;
        let chan_point = outpoint_from_key(&point_key)?;
        channels.push(fetch_open_channel(&chan_bucket, &chan_point)?);
    }
    Ok(channels)
}

/// Move an open channel into the closed bucket under one transaction,
/// removing parents left empty by the deletion.
fn close_channel(tx: &Tx, summary: &ChannelCloseSummary) -> Result<(), Error> {
    let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.ok_or(Error::NoActiveChannels)?;
    let peer_key = summary.remote_pub.serialize();
    let node_bucket = open.bucket(&peer_key)?.ok_or(Error::ChannelNotFound)?;
    let chain_key = summary.chain_hash.to_byte_array();
    let chain_bucket = node_bucket.bucket(&chain_key)?.ok_or(Error::ChannelNotFound)?;
    let point_key = outpoint_key(&summary.chan_point);
    if chain_bucket.bucket(&point_key)?.is_none() {
        return Err(Error::ChannelNotFound);
    }

    chain_bucket.delete_bucket(&point_key)?;
    if chain_bucket.is_empty()? {
        node_bucket.delete_bucket(&chain_key)?;
        if node_bucket.is_empty()? {
            open.delete_bucket(&peer_key)?;
        }
    }

    let closed = tx.create_bucket_if_not_exists(CLOSED_CHANNEL_BUCKET)?;
    closed.put(&close_summary_key(summary), &serialize_close_summary(summary))?;
    Ok(())
}

/// Garbage collect a peer's link node when no open channels with it remain.
fn prune_link_node(tx: &Tx, remote_pub: &PublicKey) -> Result<(), Error> {
    let open_channels = fetch_open_channels(tx, remote_pub)?;
    if !open_channels.is_empty() {
        return Ok(());
    }

    info!("Pruning link node {} with zero open channels from database", remote_pub);
    delete_link_node(tx, remote_pub)
}

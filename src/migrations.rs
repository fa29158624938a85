//! Forward-only schema migrations.
//!
//! Every function here is a bytes-to-bytes transform over the existing
//! buckets, applied at most once over the history of a file and always
//! inside the single transaction the migration engine opens. Records are
//! buffered before they are rewritten or deleted.

use log::info;

use crate::channel::{
    deserialize_close_summary_legacy, serialize_close_summary, CLOSED_CHANNEL_BUCKET,
    INVOICE_BUCKET,
};
use crate::codec::{Reader, PUBKEY_SIZE};
use crate::error::Error;
use crate::graph::{
    deserialize_edge_policy, deserialize_lightning_node, update_index_key, CHAN_UPDATE_DIRECTION,
    EDGE_BUCKET, EDGE_INDEX_BUCKET, EDGE_UPDATE_INDEX_BUCKET, NODE_BUCKET,
    NODE_UPDATE_INDEX_BUCKET, UNKNOWN_POLICY,
};
use crate::kvdb::Tx;

/// Invoice add-time series, nested under the invoice bucket.
const INVOICE_ADD_INDEX_BUCKET: &[u8] = b"invoice-add-index";
/// Legacy flat outgoing payment bucket, retired by version 9.
const PAYMENT_BUCKET: &[u8] = b"payment-bucket";
/// Legacy payment status bucket, retired by version 9.
const PAYMENT_STATUS_BUCKET: &[u8] = b"payment-status-bucket";
/// Consolidated payment bucket introduced by version 9.
const PAYMENTS_ROOT_BUCKET: &[u8] = b"payments-bucket";
const PAYMENT_INFO_KEY: &[u8] = b"payment-info";
const PAYMENT_STATUS_KEY: &[u8] = b"payment-status";
/// Gossiper message store bucket.
const MESSAGE_STORE_BUCKET: &[u8] = b"message-store-bucket";

const PAYMENT_STATUS_SUCCEEDED: u8 = 2;

/// CLTV delta stamped onto invoices that predate the field.
const DEFAULT_INVOICE_CLTV_DELTA: u32 = 40;

/// Version 1: rebuild the node and edge update-time indexes from the records
/// themselves.
pub(crate) fn migrate_node_and_edge_update_index(tx: &Tx) -> Result<(), Error> {
    info!("Populating node and edge update indexes");

    let nodes = tx.bucket(NODE_BUCKET)?.ok_or_else(|| Error::corrupt("node bucket not created"))?;
    nodes.delete_bucket_if_exists(NODE_UPDATE_INDEX_BUCKET)?;
    let update_index = nodes.create_bucket_if_not_exists(NODE_UPDATE_INDEX_BUCKET)?;
    for (key, value) in nodes.items()? {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        // the source pointer and other non-node entries are shorter
        if key.len() != PUBKEY_SIZE {
            continue;
        }
        let node = deserialize_lightning_node(&value)?;
        update_index.put(&update_index_key(node.last_update, &key), &[])?;
    }

    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    edges.delete_bucket_if_exists(EDGE_UPDATE_INDEX_BUCKET)?;
    let update_index = edges.create_bucket_if_not_exists(EDGE_UPDATE_INDEX_BUCKET)?;
    for (key, value) in edges.items()? {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        if key.len() != 9 {
            continue;
        }
        let policy = match deserialize_edge_policy(&value)? {
            Some(policy) => policy,
            None => continue,
        };
        update_index.put(&update_index_key(policy.last_update, &key[..8]), &[])?;
    }
    Ok(())
}

/// Version 2: build the invoice add-time series over the existing invoices.
pub(crate) fn migrate_invoice_time_series(tx: &Tx) -> Result<(), Error> {
    let invoices = match tx.bucket(INVOICE_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    info!("Populating invoice add index");
    invoices.delete_bucket_if_exists(INVOICE_ADD_INDEX_BUCKET)?;
    let add_index = invoices.create_bucket_if_not_exists(INVOICE_ADD_INDEX_BUCKET)?;
    let mut seq: u64 = 0;
    for (key, value) in invoices.items()? {
        if value.is_none() {
            continue;
        }
        seq += 1;
        add_index.put(&seq.to_be_bytes(), &key)?;
    }
    Ok(())
}

/// Version 3: outgoing payments gain a leading creation timestamp so the
/// payment time series can be assembled. Historic records are stamped zero.
pub(crate) fn migrate_outgoing_payment_times(tx: &Tx) -> Result<(), Error> {
    let payments = match tx.bucket(PAYMENT_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    let mut rewritten = Vec::new();
    for (key, value) in payments.items()? {
        if let Some(value) = value {
            let mut updated = Vec::with_capacity(value.len() + 8);
            updated.extend_from_slice(&0u64.to_be_bytes());
            updated.extend_from_slice(&value);
            rewritten.push((key, updated));
        }
    }
    for (key, value) in rewritten {
        payments.put(&key, &value)?;
    }
    Ok(())
}

/// Version 4: every known channel carries an entry for both policy
/// directions; a direction the network never announced holds a sentinel.
pub(crate) fn migrate_edge_policies(tx: &Tx) -> Result<(), Error> {
    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    let edge_index = edges
        .bucket(EDGE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge index bucket not created"))?;
    let mut missing = Vec::new();
    for (chan_key, value) in edge_index.items()? {
        if value.is_none() || chan_key.len() != 8 {
            continue;
        }
        for direction in 0..2u8 {
            let mut key = [0u8; 9];
            key[..8].copy_from_slice(&chan_key);
            key[8] = direction & CHAN_UPDATE_DIRECTION;
            if edges.get(&key)?.is_none() {
                missing.push(key);
            }
        }
    }
    info!("Marking {} unannounced policies with the unknown sentinel", missing.len());
    for key in missing {
        edges.put(&key, UNKNOWN_POLICY)?;
    }
    Ok(())
}

/// Version 5: each outgoing payment gains a status record; everything
/// already on disk had completed, so it is marked succeeded.
pub(crate) fn payment_statuses_migration(tx: &Tx) -> Result<(), Error> {
    let statuses = tx.create_bucket_if_not_exists(PAYMENT_STATUS_BUCKET)?;
    let payments = match tx.bucket(PAYMENT_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    for (key, value) in payments.items()? {
        if value.is_some() {
            statuses.put(&key, &[PAYMENT_STATUS_SUCCEEDED])?;
        }
    }
    Ok(())
}

/// Version 6: drop edge update index entries whose channel has left the
/// edge index.
pub(crate) fn migrate_prune_edge_update_index(tx: &Tx) -> Result<(), Error> {
    let edges = tx.bucket(EDGE_BUCKET)?.ok_or_else(|| Error::corrupt("edge bucket not created"))?;
    let edge_index = edges
        .bucket(EDGE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge index bucket not created"))?;
    let update_index = edges
        .bucket(EDGE_UPDATE_INDEX_BUCKET)?
        .ok_or_else(|| Error::corrupt("edge update index bucket not created"))?;

    let mut stale = Vec::new();
    for (key, _value) in update_index.items()? {
        if key.len() != 16 {
            stale.push(key);
            continue;
        }
        if edge_index.get(&key[8..])?.is_none() {
            stale.push(key);
        }
    }
    info!("Pruning {} stale entries from the edge update index", stale.len());
    for key in stale {
        update_index.delete(&key)?;
    }
    Ok(())
}

/// Version 7: close summaries move from the read-to-end optional tail to
/// presence flags in front of every optional field.
pub(crate) fn migrate_optional_channel_close_summary_fields(tx: &Tx) -> Result<(), Error> {
    let closed = match tx.bucket(CLOSED_CHANNEL_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    let mut rewritten = Vec::new();
    for (key, value) in closed.items()? {
        if let Some(value) = value {
            let summary = deserialize_close_summary_legacy(&value)?;
            rewritten.push((key, serialize_close_summary(&summary)));
        }
    }
    info!("Rewriting {} close summaries with optional field flags", rewritten.len());
    for (key, value) in rewritten {
        closed.put(&key, &value)?;
    }
    Ok(())
}

/// Version 8: the gossiper message store is rekeyed so a peer can hold one
/// message per (type, short channel id) instead of one message overall.
pub(crate) fn migrate_gossip_message_store_keys(tx: &Tx) -> Result<(), Error> {
    let store = match tx.bucket(MESSAGE_STORE_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    let mut moves = Vec::new();
    for (key, value) in store.items()? {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        if key.len() != PUBKEY_SIZE {
            continue;
        }
        let mut r = Reader::new(&value);
        let msg_type = r.read_u16()?;
        let short_chan_id = r.read_u64()?;
        let payload = r.remaining().to_vec();

        let mut new_key = key.clone();
        new_key.extend_from_slice(&msg_type.to_be_bytes());
        new_key.extend_from_slice(&short_chan_id.to_be_bytes());
        moves.push((key, new_key, payload));
    }
    for (old_key, new_key, payload) in moves {
        store.delete(&old_key)?;
        store.put(&new_key, &payload)?;
    }
    Ok(())
}

/// Version 9: payments and their statuses are consolidated into one bucket
/// with a sub-bucket per payment.
pub(crate) fn migrate_outgoing_payments(tx: &Tx) -> Result<(), Error> {
    let payments = match tx.bucket(PAYMENT_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    info!("Consolidating payments and payment statuses");
    let statuses = tx.bucket(PAYMENT_STATUS_BUCKET)?;
    let root = tx.create_bucket_if_not_exists(PAYMENTS_ROOT_BUCKET)?;
    for (key, value) in payments.items()? {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        let entry = root.create_bucket_if_not_exists(&key)?;
        entry.put(PAYMENT_INFO_KEY, &value)?;
        let status = match &statuses {
            Some(statuses) => {
                statuses.get(&key)?.unwrap_or_else(|| vec![PAYMENT_STATUS_SUCCEEDED])
            }
            None => vec![PAYMENT_STATUS_SUCCEEDED],
        };
        entry.put(PAYMENT_STATUS_KEY, &status)?;
    }
    tx.delete_bucket_if_exists(PAYMENT_BUCKET)?;
    tx.delete_bucket_if_exists(PAYMENT_STATUS_BUCKET)?;
    Ok(())
}

/// Version 10: stored routes gain the legacy payload marker and an empty
/// TLV record set.
pub(crate) fn migrate_route_serialization(tx: &Tx) -> Result<(), Error> {
    let root = match tx.bucket(PAYMENTS_ROOT_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    for (key, value) in root.items()? {
        if value.is_some() {
            continue;
        }
        let entry = root
            .bucket(&key)?
            .ok_or_else(|| Error::corrupt("payment sub-bucket vanished mid-migration"))?;
        if let Some(info) = entry.get(PAYMENT_INFO_KEY)? {
            let mut updated = info;
            updated.push(1); // legacy payload marker
            updated.extend_from_slice(&0u16.to_be_bytes()); // empty TLV set
            entry.put(PAYMENT_INFO_KEY, &updated)?;
        }
    }
    Ok(())
}

/// Version 11: stored invoices gain an (empty) HTLC set and a CLTV delta.
pub(crate) fn migrate_invoices(tx: &Tx) -> Result<(), Error> {
    let invoices = match tx.bucket(INVOICE_BUCKET)? {
        Some(bucket) => bucket,
        None => return Ok(()),
    };
    let mut rewritten = Vec::new();
    for (key, value) in invoices.items()? {
        if let Some(value) = value {
            let mut updated = value;
            updated.extend_from_slice(&0u16.to_be_bytes());
            updated.extend_from_slice(&DEFAULT_INVOICE_CLTV_DELTA.to_be_bytes());
            rewritten.push((key, updated));
        }
    }
    info!("Stamping {} invoices with HTLC and CLTV delta fields", rewritten.len());
    for (key, value) in rewritten {
        invoices.put(&key, &value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{
        ChannelCloseSummary, ChannelConfig, CloseType, ShortChannelId,
    };
    use crate::codec::{outpoint_key, Writer};
    use crate::graph::{serialize_edge_policy, ChannelEdgePolicy};
    use crate::kvdb::Store;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{Amount, BlockHash, OutPoint, Txid};

    fn test_pubkey(b: u8) -> PublicKey {
        let sk = SecretKey::from_slice(&[b; 32]).unwrap();
        PublicKey::from_secret_key(&Secp256k1::new(), &sk)
    }

    fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn seed_edge_buckets(store: &Store) {
        store
            .update::<_, Error>(|tx| {
                let edges = tx.create_bucket_if_not_exists(EDGE_BUCKET)?;
                edges.create_bucket_if_not_exists(EDGE_INDEX_BUCKET)?;
                edges.create_bucket_if_not_exists(EDGE_UPDATE_INDEX_BUCKET)?;
                Ok(())
            })
            .unwrap();
    }

    fn test_policy(channel_id: u64, last_update: u64) -> ChannelEdgePolicy {
        ChannelEdgePolicy {
            channel_id,
            last_update,
            flags: 0,
            timelock_delta: 40,
            htlc_min_msat: 1000,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
        }
    }

    #[test]
    fn edge_policies_get_sentinels() {
        let (store, _dir) = open_store();
        seed_edge_buckets(&store);
        store
            .update::<_, Error>(|tx| {
                let edges = tx.bucket(EDGE_BUCKET)?.unwrap();
                let edge_index = edges.bucket(EDGE_INDEX_BUCKET)?.unwrap();
                // edge 7 has one announced policy, edge 9 has none
                edge_index.put(&7u64.to_be_bytes(), b"edge-info")?;
                edge_index.put(&9u64.to_be_bytes(), b"edge-info")?;
                let mut key = [0u8; 9];
                key[..8].copy_from_slice(&7u64.to_be_bytes());
                edges.put(&key, &serialize_edge_policy(&test_policy(7, 1000)))?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_edge_policies).unwrap();

        store
            .view::<_, Error>(|tx| {
                let edges = tx.bucket(EDGE_BUCKET)?.unwrap();
                let mut key = [0u8; 9];
                key[..8].copy_from_slice(&7u64.to_be_bytes());
                // the announced policy is untouched
                assert!(deserialize_edge_policy(&edges.get(&key)?.unwrap())?.is_some());
                key[8] = 1;
                assert_eq!(edges.get(&key)?.unwrap(), UNKNOWN_POLICY);
                key[..8].copy_from_slice(&9u64.to_be_bytes());
                key[8] = 0;
                assert_eq!(edges.get(&key)?.unwrap(), UNKNOWN_POLICY);
                key[8] = 1;
                assert_eq!(edges.get(&key)?.unwrap(), UNKNOWN_POLICY);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn stale_update_index_entries_pruned() {
        let (store, _dir) = open_store();
        seed_edge_buckets(&store);
        store
            .update::<_, Error>(|tx| {
                let edges = tx.bucket(EDGE_BUCKET)?.unwrap();
                let edge_index = edges.bucket(EDGE_INDEX_BUCKET)?.unwrap();
                let update_index = edges.bucket(EDGE_UPDATE_INDEX_BUCKET)?.unwrap();
                edge_index.put(&7u64.to_be_bytes(), b"edge-info")?;
                update_index.put(&update_index_key(100, &7u64.to_be_bytes()), &[])?;
                // channel 9 is gone from the edge index
                update_index.put(&update_index_key(200, &9u64.to_be_bytes()), &[])?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_prune_edge_update_index).unwrap();

        store
            .view::<_, Error>(|tx| {
                let edges = tx.bucket(EDGE_BUCKET)?.unwrap();
                let update_index = edges.bucket(EDGE_UPDATE_INDEX_BUCKET)?.unwrap();
                let keys: Vec<Vec<u8>> =
                    update_index.items()?.into_iter().map(|(k, _)| k).collect();
                assert_eq!(keys, vec![update_index_key(100, &7u64.to_be_bytes())]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn legacy_close_summaries_gain_flags() {
        let (store, _dir) = open_store();
        let summary = ChannelCloseSummary {
            chan_point: OutPoint { txid: Txid::from_byte_array([0x10; 32]), vout: 0 },
            short_chan_id: ShortChannelId::default(),
            chain_hash: BlockHash::from_byte_array([0x20; 32]),
            close_height: 1234,
            remote_pub: test_pubkey(2),
            capacity: Amount::from_sat(100_000),
            settled_balance: Amount::from_sat(50_000),
            close_type: CloseType::CooperativeLocal,
            is_pending: false,
            remote_current_revocation: Some(test_pubkey(3)),
            local_chan_cfg: Some(ChannelConfig {
                dust_limit: Amount::from_sat(354),
                chan_reserve: Amount::from_sat(1_000),
                max_pending_amount_msat: 100,
                min_htlc_msat: 1,
                max_accepted_htlcs: 10,
                csv_delay: 144,
            }),
            remote_next_revocation: None,
        };
        // legacy bytes: current format minus the tail, optionals appended raw
        let mut w = Writer::new();
        w.write_outpoint(&summary.chan_point);
        w.write_u64(summary.short_chan_id.to_u64());
        w.write_block_hash(&summary.chain_hash);
        w.write_u32(summary.close_height);
        w.write_pubkey(&summary.remote_pub);
        w.write_u64(summary.capacity.to_sat());
        w.write_u64(summary.settled_balance.to_sat());
        w.write_u8(0); // close type CooperativeLocal
        w.write_bool(false); // is_pending
        let mut legacy = w.into_vec();
        // append optionals without flags
        legacy.extend_from_slice(&summary.remote_current_revocation.unwrap().serialize());
        let cfg = summary.local_chan_cfg.unwrap();
        legacy.extend_from_slice(&cfg.dust_limit.to_sat().to_be_bytes());
        legacy.extend_from_slice(&cfg.chan_reserve.to_sat().to_be_bytes());
        legacy.extend_from_slice(&cfg.max_pending_amount_msat.to_be_bytes());
        legacy.extend_from_slice(&cfg.min_htlc_msat.to_be_bytes());
        legacy.extend_from_slice(&cfg.max_accepted_htlcs.to_be_bytes());
        legacy.extend_from_slice(&cfg.csv_delay.to_be_bytes());

        store
            .update::<_, Error>(|tx| {
                let closed = tx.create_bucket_if_not_exists(CLOSED_CHANNEL_BUCKET)?;
                closed.put(&outpoint_key(&summary.chan_point), &legacy)?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_optional_channel_close_summary_fields).unwrap();

        store
            .view::<_, Error>(|tx| {
                let closed = tx.bucket(CLOSED_CHANNEL_BUCKET)?.unwrap();
                let bytes = closed.get(&outpoint_key(&summary.chan_point))?.unwrap();
                let decoded = crate::channel::deserialize_close_summary(&bytes)?;
                assert_eq!(decoded, summary);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn gossip_store_rekeyed() {
        let (store, _dir) = open_store();
        let peer = test_pubkey(5).serialize();
        let mut value = Vec::new();
        value.extend_from_slice(&258u16.to_be_bytes()); // announcement type
        value.extend_from_slice(&77u64.to_be_bytes()); // short channel id
        value.extend_from_slice(b"payload");

        store
            .update::<_, Error>(|tx| {
                let bucket = tx.create_bucket_if_not_exists(MESSAGE_STORE_BUCKET)?;
                bucket.put(&peer, &value)?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_gossip_message_store_keys).unwrap();

        store
            .view::<_, Error>(|tx| {
                let bucket = tx.bucket(MESSAGE_STORE_BUCKET)?.unwrap();
                assert!(bucket.get(&peer)?.is_none());
                let mut new_key = peer.to_vec();
                new_key.extend_from_slice(&258u16.to_be_bytes());
                new_key.extend_from_slice(&77u64.to_be_bytes());
                assert_eq!(bucket.get(&new_key)?.unwrap(), b"payload");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn payments_consolidated_with_statuses() {
        let (store, _dir) = open_store();
        store
            .update::<_, Error>(|tx| {
                let payments = tx.create_bucket_if_not_exists(PAYMENT_BUCKET)?;
                payments.put(&1u64.to_be_bytes(), b"payment-one")?;
                payments.put(&2u64.to_be_bytes(), b"payment-two")?;
                let statuses = tx.create_bucket_if_not_exists(PAYMENT_STATUS_BUCKET)?;
                statuses.put(&1u64.to_be_bytes(), &[1])?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_outgoing_payments).unwrap();

        store
            .view::<_, Error>(|tx| {
                assert!(tx.bucket(PAYMENT_BUCKET)?.is_none());
                assert!(tx.bucket(PAYMENT_STATUS_BUCKET)?.is_none());
                let root = tx.bucket(PAYMENTS_ROOT_BUCKET)?.unwrap();
                let one = root.bucket(&1u64.to_be_bytes())?.unwrap();
                assert_eq!(one.get(PAYMENT_INFO_KEY)?.unwrap(), b"payment-one");
                assert_eq!(one.get(PAYMENT_STATUS_KEY)?.unwrap(), vec![1]);
                let two = root.bucket(&2u64.to_be_bytes())?.unwrap();
                // no explicit status meant the payment had completed
                assert_eq!(two.get(PAYMENT_STATUS_KEY)?.unwrap(), vec![PAYMENT_STATUS_SUCCEEDED]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn invoices_extended_in_place() {
        let (store, _dir) = open_store();
        store
            .update::<_, Error>(|tx| {
                let invoices = tx.create_bucket_if_not_exists(INVOICE_BUCKET)?;
                invoices.put(b"inv1", b"invoice-bytes")?;
                Ok(())
            })
            .unwrap();

        store.update(migrate_invoice_time_series).unwrap();
        store.update(migrate_invoices).unwrap();

        store
            .view::<_, Error>(|tx| {
                let invoices = tx.bucket(INVOICE_BUCKET)?.unwrap();
                let add_index = invoices.bucket(INVOICE_ADD_INDEX_BUCKET)?.unwrap();
                assert_eq!(add_index.get(&1u64.to_be_bytes())?.unwrap(), b"inv1");
                let mut expected = b"invoice-bytes".to_vec();
                expected.extend_from_slice(&0u16.to_be_bytes());
                expected.extend_from_slice(&DEFAULT_INVOICE_CLTV_DELTA.to_be_bytes());
                assert_eq!(invoices.get(b"inv1")?.unwrap(), expected);
                Ok(())
            })
            .unwrap();
    }
}

//! The schema version record and the migration registry.

use crate::error::Error;
use crate::kvdb::Tx;
use crate::migrations;

/// Top-level bucket holding the singleton version record.
pub(crate) const META_BUCKET: &[u8] = b"meta-bucket";
const DB_VERSION_KEY: &[u8] = b"version";

/// Singleton database metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub db_version_number: u32,
}

/// A function mutating the key/bucket structure of an outdated database
/// towards its target version. Pure over the stored bytes: no I/O besides
/// the transaction, no wall clock.
pub(crate) type Migration = fn(&Tx) -> Result<(), Error>;

/// One slot of the migration registry.
pub(crate) struct Version {
    pub number: u32,
    pub migration: Option<Migration>,
}

/// Every schema version this build knows, in ascending order. The list is
/// append-only; version 0 is the base layout and carries no migration.
pub(crate) static DB_VERSIONS: [Version; 12] = [
    Version { number: 0, migration: None },
    // Indexes over the update time of node and channel updates.
    Version { number: 1, migration: Some(migrations::migrate_node_and_edge_update_index) },
    // The invoice add-time series.
    Version { number: 2, migration: Some(migrations::migrate_invoice_time_series) },
    // Outgoing payments rewritten to carry their creation time.
    Version { number: 3, migration: Some(migrations::migrate_outgoing_payment_times) },
    // Every channel carries two policy entries, unknown ones as a sentinel.
    Version { number: 4, migration: Some(migrations::migrate_edge_policies) },
    // Per-payment status records.
    Version { number: 5, migration: Some(migrations::payment_statuses_migration) },
    // Stale entries pruned from the edge update index.
    Version { number: 6, migration: Some(migrations::migrate_prune_edge_update_index) },
    // Close summaries with presence flags for optional fields.
    Version {
        number: 7,
        migration: Some(migrations::migrate_optional_channel_close_summary_fields),
    },
    // Gossip message store rekeyed by message type and short channel id.
    Version { number: 8, migration: Some(migrations::migrate_gossip_message_store_keys) },
    // Payments and their statuses consolidated into one bucket.
    Version { number: 9, migration: Some(migrations::migrate_outgoing_payments) },
    // Routes extended with legacy payload flags and TLV records.
    Version { number: 10, migration: Some(migrations::migrate_route_serialization) },
    // Invoices extended with HTLC and CLTV delta fields.
    Version { number: 11, migration: Some(migrations::migrate_invoices) },
];

pub(crate) fn latest_db_version(versions: &[Version]) -> u32 {
    versions.last().map(|v| v.number).unwrap_or(0)
}

/// The registry entries with a number strictly greater than `version`, in
/// ascending order.
pub(crate) fn migrations_to_apply<'a>(
    versions: &'a [Version],
    version: u32,
) -> Vec<&'a Version> {
    versions.iter().filter(|v| v.number > version).collect()
}

/// Read the meta record. `MetaNotFound` when the bucket or record is absent.
pub(crate) fn fetch_meta(tx: &Tx) -> Result<Meta, Error> {
    let meta_bucket = tx.bucket(META_BUCKET)?.ok_or(Error::MetaNotFound)?;
    let bytes = meta_bucket.get(DB_VERSION_KEY)?.ok_or(Error::MetaNotFound)?;
    let arr: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::codec("version record is not four bytes"))?;
    Ok(Meta { db_version_number: u32::from_be_bytes(arr) })
}

/// Write the meta record, creating its bucket when needed.
pub(crate) fn put_meta(tx: &Tx, meta: &Meta) -> Result<(), Error> {
    let meta_bucket = tx.create_bucket_if_not_exists(META_BUCKET)?;
    meta_bucket.put(DB_VERSION_KEY, &meta.db_version_number.to_be_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_ascending_and_dense() {
        for (i, version) in DB_VERSIONS.iter().enumerate() {
            assert_eq!(version.number, i as u32);
        }
        assert_eq!(latest_db_version(&DB_VERSIONS), 11);
    }

    #[test]
    fn migrations_to_apply_selects_strictly_greater() {
        let picked = migrations_to_apply(&DB_VERSIONS, 3);
        let numbers: Vec<u32> = picked.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![4, 5, 6, 7, 8, 9, 10, 11]);
        assert!(migrations_to_apply(&DB_VERSIONS, 11).is_empty());
    }
}

//! Channel records, close summaries and their on-disk forms.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, BlockHash, OutPoint};

use crate::codec::{outpoint_key, Reader, Writer};
use crate::error::Error;
use crate::kvdb::Bucket;

/// Top-level bucket holding the open channel tree:
/// peer pubkey -> chain hash -> outpoint -> channel fields.
pub(crate) const OPEN_CHANNEL_BUCKET: &[u8] = b"open-chan-bucket";
/// Top-level bucket mapping outpoint keys to close summaries.
pub(crate) const CLOSED_CHANNEL_BUCKET: &[u8] = b"closed-channel-bucket";
/// Created on init for the forwarding log collaborator.
pub(crate) const FWD_LOG_BUCKET: &[u8] = b"fwd-log-bucket";
/// Created on init for the forwarding package collaborator.
pub(crate) const FWD_PACKAGES_BUCKET: &[u8] = b"fwd-packages";
/// Created on init for the invoice store collaborator.
pub(crate) const INVOICE_BUCKET: &[u8] = b"invoice-bucket";

const CHAN_INFO_KEY: &[u8] = b"chan-info";
const CHAN_COMMITMENT_KEY: &[u8] = b"chan-commitment";
const CHAN_REVOCATION_STATE_KEY: &[u8] = b"chan-revocation-state";

/// The on-chain locator of a confirmed channel, packed into eight bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub tx_position: u16,
}

impl ShortChannelId {
    pub fn to_u64(&self) -> u64 {
        ((self.block_height as u64 & 0xff_ffff) << 40)
            | ((self.tx_index as u64 & 0xff_ffff) << 16)
            | self.tx_position as u64
    }

    pub fn from_u64(v: u64) -> Self {
        ShortChannelId {
            block_height: (v >> 40) as u32,
            tx_index: ((v >> 16) & 0xff_ffff) as u32,
            tx_position: (v & 0xffff) as u16,
        }
    }

    /// Big-endian key form, ordered by confirmation coordinates.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.to_u64().to_be_bytes()
    }
}

/// The funding-derived 32-byte channel identifier: the funding txid with its
/// last two bytes XOR-ed with the big-endian output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn from_outpoint(op: &OutPoint) -> Self {
        let mut bytes = op.txid.to_byte_array();
        let index = op.vout as u16;
        bytes[30] ^= (index >> 8) as u8;
        bytes[31] ^= (index & 0xff) as u8;
        ChannelId(bytes)
    }

    /// Whether this channel id was derived from the given channel point.
    pub fn is_chan_point(&self, op: &OutPoint) -> bool {
        Self::from_outpoint(op) == *self
    }
}

/// Status bitset of an open channel. Any bit other than the default means
/// the channel is waiting to be closed. Bits are only ever OR-ed in, so a
/// restored channel keeps reporting every bit ever set on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus(u8);

impl ChannelStatus {
    /// The channel is fully operational.
    pub const DEFAULT: ChannelStatus = ChannelStatus(0);
    /// An unrecoverable state hit during channel operation.
    pub const BORKED: ChannelStatus = ChannelStatus(1);
    /// A commitment transaction was broadcast to close the channel.
    pub const COMMIT_BROADCASTED: ChannelStatus = ChannelStatus(1 << 1);
    /// Local state was lost and the remote commitment point is needed.
    pub const LOCAL_DATA_LOSS: ChannelStatus = ChannelStatus(1 << 2);
    /// The channel was restored from an external shell and must not be used
    /// for normal operation.
    pub const RESTORED: ChannelStatus = ChannelStatus(1 << 3);

    pub fn is_default(&self) -> bool {
        self.0 == 0
    }

    pub fn has(&self, status: ChannelStatus) -> bool {
        self.0 & status.0 != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        ChannelStatus(bits)
    }
}

impl BitOr for ChannelStatus {
    type Output = ChannelStatus;

    fn bitor(self, rhs: ChannelStatus) -> ChannelStatus {
        ChannelStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChannelStatus {
    fn bitor_assign(&mut self, rhs: ChannelStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            return write!(f, "Default");
        }
        let names = [
            (ChannelStatus::BORKED, "Borked"),
            (ChannelStatus::COMMIT_BROADCASTED, "CommitBroadcasted"),
            (ChannelStatus::LOCAL_DATA_LOSS, "LocalDataLoss"),
            (ChannelStatus::RESTORED, "Restored"),
        ];
        let mut first = true;
        for (status, name) in names {
            if self.has(status) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The constraint set we demanded of the remote party for our commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub dust_limit: Amount,
    pub chan_reserve: Amount,
    pub max_pending_amount_msat: u64,
    pub min_htlc_msat: u64,
    pub max_accepted_htlcs: u16,
    pub csv_delay: u16,
}

/// The latest commitment state of one side of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCommitment {
    pub commit_height: u64,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub fee_per_kw: u64,
}

/// A bilateral payment channel identified by its funding outpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenChannel {
    /// Hash of the genesis block of the chain the channel lives on.
    pub chain_hash: BlockHash,
    /// The channel's identity: the funding transaction output.
    pub funding_outpoint: OutPoint,
    /// Confirmation coordinates, derived once the funding confirms.
    pub short_channel_id: ShortChannelId,
    /// True until the funding transaction has confirmed.
    pub is_pending: bool,
    pub chan_status: ChannelStatus,
    /// The remote peer's identity key.
    pub identity_pub: PublicKey,
    pub capacity: Amount,
    pub local_chan_cfg: ChannelConfig,
    pub local_commitment: ChannelCommitment,
    pub remote_current_revocation: Option<PublicKey>,
    pub remote_next_revocation: Option<PublicKey>,
}

impl OpenChannel {
    pub fn chan_status(&self) -> ChannelStatus {
        self.chan_status
    }

    /// The local balance of the latest commitment, in whole satoshis.
    pub fn settled_balance(&self) -> Amount {
        Amount::from_sat(self.local_commitment.local_balance_msat / 1000)
    }
}

/// A minimal channel plus the addresses its peer was last reachable at,
/// used to seed recovery of on-disk state.
#[derive(Debug, Clone)]
pub struct ChannelShell {
    pub node_addrs: Vec<SocketAddr>,
    pub chan: OpenChannel,
}

/// How a channel left the open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    CooperativeLocal,
    CooperativeRemote,
    LocalForceClose,
    RemoteForceClose,
    BreachClose,
    FundingCanceled,
    Abandoned,
}

impl CloseType {
    fn to_u8(self) -> u8 {
        match self {
            CloseType::CooperativeLocal => 0,
            CloseType::CooperativeRemote => 1,
            CloseType::LocalForceClose => 2,
            CloseType::RemoteForceClose => 3,
            CloseType::BreachClose => 4,
            CloseType::FundingCanceled => 5,
            CloseType::Abandoned => 6,
        }
    }

    fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(CloseType::CooperativeLocal),
            1 => Ok(CloseType::CooperativeRemote),
            2 => Ok(CloseType::LocalForceClose),
            3 => Ok(CloseType::RemoteForceClose),
            4 => Ok(CloseType::BreachClose),
            5 => Ok(CloseType::FundingCanceled),
            6 => Ok(CloseType::Abandoned),
            n => Err(Error::codec(format!("unknown close type {}", n))),
        }
    }
}

/// The record written when a channel moves to the closed tree. `is_pending`
/// stays true on a force close until all funds are swept, and on a
/// cooperative close until its single confirmation arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCloseSummary {
    pub chan_point: OutPoint,
    pub short_chan_id: ShortChannelId,
    pub chain_hash: BlockHash,
    pub close_height: u32,
    pub remote_pub: PublicKey,
    pub capacity: Amount,
    pub settled_balance: Amount,
    pub close_type: CloseType,
    pub is_pending: bool,
    pub remote_current_revocation: Option<PublicKey>,
    pub local_chan_cfg: Option<ChannelConfig>,
    pub remote_next_revocation: Option<PublicKey>,
}

fn write_channel_config(w: &mut Writer, cfg: &ChannelConfig) {
    w.write_u64(cfg.dust_limit.to_sat());
    w.write_u64(cfg.chan_reserve.to_sat());
    w.write_u64(cfg.max_pending_amount_msat);
    w.write_u64(cfg.min_htlc_msat);
    w.write_u16(cfg.max_accepted_htlcs);
    w.write_u16(cfg.csv_delay);
}

fn read_channel_config(r: &mut Reader) -> Result<ChannelConfig, Error> {
    Ok(ChannelConfig {
        dust_limit: Amount::from_sat(r.read_u64()?),
        chan_reserve: Amount::from_sat(r.read_u64()?),
        max_pending_amount_msat: r.read_u64()?,
        min_htlc_msat: r.read_u64()?,
        max_accepted_htlcs: r.read_u16()?,
        csv_delay: r.read_u16()?,
    })
}

fn write_opt_pubkey(w: &mut Writer, key: &Option<PublicKey>) {
    match key {
        Some(key) => {
            w.write_bool(true);
            w.write_pubkey(key);
        }
        None => w.write_bool(false),
    }
}

fn read_opt_pubkey(r: &mut Reader) -> Result<Option<PublicKey>, Error> {
    if r.read_bool()? {
        Ok(Some(r.read_pubkey()?))
    } else {
        Ok(None)
    }
}

fn serialize_chan_info(channel: &OpenChannel) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_block_hash(&channel.chain_hash);
    w.write_outpoint(&channel.funding_outpoint);
    w.write_u64(channel.short_channel_id.to_u64());
    w.write_bool(channel.is_pending);
    w.write_u8(channel.chan_status.bits());
    w.write_pubkey(&channel.identity_pub);
    w.write_u64(channel.capacity.to_sat());
    write_channel_config(&mut w, &channel.local_chan_cfg);
    w.into_vec()
}

fn serialize_chan_commitment(commit: &ChannelCommitment) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u64(commit.commit_height);
    w.write_u64(commit.local_balance_msat);
    w.write_u64(commit.remote_balance_msat);
    w.write_u64(commit.fee_per_kw);
    w.into_vec()
}

fn serialize_revocation_state(channel: &OpenChannel) -> Vec<u8> {
    let mut w = Writer::new();
    write_opt_pubkey(&mut w, &channel.remote_current_revocation);
    write_opt_pubkey(&mut w, &channel.remote_next_revocation);
    w.into_vec()
}

/// Write all parts of a channel record into its leaf bucket.
pub(crate) fn put_open_channel(chan_bucket: &Bucket, channel: &OpenChannel) -> Result<(), Error> {
    chan_bucket.put(CHAN_INFO_KEY, &serialize_chan_info(channel))?;
    chan_bucket.put(CHAN_COMMITMENT_KEY, &serialize_chan_commitment(&channel.local_commitment))?;
    chan_bucket.put(CHAN_REVOCATION_STATE_KEY, &serialize_revocation_state(channel))?;
    Ok(())
}

/// Assemble a channel record from its leaf bucket.
pub(crate) fn fetch_open_channel(
    chan_bucket: &Bucket,
    chan_point: &OutPoint,
) -> Result<OpenChannel, Error> {
    let info = chan_bucket
        .get(CHAN_INFO_KEY)?
        .ok_or_else(|| Error::corrupt("channel bucket has no info record"))?;
    let mut r = Reader::new(&info);
    let chain_hash = r.read_block_hash()?;
    let funding_outpoint = r.read_outpoint()?;
    if funding_outpoint != *chan_point {
        return Err(Error::corrupt("channel info outpoint does not match its key"));
    }
    let short_channel_id = ShortChannelId::from_u64(r.read_u64()?);
    let is_pending = r.read_bool()?;
    let chan_status = ChannelStatus::from_bits(r.read_u8()?);
    let identity_pub = r.read_pubkey()?;
    let capacity = Amount::from_sat(r.read_u64()?);
    let local_chan_cfg = read_channel_config(&mut r)?;

    let commit = chan_bucket
        .get(CHAN_COMMITMENT_KEY)?
        .ok_or_else(|| Error::corrupt("channel bucket has no commitment record"))?;
    let mut r = Reader::new(&commit);
    let local_commitment = ChannelCommitment {
        commit_height: r.read_u64()?,
        local_balance_msat: r.read_u64()?,
        remote_balance_msat: r.read_u64()?,
        fee_per_kw: r.read_u64()?,
    };

    let revocation = chan_bucket
        .get(CHAN_REVOCATION_STATE_KEY)?
        .ok_or_else(|| Error::corrupt("channel bucket has no revocation record"))?;
    let mut r = Reader::new(&revocation);
    let remote_current_revocation = read_opt_pubkey(&mut r)?;
    let remote_next_revocation = read_opt_pubkey(&mut r)?;

    Ok(OpenChannel {
        chain_hash,
        funding_outpoint,
        short_channel_id,
        is_pending,
        chan_status,
        identity_pub,
        capacity,
        local_chan_cfg,
        local_commitment,
        remote_current_revocation,
        remote_next_revocation,
    })
}

/// Serialize a close summary: fixed-position fields followed by a
/// presence-flag-gated tail of optional fields.
pub(crate) fn serialize_close_summary(summary: &ChannelCloseSummary) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_outpoint(&summary.chan_point);
    w.write_u64(summary.short_chan_id.to_u64());
    w.write_block_hash(&summary.chain_hash);
    w.write_u32(summary.close_height);
    w.write_pubkey(&summary.remote_pub);
    w.write_u64(summary.capacity.to_sat());
    w.write_u64(summary.settled_balance.to_sat());
    w.write_u8(summary.close_type.to_u8());
    w.write_bool(summary.is_pending);

    write_opt_pubkey(&mut w, &summary.remote_current_revocation);
    match &summary.local_chan_cfg {
        Some(cfg) => {
            w.write_bool(true);
            write_channel_config(&mut w, cfg);
        }
        None => w.write_bool(false),
    }
    write_opt_pubkey(&mut w, &summary.remote_next_revocation);
    w.into_vec()
}

fn read_close_summary_fixed(r: &mut Reader) -> Result<ChannelCloseSummary, Error> {
    Ok(ChannelCloseSummary {
        chan_point: r.read_outpoint()?,
        short_chan_id: ShortChannelId::from_u64(r.read_u64()?),
        chain_hash: r.read_block_hash()?,
        close_height: r.read_u32()?,
        remote_pub: r.read_pubkey()?,
        capacity: Amount::from_sat(r.read_u64()?),
        settled_balance: Amount::from_sat(r.read_u64()?),
        close_type: CloseType::from_u8(r.read_u8()?)?,
        is_pending: r.read_bool()?,
        remote_current_revocation: None,
        local_chan_cfg: None,
        remote_next_revocation: None,
    })
}

/// Decode a close summary in the current presence-flag format.
pub(crate) fn deserialize_close_summary(bytes: &[u8]) -> Result<ChannelCloseSummary, Error> {
    let mut r = Reader::new(bytes);
    let mut summary = read_close_summary_fixed(&mut r)?;
    summary.remote_current_revocation = read_opt_pubkey(&mut r)?;
    if r.read_bool()? {
        summary.local_chan_cfg = Some(read_channel_config(&mut r)?);
    }
    summary.remote_next_revocation = read_opt_pubkey(&mut r)?;
    Ok(summary)
}

/// Decode a close summary in the legacy format, where optional fields were
/// appended without presence flags and readers consumed until end of record.
pub(crate) fn deserialize_close_summary_legacy(
    bytes: &[u8],
) -> Result<ChannelCloseSummary, Error> {
    let mut r = Reader::new(bytes);
    let mut summary = read_close_summary_fixed(&mut r)?;
    if !r.is_empty() {
        summary.remote_current_revocation = Some(r.read_pubkey()?);
    }
    if !r.is_empty() {
        summary.local_chan_cfg = Some(read_channel_config(&mut r)?);
    }
    if !r.is_empty() {
        summary.remote_next_revocation = Some(r.read_pubkey()?);
    }
    Ok(summary)
}

/// The closed-bucket key of a summary.
pub(crate) fn close_summary_key(summary: &ChannelCloseSummary) -> [u8; 36] {
    outpoint_key(&summary.chan_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::Txid;

    pub(crate) fn test_pubkey(b: u8) -> PublicKey {
        let sk = SecretKey::from_slice(&[b; 32]).unwrap();
        PublicKey::from_secret_key(&Secp256k1::new(), &sk)
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            dust_limit: Amount::from_sat(354),
            chan_reserve: Amount::from_sat(10_000),
            max_pending_amount_msat: 990_000_000,
            min_htlc_msat: 1_000,
            max_accepted_htlcs: 483,
            csv_delay: 144,
        }
    }

    fn test_summary() -> ChannelCloseSummary {
        ChannelCloseSummary {
            chan_point: OutPoint { txid: Txid::from_byte_array([0x11; 32]), vout: 1 },
            short_chan_id: ShortChannelId { block_height: 500_000, tx_index: 1024, tx_position: 3 },
            chain_hash: BlockHash::from_byte_array([0x22; 32]),
            close_height: 501_000,
            remote_pub: test_pubkey(2),
            capacity: Amount::from_sat(1_000_000),
            settled_balance: Amount::from_sat(400_000),
            close_type: CloseType::RemoteForceClose,
            is_pending: true,
            remote_current_revocation: Some(test_pubkey(3)),
            local_chan_cfg: Some(test_config()),
            remote_next_revocation: Some(test_pubkey(4)),
        }
    }

    #[test]
    fn short_channel_id_roundtrip() {
        let scid = ShortChannelId { block_height: 654_321, tx_index: 2_000, tx_position: 5 };
        assert_eq!(ShortChannelId::from_u64(scid.to_u64()), scid);
        // big-endian key form sorts by block height first
        let earlier = ShortChannelId { block_height: 654_320, tx_index: 9_999, tx_position: 9 };
        assert!(earlier.to_bytes() < scid.to_bytes());
    }

    #[test]
    fn channel_id_matches_its_outpoint() {
        let txid = Txid::from_byte_array([0x5a; 32]);
        let op = OutPoint { txid, vout: 0x0102 };
        let cid = ChannelId::from_outpoint(&op);
        assert!(cid.is_chan_point(&op));
        assert!(!cid.is_chan_point(&OutPoint { txid, vout: 0 }));
        // the first 30 bytes are shared with the outpoint key
        assert_eq!(cid.0[..30], outpoint_key(&op)[..30]);
    }

    #[test]
    fn status_bits_accumulate() {
        let mut status = ChannelStatus::DEFAULT;
        assert!(status.is_default());
        status |= ChannelStatus::COMMIT_BROADCASTED;
        status |= ChannelStatus::RESTORED;
        assert!(!status.is_default());
        assert!(status.has(ChannelStatus::COMMIT_BROADCASTED));
        assert!(status.has(ChannelStatus::RESTORED));
        assert!(!status.has(ChannelStatus::BORKED));
        assert_eq!(status.to_string(), "CommitBroadcasted|Restored");
    }

    #[test]
    fn close_summary_roundtrip() {
        let summary = test_summary();
        let bytes = serialize_close_summary(&summary);
        assert_eq!(deserialize_close_summary(&bytes).unwrap(), summary);
    }

    #[test]
    fn close_summary_roundtrip_without_optionals() {
        let mut summary = test_summary();
        summary.remote_current_revocation = None;
        summary.local_chan_cfg = None;
        summary.remote_next_revocation = None;
        let bytes = serialize_close_summary(&summary);
        assert_eq!(deserialize_close_summary(&bytes).unwrap(), summary);
    }

    #[test]
    fn close_summary_rejects_bad_close_type() {
        let mut bytes = serialize_close_summary(&test_summary());
        // the close type byte sits after outpoint, scid, chain hash, height,
        // pubkey, capacity and settled balance
        let off = 36 + 8 + 32 + 4 + 33 + 8 + 8;
        bytes[off] = 0x7f;
        assert!(matches!(deserialize_close_summary(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn legacy_close_summary_reads_to_eof() {
        let summary = test_summary();
        // legacy form: fixed fields, then optionals appended without flags
        let mut w = Writer::new();
        w.write_outpoint(&summary.chan_point);
        w.write_u64(summary.short_chan_id.to_u64());
        w.write_block_hash(&summary.chain_hash);
        w.write_u32(summary.close_height);
        w.write_pubkey(&summary.remote_pub);
        w.write_u64(summary.capacity.to_sat());
        w.write_u64(summary.settled_balance.to_sat());
        w.write_u8(summary.close_type.to_u8());
        w.write_bool(summary.is_pending);
        w.write_pubkey(summary.remote_current_revocation.as_ref().unwrap());
        write_channel_config(&mut w, summary.local_chan_cfg.as_ref().unwrap());
        w.write_pubkey(summary.remote_next_revocation.as_ref().unwrap());

        let decoded = deserialize_close_summary_legacy(&w.into_vec()).unwrap();
        assert_eq!(decoded, summary);

        // and a record that stops after the fixed fields
        let mut w = Writer::new();
        w.write_outpoint(&summary.chan_point);
        w.write_u64(summary.short_chan_id.to_u64());
        w.write_block_hash(&summary.chain_hash);
        w.write_u32(summary.close_height);
        w.write_pubkey(&summary.remote_pub);
        w.write_u64(summary.capacity.to_sat());
        w.write_u64(summary.settled_balance.to_sat());
        w.write_u8(summary.close_type.to_u8());
        w.write_bool(summary.is_pending);
        let decoded = deserialize_close_summary_legacy(&w.into_vec()).unwrap();
        assert!(decoded.remote_current_revocation.is_none());
        assert!(decoded.local_chan_cfg.is_none());
        assert!(decoded.remote_next_revocation.is_none());
    }
}

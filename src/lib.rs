//! The channel state store of a Lightning payment node: a single-file,
//! crash-safe, versioned database holding the authoritative state of every
//! bilateral channel, the peer address book derived from them, and the
//! narrow graph surface used when channels are restored from backup shells.
//!
//! All mutations enter through [`DB`], run inside one serializable
//! read-write transaction on the backing store, and either commit as a
//! whole or leave the file untouched.

mod channel;
mod codec;
mod db;
mod error;
mod graph;
pub mod kvdb;
mod meta;
mod migrations;
mod nodes;
pub mod util;

pub use channel::{
    ChannelCloseSummary, ChannelCommitment, ChannelConfig, ChannelId, ChannelShell,
    ChannelStatus, CloseType, OpenChannel, ShortChannelId,
};
pub use db::{Options, DB, DB_NAME, DEFAULT_CHANNEL_CACHE_SIZE, DEFAULT_REJECT_CACHE_SIZE};
pub use error::Error;
pub use graph::{
    ChannelEdge, ChannelEdgeInfo, ChannelEdgePolicy, ChannelGraph, LightningNode,
    CHAN_UPDATE_DIRECTION,
};
pub use meta::Meta;
pub use nodes::LinkNode;
pub use util::clock::{Clock, ManualClock, StandardClock};

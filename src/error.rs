use thiserror::Error;

use crate::kvdb::StoreError;

/// Errors returned by the channel state store.
#[derive(Debug, Error)]
pub enum Error {
    /// A channel point lookup walked the whole open channel tree without a
    /// match.
    #[error("channel not found")]
    ChannelNotFound,

    /// The open channel bucket is missing entirely.
    #[error("no active channels exist")]
    NoActiveChannels,

    /// A closed channel summary lookup missed.
    #[error("unable to find closed channel summary")]
    ClosedChannelNotFound,

    /// The closed channel bucket is missing entirely.
    #[error("no closed channels exist")]
    NoClosedChannels,

    /// A link node lookup missed.
    #[error("link node with target identity not found")]
    LinkNodeNotFound,

    /// The graph node tree is missing entirely.
    #[error("graph not found")]
    GraphNotFound,

    /// A graph node lookup missed.
    #[error("unable to find graph node")]
    GraphNodeNotFound,

    /// The self node of the graph has not been set.
    #[error("source node does not exist")]
    SourceNodeNotSet,

    /// An edge for the channel id is already present in the edge index.
    #[error("edge already exists")]
    EdgeAlreadyExist,

    /// An edge lookup missed.
    #[error("edge not found")]
    EdgeNotFound,

    /// The meta bucket holds no version record.
    #[error("unable to locate meta information")]
    MetaNotFound,

    /// The stored schema version is newer than this build understands.
    #[error("refusing to revert database from version {stored} to version {latest}")]
    DbReversion { stored: u32, latest: u32 },

    /// A bucket that the schema requires was absent mid-traversal.
    #[error("corrupted database: {0}")]
    CorruptedDb(String),

    /// Record bytes were truncated or held an out-of-range enumeration.
    #[error("codec error: {0}")]
    Codec(String),

    /// Fault propagated from the backing store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptedDb(msg.into())
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }
}

//! Error of ringstore

/// A wrap `Result` contains custom errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors collections in ringstore.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Outbound request exceeded its deadline")]
    Timeout,

    #[error("Peer is down")]
    PeerDown,

    #[error("No routing candidate for key")]
    NoRoute,

    #[error("Key does not exist in database")]
    NotFound,

    #[error("Key already exists in database")]
    DuplicateKey,

    #[error("Key is not stored on this peer")]
    OutOfRange,

    #[error("Fewer than {0} successors available to place fragments")]
    InsufficientReplicas(usize),

    #[error("Fewer than {0} distinct fragments collected")]
    InsufficientFragments(usize),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid hexadecimal key")]
    KeyParse(#[from] hex::FromHexError),

    #[error("Invalid peer descriptor: {0}")]
    PeerParse(String),

    #[error("JSON serialization error")]
    Serialize(#[source] serde_json::Error),

    #[error("JSON deserialization error")]
    Deserialize(#[source] serde_json::Error),

    #[error("Remote peer reported failure: {0}")]
    Remote(String),

    #[error("Merkle tree has no node at the requested position")]
    NoNodeAtPosition,

    #[error("Failed to read successors")]
    FailedToReadSuccessors,

    #[error("Failed to write successors")]
    FailedToWriteSuccessors,

    #[error("Failed to lock finger table")]
    FingerLockFailed,

    #[error("Failed to lock database index")]
    DatabaseLockFailed,

    #[error("Failed to lock ring state")]
    RingStateLockFailed,

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

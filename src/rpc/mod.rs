//! Request and response types of the wire protocol.
//!
//! Every request carries a `COMMAND` tag; every response is wrapped in an
//! envelope carrying `SUCCESS` and, on failure, `ERRORS`. One request and
//! one response travel per TCP connection.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::store::WireNode;

pub mod client;
pub mod server;

pub use server::RpcServer;
pub use server::RpcService;

/// Key-value pairs in wire form, keyed by hex ring id.
pub type KeyMap = BTreeMap<Key, serde_json::Value>;

/// Ask a gateway to admit a new peer to the ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    /// Descriptor of the joining peer.
    #[serde(rename = "NEW_PEER")]
    pub new_peer: RemotePeer,
}

/// Response to [`JoinRequest`], naming the joiner's predecessor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinResponse {
    #[serde(rename = "PREDECESSOR")]
    pub predecessor: RemotePeer,
}

/// Assert that the sender may be the recipient's predecessor or a relevant
/// successor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyRequest {
    #[serde(rename = "NEW_PEER")]
    pub new_peer: RemotePeer,
}

/// Response to [`NotifyRequest`]. When the notifier became the recipient's
/// predecessor, carries the keys it must now own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyResponse {
    #[serde(
        rename = "KEYS_TO_ABSORB",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub keys_to_absorb: KeyMap,
}

/// Graceful departure notice sent to predecessors and the immediate
/// successor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaveRequest {
    #[serde(rename = "LEAVING_ID")]
    pub leaving_id: Key,
    #[serde(rename = "NEW_PRED")]
    pub new_pred: RemotePeer,
    #[serde(rename = "NEW_MIN")]
    pub new_min: Key,
    #[serde(
        rename = "KEYS_TO_ABSORB",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub keys_to_absorb: KeyMap,
    #[serde(rename = "NEW_SUCC", default, skip_serializing_if = "Option::is_none")]
    pub new_succ: Option<RemotePeer>,
}

/// Find the peer succeeding a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetSuccRequest {
    #[serde(rename = "KEY")]
    pub key: Key,
}

/// Find the peer preceding a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetPredRequest {
    #[serde(rename = "KEY")]
    pub key: Key,
}

/// Instruct a peer to store a key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateKeyRequest {
    #[serde(rename = "KEY")]
    pub key: Key,
    #[serde(rename = "VALUE")]
    pub value: serde_json::Value,
}

/// Instruct a peer to return the value of a key it holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadKeyRequest {
    #[serde(rename = "KEY")]
    pub key: Key,
}

/// Response carrying a single stored value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueResponse {
    #[serde(rename = "VALUE")]
    pub value: serde_json::Value,
}

/// Ask a peer for every pair it holds on a clockwise arc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRangeRequest {
    #[serde(rename = "LOWER_BOUND")]
    pub lower_bound: Key,
    #[serde(rename = "UPPER_BOUND")]
    pub upper_bound: Key,
}

/// One key-value pair of a [`ReadRangeResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvPair {
    #[serde(rename = "KEY")]
    pub key: Key,
    #[serde(rename = "VAL")]
    pub value: serde_json::Value,
}

/// Response to [`ReadRangeRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRangeResponse {
    #[serde(rename = "KV_PAIRS", default)]
    pub kv_pairs: Vec<KvPair>,
}

/// Exchange a Merkle tree node during anti-entropy. The recipient compares
/// the sender's node against its own node at the same position and responds
/// with the latter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeNodeRequest {
    #[serde(rename = "NODE")]
    pub node: WireNode,
    #[serde(rename = "REQUESTER")]
    pub requester: RemotePeer,
    #[serde(rename = "LOWER_BOUND")]
    pub lower_bound: Key,
    #[serde(rename = "UPPER_BOUND")]
    pub upper_bound: Key,
}

/// Tell a peer that `failed_node` is gone and that `originator` replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RectifyRequest {
    #[serde(rename = "FAILED_NODE")]
    pub failed_node: RemotePeer,
    #[serde(rename = "ORIGINATOR")]
    pub originator: RemotePeer,
}

/// A collection of request types for unified dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "COMMAND")]
#[non_exhaustive]
pub enum Request {
    /// Admit a new peer via this gateway.
    #[serde(rename = "JOIN")]
    Join(JoinRequest),
    /// A peer asserting itself as predecessor or successor.
    #[serde(rename = "NOTIFY")]
    Notify(NotifyRequest),
    /// Graceful departure notice.
    #[serde(rename = "LEAVE")]
    Leave(LeaveRequest),
    /// Successor lookup.
    #[serde(rename = "GET_SUCC")]
    GetSucc(GetSuccRequest),
    /// Predecessor lookup.
    #[serde(rename = "GET_PRED")]
    GetPred(GetPredRequest),
    /// Store a key-value pair.
    #[serde(rename = "CREATE_KEY")]
    CreateKey(CreateKeyRequest),
    /// Return the value of a key.
    #[serde(rename = "READ_KEY")]
    ReadKey(ReadKeyRequest),
    /// Return all pairs on an arc.
    #[serde(rename = "READ_RANGE")]
    ReadRange(ReadRangeRequest),
    /// Anti-entropy node exchange.
    #[serde(rename = "XCHNG_NODE")]
    ExchangeNode(ExchangeNodeRequest),
    /// Purge a failed peer.
    #[serde(rename = "RECTIFY")]
    Rectify(RectifyRequest),
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let command = match self {
            Request::Join(_) => "JOIN",
            Request::Notify(_) => "NOTIFY",
            Request::Leave(_) => "LEAVE",
            Request::GetSucc(_) => "GET_SUCC",
            Request::GetPred(_) => "GET_PRED",
            Request::CreateKey(_) => "CREATE_KEY",
            Request::ReadKey(_) => "READ_KEY",
            Request::ReadRange(_) => "READ_RANGE",
            Request::ExchangeNode(_) => "XCHNG_NODE",
            Request::Rectify(_) => "RECTIFY",
        };
        write!(f, "{}", command)
    }
}

use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::dht::Key;
use crate::error::Result;
use crate::rpc;
use crate::rpc::GetPredRequest;
use crate::rpc::GetSuccRequest;
use crate::rpc::Request;

/// An immutable descriptor of another peer on the ring.
///
/// Two descriptors are equal only when all four fields match; ordering is
/// by ring id. The serde form is also the wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RemotePeer {
    /// Ring id of the peer, derived from its address and port.
    #[serde(rename = "ID")]
    pub id: Key,
    /// Smallest key the peer owned when this descriptor was taken.
    #[serde(rename = "MIN_KEY")]
    pub min_key: Key,
    /// Address the peer's listener is bound to.
    #[serde(rename = "IP_ADDR")]
    pub addr: String,
    /// Port the peer's listener is bound to.
    #[serde(rename = "PORT")]
    pub port: u16,
}

impl RemotePeer {
    /// Build a descriptor from its parts.
    pub fn new(id: Key, min_key: Key, addr: String, port: u16) -> Self {
        Self {
            id,
            min_key,
            addr,
            port,
        }
    }

    /// Send a request, failing fast when the peer is unreachable.
    pub async fn send_request(&self, request: &Request) -> Result<serde_json::Value> {
        rpc::client::send_request(&self.addr, self.port, request).await
    }

    /// [`RemotePeer::send_request`] with a typed response.
    pub async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        rpc::client::call(&self.addr, self.port, request).await
    }

    /// Probe whether the peer's listener accepts connections.
    pub async fn is_alive(&self) -> bool {
        rpc::client::is_alive(&self.addr, self.port).await
    }

    /// Ask the peer for its own successor, the successor of `id + 1`.
    pub async fn get_succ(&self) -> Result<RemotePeer> {
        self.call(&Request::GetSucc(GetSuccRequest {
            key: &self.id + 1,
        }))
        .await
    }

    /// Ask the peer for its own predecessor, the predecessor of `id`.
    pub async fn get_pred(&self) -> Result<RemotePeer> {
        self.call(&Request::GetPred(GetPredRequest {
            key: self.id.clone(),
        }))
        .await
    }

    /// Abbreviated id for log lines.
    pub fn short_id(&self) -> String {
        let hex = self.id.to_hex();
        hex.chars().take(8).collect()
    }
}

impl PartialOrd for RemotePeer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemotePeer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.short_id(), self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_requires_all_fields() {
        let base = RemotePeer::new(
            Key::from(10u64),
            Key::from(5u64),
            "127.0.0.1".into(),
            4000,
        );
        assert_eq!(base, base.clone());

        let mut other = base.clone();
        other.port = 4001;
        assert_ne!(base, other);

        let mut other = base.clone();
        other.min_key = Key::from(6u64);
        assert_ne!(base, other);
    }

    #[test]
    fn test_ordering_is_by_id() {
        let a = RemotePeer::new(Key::from(1u64), Key::zero(), "10.0.0.9".into(), 9999);
        let b = RemotePeer::new(Key::from(2u64), Key::zero(), "10.0.0.1".into(), 1);
        assert!(a < b);
    }

    #[test]
    fn test_wire_form() {
        let peer = RemotePeer::new(
            Key::from(255u64),
            Key::from(16u64),
            "192.168.0.7".into(),
            4123,
        );
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["ID"], "ff");
        assert_eq!(json["MIN_KEY"], "10");
        assert_eq!(json["IP_ADDR"], "192.168.0.7");
        assert_eq!(json["PORT"], 4123);

        let back: RemotePeer = serde_json::from_value(json).unwrap();
        assert_eq!(back, peer);
    }
}

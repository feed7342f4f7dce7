//! Single-successor key/value service: each key lives on the one peer
//! succeeding it on the ring.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::dht::ChordState;
use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::dht::StoreAdapter;
use crate::error::Error;
use crate::error::Result;
use crate::node::maintenance::MaintenanceHandle;
use crate::node::PeerConfig;
use crate::rpc::CreateKeyRequest;
use crate::rpc::KeyMap;
use crate::rpc::ReadKeyRequest;
use crate::rpc::Request;
use crate::rpc::RpcServer;
use crate::rpc::RpcService;
use crate::rpc::ValueResponse;
use crate::store::Database;

/// Store adapter of the single-successor service: ownership moves mean
/// the data moves with it.
struct TextStore {
    db: Database<String>,
}

impl StoreAdapter for TextStore {
    fn transfers_keys(&self) -> bool {
        true
    }

    fn drain_range(&self, lo: &Key, hi: &Key) -> Result<KeyMap> {
        let range = self.db.read_range(lo, hi)?;
        let mut keys = KeyMap::new();
        for (key, value) in range {
            self.db.delete(&key)?;
            keys.insert(key, serde_json::Value::String(value));
        }
        Ok(keys)
    }

    fn export_all(&self) -> Result<KeyMap> {
        let mut keys = KeyMap::new();
        for (key, value) in self.db.entries()? {
            keys.insert(key, serde_json::Value::String(value));
        }
        Ok(keys)
    }

    fn absorb(&self, keys: &KeyMap) -> Result<()> {
        for (key, value) in keys {
            let value: String =
                serde_json::from_value(value.clone()).map_err(Error::Deserialize)?;
            match self.db.insert(key.clone(), value) {
                Ok(()) => {}
                Err(Error::DuplicateKey) => {
                    tracing::warn!(key = %key, "ignoring duplicate key while absorbing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub(crate) struct ChordKvInner {
    state: ChordState,
    db: Database<String>,
    config: PeerConfig,
    server: Mutex<Option<RpcServer>>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

/// A runnable peer of the single-successor store.
#[derive(Clone)]
pub struct ChordNode {
    inner: Arc<ChordKvInner>,
}

impl ChordNode {
    /// Bind the listener and build an idle peer. Call
    /// [`ChordNode::start_chord`] or [`ChordNode::join`] next.
    pub async fn start(addr: &str, port: u16, config: PeerConfig) -> Result<Self> {
        let db = Database::new();
        let store = Arc::new(TextStore { db: db.clone() });
        let state = ChordState::new(addr, port, config.num_succs, store);

        let inner = Arc::new(ChordKvInner {
            state,
            db,
            config: config.clone(),
            server: Mutex::new(None),
            maintenance: Mutex::new(None),
        });

        let server =
            RpcServer::spawn(addr, port, config.rpc_workers, inner.clone()).await?;
        *inner
            .server
            .lock()
            .map_err(|_| Error::RingStateLockFailed)? = Some(server);

        Ok(Self { inner })
    }

    /// Ring state of this peer.
    pub fn state(&self) -> &ChordState {
        &self.inner.state
    }

    pub(crate) fn db(&self) -> &Database<String> {
        &self.inner.db
    }

    /// Become the first peer of a new ring.
    pub async fn start_chord(&self) -> Result<()> {
        self.inner.state.start_chord()?;
        self.start_maintenance()?;
        Ok(())
    }

    /// Join an existing ring through a gateway.
    pub async fn join(&self, gateway_addr: &str, gateway_port: u16) -> Result<()> {
        self.inner.state.join(gateway_addr, gateway_port).await?;
        self.start_maintenance()?;
        Ok(())
    }

    fn start_maintenance(&self) -> Result<()> {
        let inner = self.inner.clone();
        let handle =
            MaintenanceHandle::spawn(self.inner.config.stabilize_interval, move || {
                let inner = inner.clone();
                async move { inner.state.stabilize().await }
            });
        *self
            .inner
            .maintenance
            .lock()
            .map_err(|_| Error::RingStateLockFailed)? = Some(handle);
        Ok(())
    }

    /// Hand our keys over and shut down.
    pub async fn leave(&self) -> Result<()> {
        self.inner.state.leave().await?;
        self.fail().await
    }

    /// Shut down abruptly: no notifications, the ring self-heals.
    pub async fn fail(&self) -> Result<()> {
        tracing::info!(
            peer = %self.inner.state.id(),
            range = %format!("{}-{}", self.inner.state.min_key()?, self.inner.state.id()),
            keys = self.inner.db.len()?,
            "shutting down"
        );

        let maintenance = {
            let mut guard = self
                .inner
                .maintenance
                .lock()
                .map_err(|_| Error::RingStateLockFailed)?;
            guard.take()
        };
        if let Some(handle) = maintenance {
            handle.stop().await;
        }

        let server = {
            let mut guard = self
                .inner
                .server
                .lock()
                .map_err(|_| Error::RingStateLockFailed)?;
            guard.take()
        };
        if let Some(server) = server {
            server.shutdown().await;
        }
        Ok(())
    }

    /// Create a pair under the hash of a plaintext key.
    pub async fn create(&self, unhashed: &str, value: &str) -> Result<()> {
        self.create_hashed(Key::hash(unhashed), value).await
    }

    /// Read the value stored under the hash of a plaintext key.
    pub async fn read(&self, unhashed: &str) -> Result<String> {
        self.read_hashed(&Key::hash(unhashed)).await
    }

    /// Create a pair under an already-hashed key.
    pub async fn create_hashed(&self, key: Key, value: &str) -> Result<()> {
        if self.inner.state.stored_locally(&key)? {
            return self.inner.db.insert(key, value.to_string());
        }

        let succ = self.inner.state.get_successor(&key).await?;
        self.create_key(&key, value, &succ).await
    }

    /// Read the value under an already-hashed key.
    pub async fn read_hashed(&self, key: &Key) -> Result<String> {
        if self.inner.state.stored_locally(key)? {
            return self.inner.db.lookup(key);
        }

        let succ = self.inner.state.get_successor(key).await?;
        let resp: ValueResponse = succ
            .call(&Request::ReadKey(ReadKeyRequest { key: key.clone() }))
            .await?;
        serde_json::from_value(resp.value).map_err(Error::Deserialize)
    }

    async fn create_key(&self, key: &Key, value: &str, peer: &RemotePeer) -> Result<()> {
        peer.send_request(&Request::CreateKey(CreateKeyRequest {
            key: key.clone(),
            value: serde_json::Value::String(value.to_string()),
        }))
        .await?;
        Ok(())
    }

    /// Store a file's contents under its path.
    pub async fn upload_file(&self, path: &str) -> Result<()> {
        let contents = tokio::fs::read_to_string(path).await?;
        self.create(path, &contents).await
    }

    /// Read the value stored under `name` and write it to `output_path`.
    pub async fn download_file(&self, name: &str, output_path: &str) -> Result<()> {
        let contents = self.read(name).await?;
        tokio::fs::write(output_path, contents).await?;
        Ok(())
    }
}

impl ChordKvInner {
    fn create_key_handler(&self, req: CreateKeyRequest) -> Result<serde_json::Value> {
        if !self.state.stored_locally(&req.key)? {
            return Err(Error::OutOfRange);
        }
        let value: String =
            serde_json::from_value(req.value).map_err(Error::Deserialize)?;
        self.db.insert(req.key, value)?;
        Ok(serde_json::json!({}))
    }

    fn read_key_handler(&self, req: ReadKeyRequest) -> Result<serde_json::Value> {
        if !self.state.stored_locally(&req.key)? {
            return Err(Error::OutOfRange);
        }
        let value = self.db.lookup(&req.key)?;
        let resp = ValueResponse {
            value: serde_json::Value::String(value),
        };
        serde_json::to_value(resp).map_err(Error::Serialize)
    }
}

#[async_trait]
impl RpcService for ChordKvInner {
    async fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        match request {
            Request::Join(req) => {
                let resp = self.state.handle_join(req.new_peer).await?;
                serde_json::to_value(resp).map_err(Error::Serialize)
            }
            Request::Notify(req) => {
                let resp = self.state.handle_notify(req.new_peer).await?;
                serde_json::to_value(resp).map_err(Error::Serialize)
            }
            Request::Leave(req) => {
                self.state.handle_leave(req).await?;
                Ok(serde_json::json!({}))
            }
            Request::GetSucc(req) => {
                let succ = self.state.get_successor(&req.key).await?;
                serde_json::to_value(succ).map_err(Error::Serialize)
            }
            Request::GetPred(req) => {
                let pred = self.state.get_predecessor(&req.key).await?;
                serde_json::to_value(pred).map_err(Error::Serialize)
            }
            Request::CreateKey(req) => self.create_key_handler(req),
            Request::ReadKey(req) => self.read_key_handler(req),
            Request::Rectify(req) => {
                self.state.handle_rectify(req).await?;
                Ok(serde_json::json!({}))
            }
            other => Err(Error::Remote(format!(
                "command {} is not supported by this peer",
                other
            ))),
        }
    }
}

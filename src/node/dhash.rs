//! Replicated key/value service with erasure-coded fragments.
//!
//! Every value is dispersed into `n` fragments stored on the first `n`
//! successors of its key; any `m` of them reconstruct the value. Keys are
//! never handed over when ownership moves; replication already covers the
//! new owner and the maintenance passes re-home whatever ends up
//! misplaced.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::dht::ChordState;
use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::dht::StoreAdapter;
use crate::error::Error;
use crate::error::Result;
use crate::ida::Fragment;
use crate::ida::Ida;
use crate::node::maintenance::MaintenanceHandle;
use crate::node::PeerConfig;
use crate::rpc::CreateKeyRequest;
use crate::rpc::KeyMap;
use crate::rpc::KvPair;
use crate::rpc::ReadKeyRequest;
use crate::rpc::ReadRangeRequest;
use crate::rpc::ReadRangeResponse;
use crate::rpc::Request;
use crate::rpc::RpcServer;
use crate::rpc::RpcService;
use crate::rpc::ValueResponse;
use crate::store::Database;

/// Store adapter of the fragment service: data stays put when ownership
/// moves, so joins and leaves carry no keys.
struct FragmentStore;

impl StoreAdapter for FragmentStore {
    fn transfers_keys(&self) -> bool {
        false
    }

    fn drain_range(&self, _lo: &Key, _hi: &Key) -> Result<KeyMap> {
        Ok(KeyMap::new())
    }

    fn export_all(&self) -> Result<KeyMap> {
        Ok(KeyMap::new())
    }

    fn absorb(&self, _keys: &KeyMap) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct DhashInner {
    pub(crate) state: ChordState,
    pub(crate) db: Database<Fragment>,
    pub(crate) ida: Ida,
    config: PeerConfig,
    server: Mutex<Option<RpcServer>>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

/// A runnable peer of the replicated fragment store.
#[derive(Clone)]
pub struct DhashNode {
    pub(crate) inner: Arc<DhashInner>,
}

impl DhashNode {
    /// Bind the listener and build an idle peer. Call
    /// [`DhashNode::start_chord`] or [`DhashNode::join`] next.
    pub async fn start(addr: &str, port: u16, config: PeerConfig) -> Result<Self> {
        let ida = Ida::new(config.ida_n, config.ida_m, config.ida_p)?;
        let db = Database::new();
        let state = ChordState::new(addr, port, config.num_succs, Arc::new(FragmentStore));

        let inner = Arc::new(DhashInner {
            state,
            db,
            ida,
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

    pub(crate) fn db(&self) -> &Database<Fragment> {
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
                async move { inner.maintenance_cycle().await }
            });
        *self
            .inner
            .maintenance
            .lock()
            .map_err(|_| Error::RingStateLockFailed)? = Some(handle);
        Ok(())
    }

    /// Notify the ring and shut down. Fragments are not transferred; the
    /// remaining replicas cover every key.
    pub async fn leave(&self) -> Result<()> {
        self.inner.state.leave().await?;
        self.fail().await
    }

    /// Shut down abruptly: no notifications, the ring self-heals.
    pub async fn fail(&self) -> Result<()> {
        tracing::info!(
            peer = %self.inner.state.id(),
            range = %format!("{}-{}", self.inner.state.min_key()?, self.inner.state.id()),
            fragments = self.inner.db.len()?,
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

    /// Disperse a value under the hash of a plaintext key.
    pub async fn create(&self, unhashed: &str, value: &str) -> Result<()> {
        self.inner
            .create_fragments(&Key::hash(unhashed), value.as_bytes())
            .await
    }

    /// Reconstruct the value stored under the hash of a plaintext key.
    pub async fn read(&self, unhashed: &str) -> Result<String> {
        let bytes = self.inner.read_bytes(&Key::hash(unhashed)).await?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Codec("reconstructed value is not valid UTF-8".into()))
    }

    /// Disperse a value under an already-hashed key.
    pub async fn create_hashed(&self, key: &Key, value: &[u8]) -> Result<()> {
        self.inner.create_fragments(key, value).await
    }

    /// Reconstruct the value under an already-hashed key.
    pub async fn read_hashed(&self, key: &Key) -> Result<Vec<u8>> {
        self.inner.read_bytes(key).await
    }

    /// Compare our tree against a successor's over a key range and pull
    /// whatever we are missing.
    pub async fn synchronize(&self, peer: &RemotePeer, lo: &Key, hi: &Key) -> Result<()> {
        self.inner.synchronize(peer, lo, hi).await
    }

    /// Store a file's contents under its path.
    pub async fn upload_file(&self, path: &str) -> Result<()> {
        let contents = tokio::fs::read(path).await?;
        self.inner
            .create_fragments(&Key::hash(path), &contents)
            .await
    }

    /// Reconstruct the value stored under `name` and write it out.
    pub async fn download_file(&self, name: &str, output_path: &str) -> Result<()> {
        let contents = self.inner.read_bytes(&Key::hash(name)).await?;
        tokio::fs::write(output_path, contents).await?;
        Ok(())
    }
}

impl DhashInner {
    async fn maintenance_cycle(&self) -> Result<()> {
        self.state.stabilize().await?;
        self.run_global_maintenance().await?;
        self.run_local_maintenance().await
    }

    /// Encode a value and scatter its fragments over the key's successors.
    pub(crate) async fn create_fragments(&self, key: &Key, value: &[u8]) -> Result<()> {
        let fragments = self.ida.encode_bytes(value);
        let succs = self.state.get_n_successors(key, self.ida.n()).await?;

        if succs.len() < self.ida.m() {
            return Err(Error::InsufficientReplicas(self.ida.m()));
        }

        let mut placed = 0;
        for (fragment, succ) in fragments.iter().zip(succs.iter()) {
            if succ.id == *self.state.id() {
                self.db.insert(key.clone(), fragment.clone())?;
                placed += 1;
            } else if succ.is_alive().await {
                match self.create_key(key, fragment, succ).await {
                    Ok(()) => placed += 1,
                    Err(e) => {
                        tracing::debug!(key = %key, target = %succ, error = %e,
                            "fragment placement failed");
                    }
                }
            }
        }

        if placed < self.ida.m() {
            return Err(Error::InsufficientReplicas(self.ida.m()));
        }
        Ok(())
    }

    /// Collect `m` distinct fragments from the key's successors and
    /// decode.
    pub(crate) async fn read_bytes(&self, key: &Key) -> Result<Vec<u8>> {
        let succs = self
            .state
            .get_n_successors(key, self.state.num_succs())
            .await?;

        let mut fragments: BTreeMap<usize, Fragment> = BTreeMap::new();
        for succ in succs {
            if fragments.len() >= self.ida.m() {
                break;
            }

            if succ.id == *self.state.id() {
                if self.db.contains(key)? {
                    let fragment = self.db.lookup(key)?;
                    fragments.insert(fragment.index, fragment);
                }
                continue;
            }

            // A successor without the fragment answers with an error; move
            // on to the next one.
            match self.read_key(key, &succ).await {
                Ok(fragment) => {
                    fragments.insert(fragment.index, fragment);
                }
                Err(e) => {
                    tracing::trace!(key = %key, target = %succ, error = %e,
                        "fragment not available");
                }
            }
        }

        if fragments.len() < self.ida.m() {
            return Err(Error::InsufficientFragments(self.ida.m()));
        }

        let fragments: Vec<Fragment> = fragments.into_values().collect();
        self.ida.decode(&fragments)
    }

    pub(crate) async fn create_key(
        &self,
        key: &Key,
        fragment: &Fragment,
        peer: &RemotePeer,
    ) -> Result<()> {
        peer.send_request(&Request::CreateKey(CreateKeyRequest {
            key: key.clone(),
            value: serde_json::to_value(fragment).map_err(Error::Serialize)?,
        }))
        .await?;
        Ok(())
    }

    async fn read_key(&self, key: &Key, peer: &RemotePeer) -> Result<Fragment> {
        let resp: ValueResponse = peer
            .call(&Request::ReadKey(ReadKeyRequest { key: key.clone() }))
            .await?;
        serde_json::from_value(resp.value).map_err(Error::Deserialize)
    }

    /// Fetch every pair a remote peer holds on `[lo, hi]`.
    pub(crate) async fn read_range_remote(
        &self,
        peer: &RemotePeer,
        lo: &Key,
        hi: &Key,
    ) -> Result<BTreeMap<Key, Fragment>> {
        let resp: ReadRangeResponse = peer
            .call(&Request::ReadRange(ReadRangeRequest {
                lower_bound: lo.clone(),
                upper_bound: hi.clone(),
            }))
            .await?;

        let mut pairs = BTreeMap::new();
        for KvPair { key, value } in resp.kv_pairs {
            let fragment: Fragment =
                serde_json::from_value(value).map_err(Error::Deserialize)?;
            pairs.insert(key, fragment);
        }
        Ok(pairs)
    }

    fn create_key_handler(&self, req: CreateKeyRequest) -> Result<serde_json::Value> {
        let fragment: Fragment =
            serde_json::from_value(req.value).map_err(Error::Deserialize)?;
        if self.db.contains(&req.key)? {
            return Err(Error::DuplicateKey);
        }
        self.db.insert(req.key, fragment)?;
        Ok(serde_json::json!({}))
    }

    fn read_key_handler(&self, req: ReadKeyRequest) -> Result<serde_json::Value> {
        let fragment = self.db.lookup(&req.key)?;
        let resp = ValueResponse {
            value: serde_json::to_value(&fragment).map_err(Error::Serialize)?,
        };
        serde_json::to_value(resp).map_err(Error::Serialize)
    }

    fn read_range_handler(&self, req: ReadRangeRequest) -> Result<serde_json::Value> {
        let mut kv_pairs = Vec::new();
        for (key, fragment) in self.db.read_range(&req.lower_bound, &req.upper_bound)? {
            kv_pairs.push(KvPair {
                key,
                value: serde_json::to_value(&fragment).map_err(Error::Serialize)?,
            });
        }
        serde_json::to_value(ReadRangeResponse { kv_pairs }).map_err(Error::Serialize)
    }
}

#[async_trait]
impl RpcService for DhashInner {
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
            Request::ReadRange(req) => self.read_range_handler(req),
            Request::ExchangeNode(req) => self.exchange_node_handler(req).await,
            Request::Rectify(req) => {
                self.state.handle_rectify(req).await?;
                Ok(serde_json::json!({}))
            }
        }
    }
}

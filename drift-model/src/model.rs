//! The replicated directory model.
//!
//! The model keeps three views of the directory tree: `local` (what this
//! replica has on disk, tombstones included), one `remote` map per connected
//! peer, and the derived `global` map holding the newest version of every
//! name known anywhere in the cluster. The derived `need` set names the
//! files this replica must fetch or apply to converge on `global`.
//!
//! Locking: a single reader/writer lock protects all model state. Public
//! methods acquire it at their outermost boundary; internal helpers never
//! acquire it and operate on the already-guarded [`State`]. The lock is not
//! held across network or disk I/O; the broadcast scheduler snapshots under
//! the write lock and awaits its fan-out after releasing it.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use drift_proto::{
    ConnectionInfo, FileInfo, Peer, PeerEvents, RequestError, Transport, FLAG_DELETED,
};

use crate::config::{ModelConfig, TraceCategory};
use crate::file::File;
use crate::puller;
use crate::suppress;
use crate::walker;

/// Wait at least this long after the last local change before broadcasting
/// the index, to coalesce bursts.
const IDX_BCAST_HOLDTIME: Duration = Duration::from_secs(15);

/// Never delay a requested broadcast longer than this.
const IDX_BCAST_MAX_DELAY: Duration = Duration::from_secs(120);

/// Peer id under which the puller reads reusable blocks from local disk.
pub(crate) const LOCAL_PEER: &str = "<local>";

/// File, tombstone and byte counts over an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCounts {
    pub files: usize,
    pub deleted: usize,
    pub bytes: u64,
}

/// All mutable model state, guarded by the single field lock.
pub(crate) struct State {
    /// Newest version of each file as it exists anywhere in the cluster.
    pub(crate) global: HashMap<String, File>,
    /// The files this replica has locally, tombstones included.
    pub(crate) local: HashMap<String, File>,
    /// Index received from each connected peer.
    pub(crate) remote: HashMap<String, HashMap<String, File>>,
    /// Names this replica must fetch or apply.
    pub(crate) need: HashSet<String>,

    pub(crate) peers: HashMap<String, Arc<dyn Peer>>,
    pub(crate) transports: HashMap<String, Arc<dyn Transport>>,

    /// Epoch second of the last change to `local`.
    pub(crate) updated_local: i64,
    /// Epoch second of the last change to `global`.
    pub(crate) update_global: i64,

    pub(crate) last_idx_bcast: Instant,
    pub(crate) last_idx_bcast_request: Instant,

    pub(crate) rw_running: bool,
    pub(crate) delete: bool,
    pub(crate) parallel_files: usize,
    pub(crate) parallel_requests: usize,

    pub(crate) trace: HashSet<TraceCategory>,

    /// Ignore patterns per directory, loaded from ignore files during walks.
    pub(crate) ignore: HashMap<String, Vec<glob::Pattern>>,

    pub(crate) file_last_changed: HashMap<String, Instant>,
    pub(crate) file_was_suppressed: HashMap<String, u32>,
}

/// The replicated directory model. See the module documentation for the
/// locking discipline.
pub struct Model {
    pub(crate) dir: PathBuf,
    pub(crate) state: RwLock<State>,
    /// Exclusion between pulling and walking, so a scan never observes a
    /// half-applied pull.
    pub(crate) walk_lock: Mutex<()>,
    /// Handle to ourselves for spawning the long-running tasks.
    weak: Weak<Model>,
}

impl Model {
    /// Create a new model rooted at `dir` and start its index broadcast
    /// scheduler. The model starts in read-only mode: it answers requests
    /// and announces its index but never alters the local directory.
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        let now = Instant::now();
        let dir = dir.into();
        let model = Arc::new_cyclic(|weak| Self {
            dir,
            state: RwLock::new(State {
                global: HashMap::new(),
                local: HashMap::new(),
                remote: HashMap::new(),
                need: HashSet::new(),
                peers: HashMap::new(),
                transports: HashMap::new(),
                updated_local: 0,
                update_global: 0,
                last_idx_bcast: now,
                last_idx_bcast_request: now,
                rw_running: false,
                delete: false,
                parallel_files: 0,
                parallel_requests: 0,
                trace: HashSet::new(),
                ignore: HashMap::new(),
                file_last_changed: HashMap::new(),
                file_was_suppressed: HashMap::new(),
            }),
            walk_lock: Mutex::new(()),
            weak: weak.clone(),
        });

        tokio::spawn(Self::broadcast_index_loop(Arc::clone(&model)));
        model
    }

    /// Enable a diagnostic category.
    pub async fn trace(&self, category: TraceCategory) {
        self.state.write().await.trace.insert(category);
    }

    /// Start read/write processing: the temp-file sweep and the puller that
    /// keeps the local directory converged on the global view.
    ///
    /// # Panics
    ///
    /// Panics if read/write processing was already started; doing so twice
    /// is a programming error.
    pub async fn start_rw(&self, config: ModelConfig) {
        {
            let mut state = self.state.write().await;
            if state.rw_running {
                panic!("read/write processing already started");
            }
            state.rw_running = true;
            state.delete = config.delete;
            state.parallel_files = config.parallel_files.max(1);
            state.parallel_requests = config.parallel_requests.max(1);
            state.trace.extend(config.trace.iter().copied());
        }

        if let Some(model) = self.weak.upgrade() {
            tokio::spawn(walker::clean_temp_files(Arc::clone(&model)));
            tokio::spawn(puller::run(model));
        }
    }

    /// An opaque value guaranteed to change whenever the local repository or
    /// the global view changes. Observers poll this to detect updates with a
    /// single read.
    pub async fn generation(&self) -> i64 {
        let state = self.state.read().await;
        state.updated_local + state.update_global
    }

    /// Per-peer transfer statistics and remote addresses.
    pub async fn connection_stats(&self) -> HashMap<String, ConnectionInfo> {
        let state = self.state.read().await;
        state
            .peers
            .iter()
            .map(|(id, peer)| {
                let info = ConnectionInfo {
                    statistics: peer.statistics(),
                    address: state.transports.get(id).and_then(|t| t.remote_addr()),
                };
                (id.clone(), info)
            })
            .collect()
    }

    /// Counts over the global view.
    pub async fn global_size(&self) -> SizeCounts {
        let state = self.state.read().await;
        count(state.global.values())
    }

    /// Counts over the local index.
    pub async fn local_size(&self) -> SizeCounts {
        let state = self.state.read().await;
        count(state.local.values())
    }

    /// Number and total byte size of local files that match the global view.
    pub async fn in_sync_size(&self) -> (usize, u64) {
        let state = self.state.read().await;
        let mut files = 0;
        let mut bytes = 0;
        for (name, f) in &state.local {
            if let Some(gf) = state.global.get(name) {
                if f.same_version(gf) {
                    files += 1;
                    bytes += f.size();
                }
            }
        }
        (files, bytes)
    }

    /// The currently needed files (global records) and their total size.
    pub async fn need_files(&self) -> (Vec<File>, u64) {
        let state = self.state.read().await;
        let mut files = Vec::with_capacity(state.need.len());
        let mut bytes = 0;
        for name in &state.need {
            if let Some(f) = state.global.get(name) {
                bytes += f.size();
                files.push(f.clone());
            }
        }
        (files, bytes)
    }

    /// Whether the named peer is currently connected.
    pub async fn connected_to(&self, peer_id: &str) -> bool {
        self.state.read().await.peers.contains_key(peer_id)
    }

    /// This replica's record for `name`, if any.
    pub async fn local_file(&self, name: &str) -> Option<File> {
        self.state.read().await.local.get(name).cloned()
    }

    /// The cluster-wide newest record for `name`, if any.
    pub async fn global_file(&self, name: &str) -> Option<File> {
        self.state.read().await.global.get(name).cloned()
    }

    /// All records in the local index.
    pub async fn have_files(&self) -> Vec<File> {
        self.state.read().await.local.values().cloned().collect()
    }

    /// The local index in wire form.
    pub async fn protocol_index(&self) -> Vec<FileInfo> {
        self.state.read().await.protocol_index()
    }

    /// A stable identifier for this repository, derived from its path.
    pub fn repo_id(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.dir.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// A peer announced its full index. Replaces whatever we previously held
    /// for that peer.
    pub async fn index(&self, peer_id: &str, files: Vec<FileInfo>) {
        let mut state = self.state.write().await;

        if state.traces(TraceCategory::Net) {
            debug!("index in from {}: {} files", peer_id, files.len());
        }

        let mut repo = HashMap::with_capacity(files.len());
        for f in files {
            state.trace_record("idx in", &f);
            repo.insert(f.name.clone(), File::from(f));
        }
        state.remote.insert(peer_id.to_string(), repo);

        state.recompute_global();
        state.recompute_need();
    }

    /// A peer announced incremental index changes. Entries merge over the
    /// peer's existing map; nothing is removed. Unknown peers are ignored.
    pub async fn index_update(&self, peer_id: &str, files: Vec<FileInfo>) {
        let mut state = self.state.write().await;

        if state.traces(TraceCategory::Net) {
            debug!("index update in from {}: {} files", peer_id, files.len());
        }

        if !state.remote.contains_key(peer_id) {
            return;
        }
        for f in files {
            state.trace_record("idx update in", &f);
            let file = File::from(f);
            if let Some(repo) = state.remote.get_mut(peer_id) {
                repo.insert(file.name.clone(), file);
            }
        }

        state.recompute_global();
        state.recompute_need();
    }

    /// Remove a peer and close its transport. Tolerates unknown peers.
    pub async fn close(&self, peer_id: &str, err: Option<String>) {
        let mut state = self.state.write().await;

        if let Some(transport) = state.transports.get(peer_id) {
            transport.close();
        }

        match err {
            Some(e) => warn!("disconnected from {}: {}", peer_id, e),
            None => info!("disconnected from {}", peer_id),
        }

        state.remote.remove(peer_id);
        state.peers.remove(peer_id);
        state.transports.remove(peer_id);

        state.recompute_global();
        state.recompute_need();
    }

    /// Serve a span of file content from local disk.
    ///
    /// The name must be present in both the local and the global index; this
    /// is the gate that keeps peer-supplied names from escaping the
    /// repository root. Locally invalid files are refused.
    pub async fn request(
        &self,
        peer_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Bytes, RequestError> {
        let (local_ok, global_ok, invalid, trace_net) = {
            let state = self.state.read().await;
            (
                state.local.contains_key(name),
                state.global.contains_key(name),
                state.local.get(name).map(File::is_invalid).unwrap_or(false),
                state.traces(TraceCategory::Net),
            )
        };

        if !local_ok || !global_ok {
            warn!(
                "security: request for unknown file from {}: {:?} o={} s={}",
                peer_id, name, offset, size
            );
            return Err(RequestError::NoSuchFile);
        }
        if invalid {
            return Err(RequestError::Invalid);
        }

        if trace_net && peer_id != LOCAL_PEER {
            debug!(
                "request in from {}: {:?} o={} s={} h={}",
                peer_id,
                name,
                offset,
                size,
                hex::encode(hash)
            );
        }

        // TODO: cache open descriptors instead of reopening per request
        let path = self.dir.join(name);
        let mut fd = tokio::fs::File::open(&path).await?;
        fd.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        fd.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    /// Request a block from a connected peer.
    pub(crate) async fn request_from(
        &self,
        peer_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Bytes, RequestError> {
        let (peer, trace_net) = {
            let state = self.state.read().await;
            (
                state.peers.get(peer_id).cloned(),
                state.traces(TraceCategory::Net),
            )
        };
        let Some(peer) = peer else {
            return Err(RequestError::Disconnected(peer_id.to_string()));
        };

        if trace_net {
            debug!(
                "request out to {}: {:?} o={} s={} h={}",
                peer_id,
                name,
                offset,
                size,
                hex::encode(hash)
            );
        }

        peer.request(name, offset, size, hash).await
    }

    /// Replace the local index from a fresh disk scan. Names that vanished
    /// since the previous scan are converted to deletion tombstones when we
    /// held the newest known version; any observed change schedules an index
    /// broadcast.
    pub async fn replace_local(&self, files: Vec<File>) {
        let mut state = self.state.write().await;

        let mut updated = false;
        let mut new_local = HashMap::with_capacity(files.len());

        for f in files {
            match state.local.get(&f.name) {
                Some(existing) if existing.same_version(&f) => {}
                _ => updated = true,
            }
            new_local.insert(f.name.clone(), f);
        }

        if state.mark_deleted_locals(&mut new_local) {
            updated = true;
        }

        if new_local.len() != state.local.len() {
            updated = true;
        }

        if updated {
            state.local = new_local;
            state.recompute_global();
            state.recompute_need();
            state.updated_local = Utc::now().timestamp();
            state.last_idx_bcast_request = Instant::now();
        }
    }

    /// Replace the local index verbatim from wire records. No deletion
    /// tracking is applied; use only to warm the index from a persisted
    /// cache at startup.
    pub async fn seed_local(&self, files: Vec<FileInfo>) {
        let mut state = self.state.write().await;

        state.local = files
            .into_iter()
            .map(|f| (f.name.clone(), File::from(f)))
            .collect();

        state.recompute_global();
        state.recompute_need();
    }

    /// Promote a single record into the local index, as done by the puller
    /// after a successful apply and by the single-file recheck path.
    pub(crate) async fn update_local(&self, f: File) {
        self.state.write().await.update_local(f);
    }

    /// Install a connected peer and push our full index to it. The push runs
    /// detached; subsequent broadcasts go through the scheduler.
    pub async fn add_connection(&self, peer: Arc<dyn Peer>, transport: Arc<dyn Transport>) {
        let peer_id = peer.id().to_string();
        let index = {
            let mut state = self.state.write().await;
            state.peers.insert(peer_id.clone(), Arc::clone(&peer));
            state.transports.insert(peer_id.clone(), transport);
            state.protocol_index()
        };

        info!("connected to {}", peer_id);

        tokio::spawn(async move {
            peer.index(index).await;
        });
    }

    /// Whether a rescan of `name` should be suppressed right now. Updates
    /// the per-file bookkeeping as a side effect.
    pub(crate) async fn should_suppress_change(&self, name: &str) -> bool {
        self.state.write().await.should_suppress_change(name)
    }

    async fn broadcast_index_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(IDX_BCAST_HOLDTIME).await;

            let due = {
                let state = self.state.read().await;
                let requested = state.last_idx_bcast_request > state.last_idx_bcast;
                let holdtime_exceeded =
                    state.last_idx_bcast_request.elapsed() > IDX_BCAST_HOLDTIME;
                let max_delay_exceeded = state.last_idx_bcast.elapsed() > IDX_BCAST_MAX_DELAY;
                requested && (holdtime_exceeded || max_delay_exceeded)
            };
            if !due {
                continue;
            }

            // Snapshot under the write lock, then fan out with the lock
            // released. The fan-out completes before the next slot opens.
            let (index, peers, trace_net) = {
                let mut state = self.state.write().await;
                state.last_idx_bcast = Instant::now();
                (
                    state.protocol_index(),
                    state.peers.values().cloned().collect::<Vec<_>>(),
                    state.traces(TraceCategory::Net),
                )
            };

            let mut fanout = JoinSet::new();
            for peer in peers {
                if trace_net {
                    debug!("index out to {}: {} files", peer.id(), index.len());
                }
                let index = index.clone();
                fanout.spawn(async move {
                    peer.index(index).await;
                });
            }
            while fanout.join_next().await.is_some() {}
        }
    }
}

#[async_trait]
impl PeerEvents for Model {
    async fn index(&self, peer_id: &str, files: Vec<FileInfo>) {
        Model::index(self, peer_id, files).await
    }

    async fn index_update(&self, peer_id: &str, files: Vec<FileInfo>) {
        Model::index_update(self, peer_id, files).await
    }

    async fn request(
        &self,
        peer_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> Result<Bytes, RequestError> {
        Model::request(self, peer_id, name, offset, size, hash).await
    }

    async fn close(&self, peer_id: &str, err: Option<String>) {
        Model::close(self, peer_id, err).await
    }
}

impl State {
    pub(crate) fn traces(&self, category: TraceCategory) -> bool {
        self.trace.contains(&category)
    }

    fn trace_record(&self, direction: &str, f: &FileInfo) {
        if self.traces(TraceCategory::Idx) {
            debug!(
                "{}: {:?} m={} f={:o}{} v={} ({} blocks)",
                direction,
                f.name,
                f.modified,
                f.flags,
                if f.is_deleted() { " (deleted)" } else { "" },
                f.version,
                f.blocks.len()
            );
        }
    }

    /// Rebuild `global` from `local` and the remote maps. Local records win
    /// ties; among remotes, peers are folded in lexicographic id order and a
    /// candidate replaces the incumbent only when strictly newer, so the
    /// smallest peer id wins among equals. Publishes and stamps
    /// `update_global` only when the result actually differs.
    pub(crate) fn recompute_global(&mut self) {
        let mut new_global = self.local.clone();

        let mut peer_ids: Vec<&String> = self.remote.keys().collect();
        peer_ids.sort();
        for peer_id in peer_ids {
            for (name, remote_file) in &self.remote[peer_id] {
                match new_global.get(name) {
                    Some(incumbent) if !remote_file.newer_than(incumbent) => {}
                    _ => {
                        new_global.insert(name.clone(), remote_file.clone());
                    }
                }
            }
        }

        let mut updated = new_global.len() != self.global.len();
        if !updated {
            for (name, f) in &new_global {
                match self.global.get(name) {
                    Some(old) if old.same_version(f) => {}
                    _ => {
                        updated = true;
                        break;
                    }
                }
            }
        }

        if updated {
            self.update_global = Utc::now().timestamp();
            self.global = new_global;
        }
    }

    /// Rebuild `need` from `global` and `local`. Invalid files are never
    /// needed; deletions are needed only when deletion is enabled and a
    /// local copy actually exists.
    pub(crate) fn recompute_need(&mut self) {
        self.need.clear();
        for (name, gf) in &self.global {
            let lf = self.local.get(name);
            let newer = match lf {
                Some(lf) => gf.newer_than(lf),
                None => true,
            };
            if !newer {
                continue;
            }
            if gf.is_invalid() {
                continue;
            }
            if gf.is_deleted() && !self.delete {
                continue;
            }
            if gf.is_deleted() && lf.is_none() {
                continue;
            }
            if self.traces(TraceCategory::Need) {
                debug!("need {:?}: local={:?} global={:?}", name, lf, gf);
            }
            self.need.insert(name.clone());
        }
    }

    /// Convert names present in the old local index but missing from
    /// `new_local` into deletion tombstones, provided we held a version at
    /// least as new as the global one. Names where the cluster knows a newer
    /// version are left out; they will be re-fetched or their deletion will
    /// arrive from the peer that witnessed it.
    pub(crate) fn mark_deleted_locals(&self, new_local: &mut HashMap<String, File>) -> bool {
        let mut updated = false;
        for (name, f) in &self.local {
            if new_local.contains_key(name) {
                continue;
            }
            let global_is_newer = self
                .global
                .get(name)
                .map(|gf| gf.newer_than(f))
                .unwrap_or(false);
            if global_is_newer {
                continue;
            }
            let mut tombstone = f.clone();
            if !tombstone.is_deleted() {
                tombstone.flags = FLAG_DELETED;
                tombstone.version += 1;
                tombstone.blocks.clear();
                updated = true;
            }
            new_local.insert(name.clone(), tombstone);
        }
        updated
    }

    pub(crate) fn update_local(&mut self, f: File) {
        match self.local.get(&f.name) {
            Some(existing) if existing.same_version(&f) => {}
            _ => {
                self.local.insert(f.name.clone(), f);
                self.recompute_global();
                self.recompute_need();
                self.updated_local = Utc::now().timestamp();
                self.last_idx_bcast_request = Instant::now();
            }
        }
    }

    pub(crate) fn protocol_index(&self) -> Vec<FileInfo> {
        let mut index = Vec::with_capacity(self.local.len());
        for f in self.local.values() {
            let info = FileInfo::from(f);
            self.trace_record("idx out", &info);
            index.push(info);
        }
        index
    }

    /// Peers whose record for `name` matches the global version, sorted by
    /// peer id so fetcher assignment is deterministic.
    pub(crate) fn who_has(&self, name: &str) -> Vec<String> {
        let Some(gf) = self.global.get(name) else {
            return Vec::new();
        };
        let mut peers: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, files)| {
                files
                    .get(name)
                    .map(|f| f.same_version(gf))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    fn should_suppress_change(&mut self, name: &str) -> bool {
        let since = self.file_last_changed.get(name).map(Instant::elapsed);
        let count = self.file_was_suppressed.get(name).copied().unwrap_or(0);
        if suppress::should_suppress(since, count) {
            self.file_was_suppressed.insert(name.to_string(), count + 1);
            true
        } else {
            self.file_was_suppressed.insert(name.to_string(), 0);
            self.file_last_changed
                .insert(name.to_string(), Instant::now());
            false
        }
    }
}

fn count<'a>(files: impl Iterator<Item = &'a File>) -> SizeCounts {
    let mut counts = SizeCounts::default();
    for f in files {
        if f.is_deleted() {
            counts.deleted += 1;
        } else {
            counts.files += 1;
            counts.bytes += f.size();
        }
    }
    counts
}

//! The cache proper: the pod/container graph, pending-change tracking,
//! the policy-entry store and snapshot persistence.
//!
//! The cache is exclusively owned; every operation takes `&self` or
//! `&mut self` and an embedding daemon shares it behind one mutex. All
//! mutating operations are followed by a snapshot write; a failed write
//! surfaces to the caller but the in-memory mutation stands.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use resmgr_topology::sysfs;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::{
    affinity::{self, Affinity, DuplicateImplicitAffinitySnafu, ImplicitAffinity},
    annotations,
    container::{Container, ContainerEval, ContainerState, Controller},
    messages::{ContainerCreateResponse, ContainerIngress, PodIngress, PodListEntry},
    metrics::MetricsRing,
    pod::{Pod, PodState},
    resources::estimate_requirements,
    store::{Cachable, CacheEntry, PolicyStore},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid message: {reason}"))]
    InvalidMessage { reason: String },

    #[snafu(display("pod {id:?} not found"))]
    PodNotFound { id: String },

    #[snafu(display("container {id:?} not found"))]
    ContainerNotFound { id: String },

    #[snafu(display("container {id:?} already has a pending runtime request"))]
    DuplicatePendingRequest { id: String },

    #[snafu(display("snapshot version mismatch: expected {expected:?}, got {got:?}"))]
    SnapshotVersionMismatch { expected: String, got: String },

    #[snafu(display("snapshot file {} is corrupt", path.display()))]
    SnapshotCorrupt {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read cache snapshot {}", path.display()))]
    ReadSnapshot {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize cache snapshot"))]
    SerializeSnapshot { source: serde_json::Error },

    #[snafu(display("failed to persist cache snapshot to {}", path.display()))]
    PersistSnapshot {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create cache directory {}", path.display()))]
    CreateCacheDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create container directory {}", path.display()))]
    CreateContainerDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("invalid affinity annotation on pod {pod:?}"))]
    InvalidAffinity {
        source: affinity::Error,
        pod: String,
    },

    #[snafu(display("failed to store policy entry"))]
    StoreEntry { source: crate::store::Error },
}

/// Version string of the snapshot format.
pub const SNAPSHOT_VERSION: &str = "1";

const SNAPSHOT_FILE: &str = "cache";
const CONTAINERS_DIR: &str = "containers";

const SNAPSHOT_FILE_MODE: u32 = 0o644;
const CACHE_DIR_MODE: u32 = 0o710;
const CONTAINER_DIR_MODE: u32 = 0o755;

/// Ring capacity of per-container metric series.
const METRICS_CAPACITY: usize = 60;

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Directory holding the snapshot file and container data dirs.
    pub cache_dir: PathBuf,

    /// sysfs root used for topology-hint derivation.
    pub sys_dir: PathBuf,

    /// procfs root; `meminfo` supplies the memory capacity used in
    /// resource estimation.
    pub proc_dir: PathBuf,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/resmgr"),
            sys_dir: PathBuf::from("/sys"),
            proc_dir: PathBuf::from("/proc"),
        }
    }
}

/// Entries added and removed by a refresh against a full runtime listing.
#[derive(Debug, Default)]
pub struct RefreshResult {
    pub added_pods: Vec<String>,
    pub removed_pods: Vec<Pod>,
    pub added_containers: Vec<String>,
    pub removed_containers: Vec<Container>,
}

#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    sys_dir: PathBuf,
    mem_capacity: u64,

    pods: BTreeMap<String, Pod>,

    /// Containers owned here, keyed by cache id only.
    containers: BTreeMap<String, Container>,

    /// Runtime id to cache id.
    runtime_index: HashMap<String, String>,

    /// Cache ids of containers with a non-empty pending set, in marking
    /// order.
    pending: IndexSet<String>,

    next_id: u64,
    cfg: Option<serde_json::Value>,
    policy_name: String,
    store: PolicyStore,

    implicit_affinities: BTreeMap<String, ImplicitAffinity>,
    metrics: BTreeMap<String, MetricsRing>,
}

impl Cache {
    /// Opens (or creates) the cache under the configured directory and
    /// restores the previous snapshot if one exists.
    pub fn new(options: CacheOptions) -> Result<Self> {
        create_dir(&options.cache_dir, CACHE_DIR_MODE)
            .context(CreateCacheDirSnafu { path: &options.cache_dir })?;
        let containers_dir = options.cache_dir.join(CONTAINERS_DIR);
        create_dir(&containers_dir, CACHE_DIR_MODE)
            .context(CreateCacheDirSnafu { path: &containers_dir })?;

        let mem_capacity = match sysfs::read_meminfo(&options.proc_dir, "meminfo") {
            Ok(meminfo) => meminfo.total,
            Err(err) => {
                warn!(error = %err, "failed to read memory capacity, estimation degraded");
                0
            }
        };

        let mut cache = Self {
            dir: options.cache_dir,
            sys_dir: options.sys_dir,
            mem_capacity,
            pods: BTreeMap::new(),
            containers: BTreeMap::new(),
            runtime_index: HashMap::new(),
            pending: IndexSet::new(),
            next_id: 1,
            cfg: None,
            policy_name: String::new(),
            store: PolicyStore::default(),
            implicit_affinities: BTreeMap::new(),
            metrics: BTreeMap::new(),
        };
        cache.load()?;
        Ok(cache)
    }

    // ---- pods ----

    /// Inserts (or re-inserts) a pod from a runtime message and persists.
    /// The QoS class of an already-known pod is never changed.
    pub fn insert_pod(&mut self, id: impl Into<String>, message: PodIngress) -> Result<&Pod> {
        let id = id.into();
        let pod = self.pod_from_message(&id, message)?;
        self.store_pod(pod);
        self.persist()?;
        self.pods
            .get(&id)
            .context(PodNotFoundSnafu { id })
    }

    fn pod_from_message(&self, id: &str, message: PodIngress) -> Result<Pod> {
        let mut pod = match message {
            PodIngress::CreateRequest(request) => Pod::from_create_request(id, request),
            PodIngress::ListEntry(entry) => {
                ensure!(
                    entry.id == id,
                    InvalidMessageSnafu {
                        reason: format!("list entry carries id {:?}, expected {id:?}", entry.id),
                    }
                );
                Pod::from_list_entry(entry)
            }
        };
        if let Some(existing) = self.pods.get(id) {
            pod.qos_class = existing.qos_class;
        }
        Ok(pod)
    }

    fn store_pod(&mut self, pod: Pod) {
        debug!(pod = %pod.name, id = %pod.id, "inserting pod");
        self.pods.insert(pod.id.clone(), pod);
    }

    /// Removes a pod. Containers are not cascaded; they are purged by the
    /// next refresh.
    pub fn delete_pod(&mut self, id: &str) -> Result<Option<Pod>> {
        let pod = self.pods.remove(id);
        if pod.is_some() {
            self.persist()?;
        }
        Ok(pod)
    }

    pub fn lookup_pod(&self, id: &str) -> Option<&Pod> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    // ---- containers ----

    /// Inserts a container from a runtime message, binding it to its pod,
    /// deriving requirements and topology hints, and creating its data
    /// directory. Returns the allocated cache id.
    pub fn insert_container(&mut self, message: ContainerIngress) -> Result<String> {
        let cache_id = self.insert_container_unpersisted(message)?;
        self.persist()?;
        Ok(cache_id)
    }

    fn insert_container_unpersisted(&mut self, message: ContainerIngress) -> Result<String> {
        let (pod_id, runtime_id) = match &message {
            ContainerIngress::CreateRequest(request) => {
                (request.pod_sandbox_id.clone(), String::new())
            }
            ContainerIngress::ListEntry(entry) => {
                (entry.pod_sandbox_id.clone(), entry.id.clone())
            }
        };

        let pod = self
            .pods
            .get(&pod_id)
            .context(PodNotFoundSnafu { id: &pod_id })?
            .clone();

        let name = match &message {
            ContainerIngress::CreateRequest(request) => &request.name,
            ContainerIngress::ListEntry(entry) => &entry.name,
        };
        let cache_id = self.allocate_cache_id(&pod.uid, name);

        let mut container = match message {
            ContainerIngress::CreateRequest(request) => {
                Container::from_create_request(&cache_id, request, &pod)
            }
            ContainerIngress::ListEntry(entry) => {
                Container::from_list_entry(&cache_id, entry, &pod)
            }
        };

        container.requirements = match pod.container_requirements(&container.name) {
            Some(requirements) => requirements.clone(),
            None => estimate_requirements(container.resources(), pod.qos_class, self.mem_capacity),
        };

        if self.hints_enabled(&pod, &container.name) {
            container.collect_hints(&self.sys_dir);
        }

        let data_dir = self.container_dir(&cache_id);
        create_dir(&data_dir, CONTAINER_DIR_MODE)
            .context(CreateContainerDirSnafu { path: &data_dir })?;

        debug!(container = %container.pretty_name(), id = %cache_id, "inserting container");
        if !runtime_id.is_empty() {
            self.runtime_index.insert(runtime_id, cache_id.clone());
        }
        self.containers.insert(cache_id.clone(), container);
        Ok(cache_id)
    }

    fn hints_enabled(&self, pod: &Pod, container_name: &str) -> bool {
        annotations::effective_annotation(
            &pod.annotations,
            annotations::TOPOLOGY_HINTS,
            container_name,
        )
        .and_then(annotations::parse_bool)
        .unwrap_or(true)
    }

    /// Cache ids are `<pod-uid>:<name>` when the uid is known, otherwise
    /// a counter in hex. Counter-based ids are never replaced, so a
    /// late-arriving uid cannot collide with them.
    fn allocate_cache_id(&mut self, pod_uid: &str, name: &str) -> String {
        if !pod_uid.is_empty() {
            return format!("{pod_uid}:{name}");
        }
        let id = format!("cache:{:x}", self.next_id);
        self.next_id += 1;
        id
    }

    /// Records the runtime id from the create response and indexes the
    /// container under it.
    pub fn update_container_id(
        &mut self,
        cache_id: &str,
        response: &ContainerCreateResponse,
    ) -> Result<()> {
        let container = self
            .containers
            .get_mut(cache_id)
            .context(ContainerNotFoundSnafu { id: cache_id })?;
        container.runtime_id = response.container_id.clone();
        self.runtime_index
            .insert(response.container_id.clone(), cache_id.to_owned());
        self.persist()
    }

    /// Removes a container by either id, along with its data directory,
    /// metrics and index entries.
    pub fn delete_container(&mut self, id: &str) -> Result<Option<Container>> {
        let Some(cache_id) = self.resolve_cache_id(id) else {
            return Ok(None);
        };
        let Some(container) = self.remove_container_entry(&cache_id) else {
            return Ok(None);
        };

        debug!(container = %container.pretty_name(), id = %cache_id, "deleted container");
        self.persist()?;
        Ok(Some(container))
    }

    /// Drops a container from the owning map, both indices, its metrics
    /// and its on-disk data directory. Does not persist.
    fn remove_container_entry(&mut self, cache_id: &str) -> Option<Container> {
        let container = self.containers.remove(cache_id)?;
        if !container.runtime_id.is_empty() {
            self.runtime_index.remove(&container.runtime_id);
        }
        self.pending.shift_remove(cache_id);
        self.metrics.remove(cache_id);
        remove_dir(&self.container_dir(cache_id));
        Some(container)
    }

    /// Looks a container up by cache id or runtime id.
    pub fn lookup_container(&self, id: &str) -> Option<&Container> {
        let cache_id = self.resolve_cache_id(id)?;
        self.containers.get(&cache_id)
    }

    fn resolve_cache_id(&self, id: &str) -> Option<String> {
        if self.containers.contains_key(id) {
            return Some(id.to_owned());
        }
        self.runtime_index.get(id).cloned()
    }

    /// Finds the container a cgroup path belongs to: the owning pod's
    /// cgroup parent must prefix the path and the container's runtime id
    /// must appear in it. First match in cache-id order wins.
    pub fn lookup_container_by_cgroup(&self, path: &str) -> Option<&Container> {
        self.containers.values().find(|container| {
            if container.runtime_id.is_empty() {
                return false;
            }
            let Some(pod) = self.pods.get(&container.pod_id) else {
                return false;
            };
            !pod.cgroup_parent.is_empty()
                && path.starts_with(&pod.cgroup_parent)
                && path.contains(&container.runtime_id)
        })
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Containers of one pod.
    pub fn pod_containers(&self, pod_id: &str) -> impl Iterator<Item = &Container> {
        self.containers
            .values()
            .filter(move |container| container.pod_id == pod_id)
    }

    /// The per-container scratch directory, derived from the cache id.
    pub fn container_dir(&self, cache_id: &str) -> PathBuf {
        self.dir
            .join(CONTAINERS_DIR)
            .join(cache_id.replace(':', "-"))
    }

    // ---- refresh ----

    /// Reconciles the pod set against a full sandbox listing: unknown
    /// entries are inserted, known ones get their state updated, and
    /// anything absent goes Stale and is removed together with its
    /// containers.
    pub fn refresh_pods(&mut self, listing: Vec<PodListEntry>) -> Result<RefreshResult> {
        let mut result = RefreshResult::default();

        let mut listed: IndexSet<String> = IndexSet::new();
        for entry in listing {
            listed.insert(entry.id.clone());
            match self.pods.get_mut(&entry.id) {
                Some(pod) => pod.state = entry.state,
                None => {
                    let id = entry.id.clone();
                    let pod = self.pod_from_message(&id, PodIngress::ListEntry(entry))?;
                    self.store_pod(pod);
                    result.added_pods.push(id);
                }
            }
        }

        let gone: Vec<String> = self
            .pods
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for pod_id in gone {
            let Some(mut pod) = self.pods.remove(&pod_id) else {
                continue;
            };
            pod.state = PodState::Stale;

            let orphans: Vec<String> = self
                .containers
                .values()
                .filter(|container| container.pod_id == pod_id)
                .map(|container| container.cache_id.clone())
                .collect();
            for cache_id in orphans {
                if let Some(mut container) = self.remove_container_entry(&cache_id) {
                    container.state = ContainerState::Stale;
                    result.removed_containers.push(container);
                }
            }

            result.removed_pods.push(pod);
        }

        self.persist()?;
        Ok(result)
    }

    /// Reconciles the container set against a full container listing.
    pub fn refresh_containers(
        &mut self,
        listing: Vec<crate::messages::ContainerListEntry>,
    ) -> Result<RefreshResult> {
        let mut result = RefreshResult::default();

        let mut listed_runtime_ids: IndexSet<String> = IndexSet::new();
        for entry in listing {
            listed_runtime_ids.insert(entry.id.clone());
            match self.resolve_cache_id(&entry.id) {
                Some(cache_id) => {
                    if let Some(container) = self.containers.get_mut(&cache_id) {
                        container.state = entry.state;
                    }
                }
                None => {
                    if self.pods.contains_key(&entry.pod_sandbox_id) {
                        let cache_id =
                            self.insert_container_unpersisted(ContainerIngress::ListEntry(entry))?;
                        result.added_containers.push(cache_id);
                    } else {
                        warn!(
                            container = %entry.name,
                            pod = %entry.pod_sandbox_id,
                            "skipping listed container of unknown pod"
                        );
                    }
                }
            }
        }

        let gone: Vec<String> = self
            .containers
            .values()
            .filter(|container| {
                // Containers still waiting for their create response have
                // no runtime id and cannot appear in the listing yet.
                !container.runtime_id.is_empty()
                    && !listed_runtime_ids.contains(&container.runtime_id)
            })
            .map(|container| container.cache_id.clone())
            .collect();

        for cache_id in gone {
            if let Some(mut container) = self.remove_container_entry(&cache_id) {
                container.state = ContainerState::Stale;
                result.removed_containers.push(container);
            }
        }

        self.persist()?;
        Ok(result)
    }

    // ---- pending ----

    /// Applies a mutation closure to a container and re-syncs the pending
    /// index afterwards.
    pub fn edit_container<R>(
        &mut self,
        id: &str,
        edit: impl FnOnce(&mut Container) -> R,
    ) -> Result<R> {
        let cache_id = self
            .resolve_cache_id(id)
            .context(ContainerNotFoundSnafu { id })?;
        let container = self
            .containers
            .get_mut(&cache_id)
            .context(ContainerNotFoundSnafu { id })?;

        let result = edit(container);
        let has_pending = !container.pending_controllers().is_empty();
        if has_pending {
            self.pending.insert(cache_id);
        } else {
            self.pending.shift_remove(&cache_id);
        }

        self.persist()?;
        Ok(result)
    }

    /// Containers with any pending controller, in marking order.
    pub fn pending_containers(&self) -> Vec<&Container> {
        self.pending
            .iter()
            .filter_map(|id| self.containers.get(id))
            .collect()
    }

    /// Clears one controller's pending tag, dropping the index entry when
    /// the container has nothing pending anymore.
    pub fn clear_pending(&mut self, id: &str, controller: Controller) -> Result<()> {
        let cache_id = self
            .resolve_cache_id(id)
            .context(ContainerNotFoundSnafu { id })?;
        let container = self
            .containers
            .get_mut(&cache_id)
            .context(ContainerNotFoundSnafu { id })?;

        container.clear_pending(controller);
        if container.pending_controllers().is_empty() {
            self.pending.shift_remove(&cache_id);
        }
        self.persist()
    }

    /// Parks the payload of an in-flight runtime request on a container.
    /// Only one may be pending at a time.
    pub fn set_pending_request(&mut self, id: &str, payload: serde_json::Value) -> Result<()> {
        let cache_id = self
            .resolve_cache_id(id)
            .context(ContainerNotFoundSnafu { id })?;
        let container = self
            .containers
            .get_mut(&cache_id)
            .context(ContainerNotFoundSnafu { id })?;

        ensure!(
            container.set_pending_request(payload),
            DuplicatePendingRequestSnafu { id }
        );
        self.persist()
    }

    pub fn take_pending_request(&mut self, id: &str) -> Result<Option<serde_json::Value>> {
        let cache_id = self
            .resolve_cache_id(id)
            .context(ContainerNotFoundSnafu { id })?;
        let container = self
            .containers
            .get_mut(&cache_id)
            .context(ContainerNotFoundSnafu { id })?;

        let payload = container.take_pending_request();
        self.persist()?;
        Ok(payload)
    }

    // ---- affinity ----

    /// Registers a policy-supplied implicit affinity. Names are unique
    /// across all registrations.
    pub fn register_implicit_affinity(
        &mut self,
        implicit: ImplicitAffinity,
    ) -> Result<(), affinity::Error> {
        snafu::ensure!(
            !self.implicit_affinities.contains_key(&implicit.name),
            DuplicateImplicitAffinitySnafu { name: &implicit.name }
        );
        self.implicit_affinities
            .insert(implicit.name.clone(), implicit);
        Ok(())
    }

    /// The affinities of one container: annotation-derived entries first,
    /// then every implicit affinity whose predicate accepts the
    /// container.
    pub fn container_affinities(&self, id: &str) -> Result<Vec<Affinity>> {
        let container = self
            .lookup_container(id)
            .context(ContainerNotFoundSnafu { id })?;

        let mut affinities = Vec::new();
        if let Some(pod) = self.pods.get(&container.pod_id) {
            let map = pod
                .affinity_map()
                .context(InvalidAffinitySnafu { pod: &pod.name })?;
            if let Some(own) = map.get(&container.name) {
                affinities.extend(own.iter().cloned());
            }
        }

        for implicit in self.implicit_affinities.values() {
            if implicit.applies_to(container) {
                affinities.push(implicit.affinity.clone());
            }
        }

        Ok(affinities)
    }

    /// Evaluates one affinity over the whole cache: the weight lands on
    /// every container that is in scope and matches.
    pub fn evaluate_affinity(&self, affinity: &Affinity) -> BTreeMap<String, i32> {
        self.containers
            .values()
            .filter_map(|container| {
                let eval = self.evaluable(container);
                (affinity.scope.evaluate(&eval) && affinity.match_expr.evaluate(&eval))
                    .then(|| (container.cache_id.clone(), affinity.weight))
            })
            .collect()
    }

    /// An expression-engine view of a container within this cache.
    pub fn evaluable<'a>(&'a self, container: &'a Container) -> ContainerEval<'a> {
        ContainerEval {
            container,
            pod: self.pods.get(&container.pod_id),
        }
    }

    // ---- metrics ----

    /// Appends a usage sample to the container's metric ring.
    pub fn record_metric(&mut self, id: &str, value: f64) -> Result<()> {
        let cache_id = self
            .resolve_cache_id(id)
            .context(ContainerNotFoundSnafu { id })?;
        self.metrics
            .entry(cache_id)
            .or_insert_with(|| MetricsRing::new(METRICS_CAPACITY))
            .push(value);
        Ok(())
    }

    pub fn container_metrics(&self, id: &str) -> Option<&MetricsRing> {
        let cache_id = self.resolve_cache_id(id)?;
        self.metrics.get(&cache_id)
    }

    // ---- policy store, config ----

    pub fn set_policy_entry<T>(&mut self, key: &str, value: T) -> Result<()>
    where
        T: CacheEntry + Any,
    {
        self.store.set(key, value).context(StoreEntrySnafu)?;
        self.persist()
    }

    pub fn get_policy_entry<T>(&mut self, key: &str) -> Option<T>
    where
        T: CacheEntry + Any + Clone,
    {
        self.store.get(key)
    }

    pub fn set_cachable_entry(&mut self, key: &str, value: &dyn Cachable) -> Result<()> {
        self.store.set_cachable(key, value).context(StoreEntrySnafu)?;
        self.persist()
    }

    pub fn get_cachable_entry(&self, key: &str, into: &mut dyn Cachable) -> bool {
        self.store.get_cachable(key, into)
    }

    pub fn set_policy_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.policy_name = name.into();
        self.persist()
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    /// Replaces the cached raw configuration. This is the one mutation
    /// that reverts when the snapshot write fails.
    pub fn set_config(&mut self, cfg: serde_json::Value) -> Result<()> {
        let previous = self.cfg.replace(cfg);
        if let Err(err) = self.persist() {
            self.cfg = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn get_config(&self) -> Option<&serde_json::Value> {
        self.cfg.as_ref()
    }

    // ---- persistence ----

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Serializes the full cache state and writes it to the snapshot
    /// file.
    pub fn persist(&self) -> Result<()> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            pods: &self.pods,
            containers: &self.containers,
            next_id: self.next_id,
            cfg: &self.cfg,
            policy_name: &self.policy_name,
            policy_json: self.store.to_json_map(),
        };
        let json = serde_json::to_vec(&snapshot).context(SerializeSnapshotSnafu)?;

        let path = self.snapshot_path();
        fs::write(&path, json).context(PersistSnapshotSnafu { path: &path })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(SNAPSHOT_FILE_MODE))
            .context(PersistSnapshotSnafu { path: &path })?;
        Ok(())
    }

    /// Restores state from the snapshot file. An absent or empty file
    /// starts fresh; a version mismatch or unparseable content is an
    /// error the embedding daemon has to resolve.
    fn load(&mut self) -> Result<()> {
        let path = self.snapshot_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context(ReadSnapshotSnafu { path }),
        };
        if raw.trim().is_empty() {
            return Ok(());
        }

        let snapshot: Snapshot =
            serde_json::from_str(&raw).context(SnapshotCorruptSnafu { path })?;
        ensure!(
            snapshot.version == SNAPSHOT_VERSION,
            SnapshotVersionMismatchSnafu {
                expected: SNAPSHOT_VERSION,
                got: snapshot.version,
            }
        );

        self.pods = snapshot.pods;
        self.containers = snapshot.containers;
        self.next_id = snapshot.next_id;
        self.cfg = snapshot.cfg;
        self.policy_name = snapshot.policy_name;
        self.store.load_json_map(snapshot.policy_json);

        self.runtime_index = self
            .containers
            .values()
            .filter(|container| !container.runtime_id.is_empty())
            .map(|container| (container.runtime_id.clone(), container.cache_id.clone()))
            .collect();
        self.pending = self
            .containers
            .values()
            .filter(|container| !container.pending_controllers().is_empty())
            .map(|container| container.cache_id.clone())
            .collect();

        debug!(
            pods = self.pods.len(),
            containers = self.containers.len(),
            "cache restored from snapshot"
        );
        Ok(())
    }
}

/// Serialization side of the snapshot document.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    #[serde(rename = "Version")]
    version: &'a str,

    #[serde(rename = "Pods")]
    pods: &'a BTreeMap<String, Pod>,

    #[serde(rename = "Containers")]
    containers: &'a BTreeMap<String, Container>,

    #[serde(rename = "NextID")]
    next_id: u64,

    #[serde(rename = "Cfg")]
    cfg: &'a Option<serde_json::Value>,

    #[serde(rename = "PolicyName")]
    policy_name: &'a str,

    #[serde(rename = "PolicyJSON")]
    policy_json: BTreeMap<String, String>,
}

/// Deserialization side of the snapshot document.
#[derive(Deserialize)]
struct Snapshot {
    #[serde(rename = "Version")]
    version: String,

    #[serde(rename = "Pods")]
    pods: BTreeMap<String, Pod>,

    #[serde(rename = "Containers")]
    containers: BTreeMap<String, Container>,

    #[serde(rename = "NextID")]
    next_id: u64,

    #[serde(rename = "Cfg", default)]
    cfg: Option<serde_json::Value>,

    #[serde(rename = "PolicyName", default)]
    policy_name: String,

    #[serde(rename = "PolicyJSON", default)]
    policy_json: BTreeMap<String, String>,
}

fn create_dir(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn remove_dir(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove container directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use resmgr_idset::CpuSet;

    use super::*;
    use crate::{
        expression::{Expression, Operator},
        messages::{ContainerCreateRequest, ContainerListEntry, PodCreateRequest},
        resources::LinuxResources,
    };

    fn test_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        (dir, cache)
    }

    fn open_cache(dir: &tempfile::TempDir) -> Cache {
        std::fs::create_dir_all(dir.path().join("proc")).unwrap();
        std::fs::write(
            dir.path().join("proc/meminfo"),
            "MemTotal: 16777216 kB\nMemFree: 8388608 kB\n",
        )
        .unwrap();

        Cache::new(CacheOptions {
            cache_dir: dir.path().join("cache"),
            sys_dir: dir.path().join("sys"),
            proc_dir: dir.path().join("proc"),
        })
        .unwrap()
    }

    fn pod_request(name: &str, uid: &str) -> PodIngress {
        PodIngress::CreateRequest(PodCreateRequest {
            name: name.to_owned(),
            namespace: "default".to_owned(),
            uid: uid.to_owned(),
            ..PodCreateRequest::default()
        })
    }

    fn container_request(pod_id: &str, name: &str) -> ContainerIngress {
        ContainerIngress::CreateRequest(ContainerCreateRequest {
            pod_sandbox_id: pod_id.to_owned(),
            name: name.to_owned(),
            ..ContainerCreateRequest::default()
        })
    }

    fn list_entry(id: &str, pod_id: &str, name: &str) -> ContainerListEntry {
        ContainerListEntry {
            id: id.to_owned(),
            pod_sandbox_id: pod_id.to_owned(),
            name: name.to_owned(),
            state: ContainerState::Running,
            ..ContainerListEntry::default()
        }
    }

    #[test]
    fn container_reachable_by_both_ids() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        let cache_id = cache.insert_container(container_request("sb1", "c1")).unwrap();
        assert_eq!(cache_id, "u1:c1");

        assert!(cache.lookup_container("u1:c1").is_some());
        assert!(cache.lookup_container("r1").is_none());

        cache
            .update_container_id(
                &cache_id,
                &ContainerCreateResponse {
                    container_id: "r1".to_owned(),
                },
            )
            .unwrap();

        let by_cache = cache.lookup_container("u1:c1").unwrap().cache_id.clone();
        let by_runtime = cache.lookup_container("r1").unwrap().cache_id.clone();
        assert_eq!(by_cache, by_runtime);
    }

    #[test]
    fn counter_ids_when_pod_uid_unknown() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "")).unwrap();

        let first = cache.insert_container(container_request("sb1", "c1")).unwrap();
        let second = cache.insert_container(container_request("sb1", "c2")).unwrap();
        assert_eq!(first, "cache:1");
        assert_eq!(second, "cache:2");
    }

    #[test]
    fn insert_container_requires_pod() {
        let (_dir, mut cache) = test_cache();
        let err = cache
            .insert_container(container_request("nosuch", "c1"))
            .unwrap_err();
        assert!(matches!(err, Error::PodNotFound { .. }));
    }

    #[test]
    fn delete_container_by_runtime_id() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        let cache_id = cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache
            .update_container_id(
                &cache_id,
                &ContainerCreateResponse {
                    container_id: "r1".to_owned(),
                },
            )
            .unwrap();

        let data_dir = cache.container_dir(&cache_id);
        assert!(data_dir.exists());

        let removed = cache.delete_container("r1").unwrap().unwrap();
        assert_eq!(removed.cache_id, "u1:c1");
        assert!(cache.lookup_container("u1:c1").is_none());
        assert!(cache.lookup_container("r1").is_none());
        assert!(!data_dir.exists());
    }

    #[test]
    fn qos_class_is_immutable_per_pod() {
        let (_dir, mut cache) = test_cache();
        let qos = cache
            .insert_pod(
                "sb1",
                PodIngress::CreateRequest(PodCreateRequest {
                    name: "pod1".to_owned(),
                    namespace: "default".to_owned(),
                    uid: "u1".to_owned(),
                    cgroup_parent: "/kubepods/burstable/podu1".to_owned(),
                    ..PodCreateRequest::default()
                }),
            )
            .unwrap()
            .qos_class;
        assert_eq!(qos, crate::pod::QosClass::Burstable);

        // Re-inserting with different cgroup data keeps the class.
        let qos = cache
            .insert_pod("sb1", pod_request("pod1", "u1"))
            .unwrap()
            .qos_class;
        assert_eq!(qos, crate::pod::QosClass::Burstable);
    }

    #[test]
    fn pending_index_tracks_pending_sets() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache.insert_container(container_request("sb1", "c2")).unwrap();

        assert!(cache.pending_containers().is_empty());

        cache
            .edit_container("u1:c2", |c| c.set_cpuset_cpus("0-1".parse().unwrap()))
            .unwrap();
        cache
            .edit_container("u1:c2", |c| c.set_rdt_class(Some("gold".to_owned())))
            .unwrap();

        let pending: Vec<&str> = cache
            .pending_containers()
            .iter()
            .map(|c| c.cache_id.as_str())
            .collect();
        assert_eq!(pending, ["u1:c2"]);

        // Clearing one controller keeps the entry, clearing both drops it.
        cache.clear_pending("u1:c2", Controller::Cri).unwrap();
        assert_eq!(cache.pending_containers().len(), 1);
        cache.clear_pending("u1:c2", Controller::Rdt).unwrap();
        assert!(cache.pending_containers().is_empty());
    }

    #[test]
    fn second_pending_request_is_rejected() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();

        cache
            .set_pending_request("u1:c1", serde_json::json!({"op": "update"}))
            .unwrap();
        let err = cache
            .set_pending_request("u1:c1", serde_json::json!({"op": "again"}))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePendingRequest { .. }));

        assert!(cache.take_pending_request("u1:c1").unwrap().is_some());
        cache
            .set_pending_request("u1:c1", serde_json::json!({"op": "again"}))
            .unwrap();
    }

    /// Scenario: a global affinity lands its weight on exactly the
    /// matching containers.
    #[test]
    fn global_affinity_evaluation() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        for (name, labeled) in [("a", true), ("b", false), ("c", true)] {
            let mut request = ContainerCreateRequest {
                pod_sandbox_id: "sb1".to_owned(),
                name: name.to_owned(),
                ..ContainerCreateRequest::default()
            };
            if labeled {
                request.labels.insert("workload".to_owned(), "foo".to_owned());
            }
            cache
                .insert_container(ContainerIngress::CreateRequest(request))
                .unwrap();
        }

        let affinity = Affinity::global(
            Expression::new("labels/workload", Operator::Equals, ["foo"]),
            5,
        );
        let weights = cache.evaluate_affinity(&affinity);

        assert_eq!(
            weights,
            BTreeMap::from([("u1:a".to_owned(), 5), ("u1:c".to_owned(), 5)])
        );
    }

    #[test]
    fn implicit_affinities_appended_for_eligible_containers() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache.insert_container(container_request("sb1", "c2")).unwrap();

        cache
            .register_implicit_affinity(ImplicitAffinity {
                name: "colocate-db".to_owned(),
                eligible: Some(Box::new(|container| container.name == "c1")),
                affinity: Affinity::global(
                    Expression::new("labels/role", Operator::Equals, ["db"]),
                    10,
                ),
            })
            .unwrap();

        assert_eq!(cache.container_affinities("u1:c1").unwrap().len(), 1);
        assert!(cache.container_affinities("u1:c2").unwrap().is_empty());

        let err = cache
            .register_implicit_affinity(ImplicitAffinity {
                name: "colocate-db".to_owned(),
                eligible: None,
                affinity: Affinity::global(Expression::always_true(), 1),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            affinity::Error::DuplicateImplicitAffinity { .. }
        ));
    }

    /// Scenario: snapshot, reopen, and find pods, containers and policy
    /// entries intact.
    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_cache(&dir);

        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        for (name, cpus) in [("c1", "0-1"), ("c2", "2-3")] {
            cache
                .insert_container(ContainerIngress::CreateRequest(ContainerCreateRequest {
                    pod_sandbox_id: "sb1".to_owned(),
                    name: name.to_owned(),
                    resources: LinuxResources {
                        cpuset_cpus: cpus.parse().unwrap(),
                        ..LinuxResources::default()
                    },
                    ..ContainerCreateRequest::default()
                }))
                .unwrap();
        }
        let cpus: CpuSet = "0-3,7".parse().unwrap();
        cache.set_policy_entry("cpus", cpus.clone()).unwrap();
        cache.set_policy_name("topology-aware").unwrap();
        cache.set_config(serde_json::json!({"reserved": "750m"})).unwrap();

        let original_c1 = cache.lookup_container("u1:c1").unwrap().clone();

        drop(cache);
        let mut restored = open_cache(&dir);

        assert_eq!(restored.get_policy_entry::<CpuSet>("cpus"), Some(cpus));
        assert_eq!(restored.policy_name(), "topology-aware");
        assert_eq!(
            restored.get_config(),
            Some(&serde_json::json!({"reserved": "750m"}))
        );
        assert_eq!(restored.lookup_pod("sb1").map(|p| p.uid.as_str()), Some("u1"));
        assert_eq!(restored.lookup_container("u1:c1"), Some(&original_c1));
        assert_eq!(
            restored
                .lookup_container("u1:c2")
                .unwrap()
                .resources()
                .cpuset_cpus
                .to_string(),
            "2-3"
        );
    }

    #[test]
    fn restore_after_snapshot_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_cache(&dir);
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache.set_policy_entry("limit", 42_u64).unwrap();

        let first = std::fs::read_to_string(dir.path().join("cache/cache")).unwrap();

        let restored = open_cache(&dir);
        restored.persist().unwrap();
        let second = std::fs::read_to_string(dir.path().join("cache/cache")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn next_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_cache(&dir);
        cache.insert_pod("sb1", pod_request("pod1", "")).unwrap();
        let first = cache.insert_container(container_request("sb1", "c1")).unwrap();
        assert_eq!(first, "cache:1");

        drop(cache);
        let mut restored = open_cache(&dir);
        let second = restored.insert_container(container_request("sb1", "c2")).unwrap();
        assert_eq!(second, "cache:2");
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        drop(cache);

        std::fs::write(dir.path().join("cache/cache"), "not json").unwrap();
        let err = Cache::new(CacheOptions {
            cache_dir: dir.path().join("cache"),
            sys_dir: dir.path().join("sys"),
            proc_dir: dir.path().join("proc"),
        })
        .unwrap_err();
        assert!(matches!(err, Error::SnapshotCorrupt { .. }));
    }

    #[test]
    fn snapshot_version_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        cache.persist().unwrap();
        drop(cache);

        let path = dir.path().join("cache/cache");
        let snapshot = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"Version\":\"1\"", "\"Version\":\"0\"");
        std::fs::write(&path, snapshot).unwrap();

        let err = Cache::new(CacheOptions {
            cache_dir: dir.path().join("cache"),
            sys_dir: dir.path().join("sys"),
            proc_dir: dir.path().join("proc"),
        })
        .unwrap_err();
        assert!(matches!(err, Error::SnapshotVersionMismatch { .. }));
    }

    #[test]
    fn empty_snapshot_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/cache"), "").unwrap();

        let cache = open_cache(&dir);
        assert_eq!(cache.pods().count(), 0);
    }

    /// Scenario: a pod refresh purges unlisted pods and their orphaned
    /// containers.
    #[test]
    fn refresh_purges_unlisted_pods_and_orphans() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_pod("sb2", pod_request("pod2", "u2")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache.insert_container(container_request("sb2", "c1")).unwrap();

        let result = cache
            .refresh_pods(vec![PodListEntry {
                id: "sb1".to_owned(),
                name: "pod1".to_owned(),
                namespace: "default".to_owned(),
                uid: "u1".to_owned(),
                state: PodState::Ready,
                ..PodListEntry::default()
            }])
            .unwrap();

        assert!(result.added_pods.is_empty());
        assert_eq!(result.removed_pods.len(), 1);
        assert_eq!(result.removed_pods[0].id, "sb2");
        assert_eq!(result.removed_pods[0].state, PodState::Stale);
        assert_eq!(result.removed_containers.len(), 1);
        assert_eq!(result.removed_containers[0].cache_id, "u2:c1");
        assert_eq!(result.removed_containers[0].state, ContainerState::Stale);

        assert!(cache.lookup_pod("sb2").is_none());
        assert!(cache.lookup_container("u2:c1").is_none());
        assert!(cache.lookup_container("u1:c1").is_some());
    }

    #[test]
    fn refresh_containers_inserts_and_purges() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        let stale_id = cache.insert_container(container_request("sb1", "gone")).unwrap();
        cache
            .update_container_id(
                &stale_id,
                &ContainerCreateResponse {
                    container_id: "r-gone".to_owned(),
                },
            )
            .unwrap();
        // A container still waiting for its create response survives a
        // refresh that cannot list it yet.
        cache.insert_container(container_request("sb1", "young")).unwrap();

        let result = cache
            .refresh_containers(vec![list_entry("r-new", "sb1", "fresh")])
            .unwrap();

        assert_eq!(result.added_containers, ["u1:fresh"]);
        assert_eq!(result.removed_containers.len(), 1);
        assert_eq!(result.removed_containers[0].cache_id, "u1:gone");
        assert!(cache.lookup_container("u1:young").is_some());
        assert_eq!(
            cache.lookup_container("r-new").map(|c| c.state),
            Some(ContainerState::Running)
        );
    }

    #[test]
    fn lookup_by_cgroup_path() {
        let (_dir, mut cache) = test_cache();
        cache
            .insert_pod(
                "sb1",
                PodIngress::CreateRequest(PodCreateRequest {
                    name: "pod1".to_owned(),
                    namespace: "default".to_owned(),
                    uid: "u1".to_owned(),
                    cgroup_parent: "/kubepods/podu1".to_owned(),
                    ..PodCreateRequest::default()
                }),
            )
            .unwrap();
        let cache_id = cache.insert_container(container_request("sb1", "c1")).unwrap();
        cache
            .update_container_id(
                &cache_id,
                &ContainerCreateResponse {
                    container_id: "r1".to_owned(),
                },
            )
            .unwrap();

        let hit = cache.lookup_container_by_cgroup("/kubepods/podu1/r1/cgroup.procs");
        assert_eq!(hit.map(|c| c.cache_id.as_str()), Some("u1:c1"));

        assert!(cache.lookup_container_by_cgroup("/kubepods/podu2/r9").is_none());
        assert!(cache.lookup_container_by_cgroup("/other/r1").is_none());
    }

    #[test]
    fn metrics_dropped_with_container() {
        let (_dir, mut cache) = test_cache();
        cache.insert_pod("sb1", pod_request("pod1", "u1")).unwrap();
        cache.insert_container(container_request("sb1", "c1")).unwrap();

        cache.record_metric("u1:c1", 1.5).unwrap();
        assert_eq!(cache.container_metrics("u1:c1").map(MetricsRing::len), Some(1));

        cache.delete_container("u1:c1").unwrap();
        assert!(cache.container_metrics("u1:c1").is_none());
    }

    #[test]
    fn set_config_reverts_on_persist_failure() {
        let (dir, mut cache) = test_cache();
        cache.set_config(serde_json::json!({"a": 1})).unwrap();

        // Make the snapshot file unwritable by replacing it with a
        // directory.
        let path = dir.path().join("cache/cache");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = cache.set_config(serde_json::json!({"a": 2})).unwrap_err();
        assert!(matches!(err, Error::PersistSnapshot { .. }));
        assert_eq!(cache.get_config(), Some(&serde_json::json!({"a": 1})));
    }
}

//! In-memory doubles shared by the unit tests
//!
//! The fake container service emulates a trivial "echo" resource when no
//! script behavior is configured: check echoes `source.versions`, in writes
//! the requested version to a `version` file in its destination and out
//! reads the version back from the file named by `params.path`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use skiff_client::{
    ClientError, Container, ContainerService, CreateContainer, Process, ProcessExit, ProcessIo,
    ProcessSpec, Volume, VolumeService, VolumeSpec, VolumeStrategy,
};
use skiff_core::domain::build::BuildStatus;
use skiff_core::domain::container::{
    BindMount, ContainerOwner, ContainerRecord, ContainerSpec, ContainerState,
};
use skiff_core::domain::resource::VersionedResourceTypes;
use skiff_core::domain::worker::{
    Worker as WorkerModel, WorkerLoad, WorkerResourceType, WorkerState,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{PoolError, RegistryError};
use crate::provider::{ClientFactory, WorkerProvider};
use crate::registry::{ContainerRepository, WorkerRegistry};
use crate::repository::container_repository::CHECK_CONTAINER_LIFETIME;
use crate::repository::worker_repository::ensure_prunable;
use crate::resource::{CHECK_SCRIPT, IN_SCRIPT, OUT_SCRIPT};
use crate::worker::Worker;

/// A running linux worker providing the `git` resource type
pub fn worker_model(name: &str) -> WorkerModel {
    WorkerModel {
        name: name.to_string(),
        state: WorkerState::Running,
        garden_addr: Some(format!("{}:7777", name)),
        baggageclaim_url: Some(format!("http://{}:7788", name)),
        http_proxy_url: None,
        https_proxy_url: None,
        no_proxy: None,
        active_containers: 0,
        resource_types: vec![WorkerResourceType {
            type_name: "git".to_string(),
            image: "/images/git".to_string(),
            version: "1".to_string(),
        }],
        platform: "linux".to_string(),
        tags: vec![],
        team: None,
        start_time: 0,
        expires_at: None,
    }
}

fn expiry(ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }

    chrono::Duration::from_std(ttl)
        .ok()
        .map(|ttl| Utc::now() + ttl)
}

// Registry

struct StoredContainer {
    record: ContainerRecord,
    best_if_used_by: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RegistryState {
    workers: BTreeMap<String, WorkerModel>,
    containers: Vec<StoredContainer>,
    builds: HashMap<i64, (BuildStatus, Option<bool>)>,
    next_id: i64,
}

impl RegistryState {
    fn loads(&self) -> HashMap<String, WorkerLoad> {
        let mut loads: HashMap<String, WorkerLoad> = HashMap::new();

        for stored in &self.containers {
            let build = match &stored.record.owner {
                ContainerOwner::Build { build_id, .. } => self.builds.get(build_id).copied(),
                ContainerOwner::ResourceCheck { .. } => None,
            };
            loads
                .entry(stored.record.worker_name.clone())
                .or_default()
                .count_container(build);
        }

        loads
    }

    fn owner_finished(&self, stored: &StoredContainer) -> bool {
        match &stored.record.owner {
            ContainerOwner::Build { build_id, .. } => !self
                .builds
                .get(build_id)
                .is_some_and(|(status, _)| status.is_running()),
            ContainerOwner::ResourceCheck { .. } => stored
                .best_if_used_by
                .is_some_and(|deadline| deadline < Utc::now()),
        }
    }

    fn container_mut(&mut self, handle: &str) -> Option<&mut StoredContainer> {
        self.containers
            .iter_mut()
            .find(|stored| stored.record.handle == handle)
    }

    fn live_for_owner(&self, owner: &ContainerOwner, worker_name: Option<&str>) -> Option<ContainerRecord> {
        self.containers
            .iter()
            .map(|stored| &stored.record)
            .find(|record| {
                &record.owner == owner
                    && matches!(record.state, ContainerState::Creating | ContainerState::Created)
                    && worker_name.is_none_or(|name| record.worker_name == name)
            })
            .cloned()
    }
}

/// Worker registry and container bookkeeping kept in memory
#[derive(Default)]
pub struct InMemoryRegistry {
    state: tokio::sync::Mutex<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the model as-is, expiry included
    pub async fn add_worker(&self, worker: WorkerModel) {
        self.state
            .lock()
            .await
            .workers
            .insert(worker.name.clone(), worker);
    }

    /// `interruptible` is `None` for a one-off build without a job
    pub async fn add_build(&self, id: i64, status: BuildStatus, interruptible: Option<bool>) {
        self.state
            .lock()
            .await
            .builds
            .insert(id, (status, interruptible));
    }

    pub async fn set_build_status(&self, id: i64, status: BuildStatus) {
        if let Some(build) = self.state.lock().await.builds.get_mut(&id) {
            build.0 = status;
        }
    }

    /// Moves every check container past its best-if-used-by time
    pub async fn expire_check_containers(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for stored in self.state.lock().await.containers.iter_mut() {
            if stored.best_if_used_by.is_some() {
                stored.best_if_used_by = Some(past);
            }
        }
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryRegistry {
    async fn get_worker(&self, name: &str) -> Result<Option<WorkerModel>, RegistryError> {
        Ok(self.state.lock().await.workers.get(name).cloned())
    }

    async fn workers(&self) -> Result<Vec<WorkerModel>, RegistryError> {
        Ok(self.state.lock().await.workers.values().cloned().collect())
    }

    async fn workers_for_team(&self, team: &str) -> Result<Vec<WorkerModel>, RegistryError> {
        Ok(self
            .state
            .lock()
            .await
            .workers
            .values()
            .filter(|worker| worker.team.is_none() || worker.team.as_deref() == Some(team))
            .cloned()
            .collect())
    }

    async fn save_worker(&self, worker: &WorkerModel, ttl: Duration) -> Result<WorkerModel, RegistryError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.workers.get(&worker.name) {
            if existing.team != worker.team {
                return Err(RegistryError::OtherTeamsWorker(worker.name.clone()));
            }
        }

        let mut saved = worker.clone();
        saved.expires_at = expiry(ttl);
        state.workers.insert(saved.name.clone(), saved.clone());

        Ok(saved)
    }

    async fn heartbeat_worker(
        &self,
        worker: &WorkerModel,
        ttl: Duration,
    ) -> Result<WorkerModel, RegistryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .workers
            .get_mut(&worker.name)
            .ok_or_else(|| RegistryError::WorkerNotPresent(worker.name.clone()))?;

        stored.apply_heartbeat(worker, expiry(ttl));

        Ok(stored.clone())
    }

    async fn land_worker(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .workers
            .get_mut(name)
            .ok_or_else(|| RegistryError::WorkerNotPresent(name.to_string()))?;

        stored.state = stored.state.after_land_request();
        Ok(())
    }

    async fn retire_worker(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .workers
            .get_mut(name)
            .ok_or_else(|| RegistryError::WorkerNotPresent(name.to_string()))?;

        stored.state = WorkerState::Retiring;
        Ok(())
    }

    async fn prune_worker(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;

        ensure_prunable(name, state.workers.get(name).map(|worker| worker.state))?;
        state.workers.remove(name);
        Ok(())
    }

    async fn stall_unresponsive_workers(&self) -> Result<Vec<String>, RegistryError> {
        let now = Utc::now();
        let mut stalled = Vec::new();

        for worker in self.state.lock().await.workers.values_mut() {
            if worker.is_unresponsive(now) {
                worker.stall();
                stalled.push(worker.name.clone());
            }
        }

        Ok(stalled)
    }

    async fn land_finished_landing_workers(&self) -> Result<Vec<String>, RegistryError> {
        let mut state = self.state.lock().await;
        let loads = state.loads();
        let mut landed = Vec::new();

        for worker in state.workers.values_mut() {
            let load = loads.get(&worker.name).copied().unwrap_or_default();
            if worker.state == WorkerState::Landing && load.may_land() {
                worker.finish_landing();
                landed.push(worker.name.clone());
            }
        }

        Ok(landed)
    }

    async fn delete_finished_retiring_workers(&self) -> Result<Vec<String>, RegistryError> {
        let mut state = self.state.lock().await;
        let loads = state.loads();

        let retired: Vec<String> = state
            .workers
            .values()
            .filter(|worker| {
                worker.state == WorkerState::Retiring
                    && loads.get(&worker.name).copied().unwrap_or_default().may_retire()
            })
            .map(|worker| worker.name.clone())
            .collect();

        for name in &retired {
            state.workers.remove(name);
        }

        Ok(retired)
    }
}

#[async_trait]
impl ContainerRepository for InMemoryRegistry {
    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        Ok(self
            .state
            .lock()
            .await
            .containers
            .iter()
            .find(|stored| stored.record.handle == handle)
            .map(|stored| stored.record.clone()))
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        Ok(self.state.lock().await.live_for_owner(owner, None))
    }

    async fn find_container_on_worker(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        Ok(self.state.lock().await.live_for_owner(owner, Some(worker_name)))
    }

    async fn create_container(
        &self,
        worker_name: &str,
        handle: &str,
        owner: &ContainerOwner,
        team: Option<&str>,
    ) -> Result<ContainerRecord, RegistryError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;

        let best_if_used_by = match owner {
            ContainerOwner::ResourceCheck { .. } => expiry(CHECK_CONTAINER_LIFETIME),
            ContainerOwner::Build { .. } => None,
        };

        let record = ContainerRecord {
            id: state.next_id,
            handle: handle.to_string(),
            worker_name: worker_name.to_string(),
            state: ContainerState::Creating,
            hijacked: false,
            owner: owner.clone(),
            team: team.map(str::to_string),
        };
        state.containers.push(StoredContainer {
            record: record.clone(),
            best_if_used_by,
        });

        Ok(record)
    }

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord, RegistryError> {
        let mut state = self.state.lock().await;

        match state.container_mut(handle) {
            Some(stored) if stored.record.state != ContainerState::Destroying => {
                stored.record.state = ContainerState::Created;
                Ok(stored.record.clone())
            }
            _ => Err(RegistryError::ContainerNotPresent(handle.to_string())),
        }
    }

    async fn mark_container_hijacked(&self, handle: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        Ok(state
            .container_mut(handle)
            .map(|stored| stored.record.hijacked = true)
            .is_some())
    }

    async fn mark_container_destroying(&self, handle: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        Ok(state
            .container_mut(handle)
            .map(|stored| stored.record.state = ContainerState::Destroying)
            .is_some())
    }

    async fn mark_containers_for_deletion(&self) -> Result<u64, RegistryError> {
        let mut state = self.state.lock().await;

        let doomed: Vec<usize> = state
            .containers
            .iter()
            .enumerate()
            .filter(|(_, stored)| {
                stored.record.state == ContainerState::Created
                    && !stored.record.hijacked
                    && state.owner_finished(stored)
            })
            .map(|(index, _)| index)
            .collect();

        for index in &doomed {
            state.containers[*index].record.state = ContainerState::Destroying;
        }

        Ok(doomed.len() as u64)
    }

    async fn find_containers_marked_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError> {
        Ok(self
            .state
            .lock()
            .await
            .containers
            .iter()
            .filter(|stored| stored.record.state == ContainerState::Destroying)
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn find_hijacked_containers_for_deletion(
        &self,
    ) -> Result<Vec<ContainerRecord>, RegistryError> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .filter(|stored| {
                stored.record.state == ContainerState::Created
                    && stored.record.hijacked
                    && state.owner_finished(stored)
            })
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn delete_container(&self, handle: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        let before = state.containers.len();
        state
            .containers
            .retain(|stored| stored.record.handle != handle);
        Ok(state.containers.len() < before)
    }
}

// Volumes

#[derive(Default)]
struct VolumeFs {
    volumes: HashMap<String, BTreeMap<String, Vec<u8>>>,
    created: Vec<VolumeSpec>,
    imports: Vec<String>,
}

fn volume_path(handle: &str) -> String {
    format!("/volumes/{}", handle)
}

fn handle_at(path: &str) -> Option<&str> {
    path.strip_prefix("/volumes/")
}

/// Volume-storage service keeping file contents in memory
#[derive(Default)]
pub struct FakeVolumeService {
    fs: Arc<Mutex<VolumeFs>>,
}

impl FakeVolumeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root filesystem paths imported so far, in order
    pub fn imports(&self) -> Vec<String> {
        self.fs.lock().unwrap().imports.clone()
    }

    pub fn created(&self) -> Vec<VolumeSpec> {
        self.fs.lock().unwrap().created.clone()
    }

    /// Makes a volume vanish behind the caller's back
    pub fn remove(&self, handle: &str) {
        self.fs.lock().unwrap().volumes.remove(handle);
    }

    pub fn write_file(&self, handle: &str, path: &str, contents: &[u8]) {
        if let Some(files) = self.fs.lock().unwrap().volumes.get_mut(handle) {
            files.insert(path.to_string(), contents.to_vec());
        }
    }

    pub fn read_file(&self, handle: &str, path: &str) -> Option<Vec<u8>> {
        self.fs
            .lock()
            .unwrap()
            .volumes
            .get(handle)
            .and_then(|files| files.get(path).cloned())
    }

    fn volume(&self, handle: &str) -> Arc<dyn Volume> {
        Arc::new(FakeVolume {
            handle: handle.to_string(),
            path: volume_path(handle),
            fs: Arc::clone(&self.fs),
        })
    }
}

#[async_trait]
impl VolumeService for FakeVolumeService {
    async fn create_volume(&self, handle: &str, spec: VolumeSpec) -> skiff_client::Result<Arc<dyn Volume>> {
        {
            let mut fs = self.fs.lock().unwrap();
            if fs.volumes.contains_key(handle) {
                return Ok(self.volume(handle));
            }

            let files = match &spec.strategy {
                VolumeStrategy::Import { path } => {
                    fs.imports.push(path.clone());
                    BTreeMap::new()
                }
                VolumeStrategy::Cow { parent } => fs
                    .volumes
                    .get(parent)
                    .cloned()
                    .ok_or_else(|| ClientError::VolumeNotFound(parent.clone()))?,
                VolumeStrategy::Empty => BTreeMap::new(),
            };

            fs.created.push(spec);
            fs.volumes.insert(handle.to_string(), files);
        }

        Ok(self.volume(handle))
    }

    async fn lookup_volume(&self, handle: &str) -> skiff_client::Result<Arc<dyn Volume>> {
        if !self.fs.lock().unwrap().volumes.contains_key(handle) {
            return Err(ClientError::VolumeNotFound(handle.to_string()));
        }

        Ok(self.volume(handle))
    }

    async fn destroy_volume(&self, handle: &str) -> skiff_client::Result<()> {
        match self.fs.lock().unwrap().volumes.remove(handle) {
            Some(_) => Ok(()),
            None => Err(ClientError::VolumeNotFound(handle.to_string())),
        }
    }
}

struct FakeVolume {
    handle: String,
    path: String,
    fs: Arc<Mutex<VolumeFs>>,
}

#[async_trait]
impl Volume for FakeVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn stream_out(&self, path: &str) -> skiff_client::Result<Vec<u8>> {
        let name = path.trim_start_matches('/');
        let contents = self
            .fs
            .lock()
            .unwrap()
            .volumes
            .get(&self.handle)
            .and_then(|files| files.get(name).cloned())
            .ok_or_else(|| ClientError::api_error(404, format!("no such file: {}", path)))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header, name, contents.as_slice())
            .map_err(|e| ClientError::ParseError(e.to_string()))?;
        builder
            .into_inner()
            .map_err(|e| ClientError::ParseError(e.to_string()))
    }
}

// Containers

/// What a fake process does when run
#[derive(Debug, Clone)]
pub struct FakeProcessBehavior {
    exit: ProcessExit,
    until_stopped: bool,
}

impl FakeProcessBehavior {
    /// Exits right away
    pub fn exit(status: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            exit: ProcessExit {
                exit_status: status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            until_stopped: false,
        }
    }

    /// Keeps running until its container is stopped
    pub fn until_stopped(status: i32, stderr: &str) -> Self {
        Self {
            exit: ProcessExit {
                exit_status: status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
            until_stopped: true,
        }
    }
}

#[derive(Debug, Clone)]
struct RecordedRun {
    path: String,
    args: Vec<String>,
    stdin: String,
}

/// Script behaviors and observations shared by the containers of a service
#[derive(Default)]
struct ScriptLog {
    behaviors: HashMap<String, FakeProcessBehavior>,
    runs: Vec<RecordedRun>,
    streamed_in: Vec<String>,
}

impl ScriptLog {
    fn last_run(&self, path: &str) -> Option<&RecordedRun> {
        self.runs.iter().rev().find(|run| run.path == path)
    }
}

pub struct FakeContainer {
    handle: String,
    bind_mounts: Vec<BindMount>,
    log: Arc<Mutex<ScriptLog>>,
    fs: Option<Arc<Mutex<VolumeFs>>>,
    stopped: watch::Sender<bool>,
    stops: Mutex<Vec<bool>>,
    grace_times: Mutex<Vec<Duration>>,
    fail_runs: AtomicBool,
    fail_graceful_stops: AtomicBool,
}

impl FakeContainer {
    pub fn new(handle: &str) -> Arc<Self> {
        Arc::new(Self::with_parts(handle, vec![], Arc::default(), None))
    }

    fn with_parts(
        handle: &str,
        bind_mounts: Vec<BindMount>,
        log: Arc<Mutex<ScriptLog>>,
        fs: Option<Arc<Mutex<VolumeFs>>>,
    ) -> Self {
        Self {
            handle: handle.to_string(),
            bind_mounts,
            log,
            fs,
            stopped: watch::channel(false).0,
            stops: Mutex::new(Vec::new()),
            grace_times: Mutex::new(Vec::new()),
            fail_runs: AtomicBool::new(false),
            fail_graceful_stops: AtomicBool::new(false),
        }
    }

    pub fn script(&self, path: &str, behavior: FakeProcessBehavior) {
        self.log
            .lock()
            .unwrap()
            .behaviors
            .insert(path.to_string(), behavior);
    }

    pub fn stdin_of(&self, path: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .last_run(path)
            .map(|run| run.stdin.clone())
    }

    /// `kill` flag of every stop request
    pub fn stops(&self) -> Vec<bool> {
        self.stops.lock().unwrap().clone()
    }

    pub fn fail_runs(&self) {
        self.fail_runs.store(true, Ordering::SeqCst);
    }

    /// Stops without `kill` fail and leave processes running
    pub fn fail_graceful_stops(&self) {
        self.fail_graceful_stops.store(true, Ordering::SeqCst);
    }

    pub fn grace_times(&self) -> Vec<Duration> {
        self.grace_times.lock().unwrap().clone()
    }

    fn mounted_volume(&self, dst_path: &str) -> Option<String> {
        self.bind_mounts
            .iter()
            .find(|mount| mount.dst_path == dst_path)
            .and_then(|mount| handle_at(&mount.src_path))
            .map(str::to_string)
    }

    fn echo(&self, spec: &ProcessSpec, stdin: &str) -> ProcessExit {
        let request: Value = serde_json::from_str(stdin).unwrap_or(Value::Null);

        let result = match spec.path.as_str() {
            CHECK_SCRIPT => Ok(request["source"]
                .get("versions")
                .cloned()
                .unwrap_or_else(|| json!([]))),
            IN_SCRIPT => self.echo_in(spec, &request),
            OUT_SCRIPT => self.echo_out(spec, &request),
            other => Err(format!("{}: not found", other)),
        };

        match result {
            Ok(stdout) => ProcessExit {
                exit_status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            Err(stderr) => ProcessExit {
                exit_status: 1,
                stdout: String::new(),
                stderr,
            },
        }
    }

    fn echo_in(&self, spec: &ProcessSpec, request: &Value) -> Result<Value, String> {
        let destination = spec.args.first().ok_or("missing destination")?;
        let handle = self
            .mounted_volume(destination)
            .ok_or_else(|| format!("nothing mounted at {}", destination))?;
        let version = request["version"].clone();

        let fs = self.fs.as_ref().ok_or("no volumes attached")?;
        fs.lock()
            .unwrap()
            .volumes
            .get_mut(&handle)
            .ok_or_else(|| format!("volume {} is gone", handle))?
            .insert("version".to_string(), version.to_string().into_bytes());

        Ok(json!({"version": version, "metadata": []}))
    }

    fn echo_out(&self, spec: &ProcessSpec, request: &Value) -> Result<Value, String> {
        let directory = spec.args.first().ok_or("missing artifacts directory")?;
        let path = request["params"]["path"]
            .as_str()
            .ok_or("params.path is required")?;
        let (artifact, file) = path
            .split_once('/')
            .ok_or_else(|| format!("bad path {}", path))?;

        let handle = self
            .mounted_volume(&format!("{}/{}", directory, artifact))
            .ok_or_else(|| format!("no artifact named {}", artifact))?;

        let fs = self.fs.as_ref().ok_or("no volumes attached")?;
        let contents = fs
            .lock()
            .unwrap()
            .volumes
            .get(&handle)
            .and_then(|files| files.get(file).cloned())
            .ok_or_else(|| format!("{}: no such file", path))?;
        let version: Value = serde_json::from_slice(&contents).map_err(|e| e.to_string())?;

        Ok(json!({"version": version, "metadata": []}))
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> skiff_client::Result<Box<dyn Process>> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(500, "cannot start process"));
        }

        let behavior = {
            let mut log = self.log.lock().unwrap();
            log.runs.push(RecordedRun {
                path: spec.path.clone(),
                args: spec.args.clone(),
                stdin: io.stdin.clone(),
            });
            log.behaviors.get(&spec.path).cloned()
        };

        let (exit, until_stopped) = match behavior {
            Some(behavior) => (behavior.exit, behavior.until_stopped),
            None => (self.echo(&spec, &io.stdin), false),
        };

        Ok(Box::new(FakeProcess {
            id: Uuid::new_v4().to_string(),
            exit,
            stopped: until_stopped.then(|| self.stopped.subscribe()),
        }))
    }

    async fn stop(&self, kill: bool) -> skiff_client::Result<()> {
        self.stops.lock().unwrap().push(kill);
        if !kill && self.fail_graceful_stops.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(500, "signal failed"));
        }
        self.stopped.send_replace(true);
        Ok(())
    }

    async fn set_grace_time(&self, grace_time: Duration) -> skiff_client::Result<()> {
        self.grace_times.lock().unwrap().push(grace_time);
        Ok(())
    }

    async fn stream_in(&self, path: &str, _archive: Vec<u8>) -> skiff_client::Result<()> {
        self.log
            .lock()
            .unwrap()
            .streamed_in
            .push(path.to_string());
        Ok(())
    }
}

struct FakeProcess {
    id: String,
    exit: ProcessExit,
    stopped: Option<watch::Receiver<bool>>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> skiff_client::Result<ProcessExit> {
        if let Some(stopped) = &self.stopped {
            let mut stopped = stopped.clone();
            stopped
                .wait_for(|stopped| *stopped)
                .await
                .map_err(|_| ClientError::api_error(500, "container went away"))?;
        }

        Ok(self.exit.clone())
    }
}

/// Container-execution service whose containers run fake processes
#[derive(Default)]
pub struct FakeContainerService {
    log: Arc<Mutex<ScriptLog>>,
    fs: Option<Arc<Mutex<VolumeFs>>>,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    created: Mutex<Vec<CreateContainer>>,
    destroyed: Mutex<Vec<String>>,
    destroy_failure: Mutex<Option<(u16, String)>>,
    lookup_failure: Mutex<Option<(u16, String)>>,
}

impl FakeContainerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers see the volumes of `volumes` through their bind mounts
    pub fn with_volumes(volumes: &FakeVolumeService) -> Self {
        Self {
            fs: Some(Arc::clone(&volumes.fs)),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<CreateContainer> {
        self.created.lock().unwrap().clone()
    }

    /// A container that exists without going through `create`
    pub fn add_container(&self, handle: &str) {
        let container = self.container(handle, vec![]);
        self.containers
            .lock()
            .unwrap()
            .insert(handle.to_string(), container);
    }

    /// Behavior of every process started at `path`
    pub fn script(&self, path: &str, behavior: FakeProcessBehavior) {
        self.log
            .lock()
            .unwrap()
            .behaviors
            .insert(path.to_string(), behavior);
    }

    pub fn last_stdin(&self, path: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .last_run(path)
            .map(|run| run.stdin.clone())
    }

    pub fn last_args(&self, path: &str) -> Option<Vec<String>> {
        self.log
            .lock()
            .unwrap()
            .last_run(path)
            .map(|run| run.args.clone())
    }

    /// Destination paths of every archive streamed in
    pub fn streamed_in(&self) -> Vec<String> {
        self.log.lock().unwrap().streamed_in.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn fail_destroys(&self, status: u16, message: &str) {
        *self.destroy_failure.lock().unwrap() = Some((status, message.to_string()));
    }

    pub fn allow_destroys(&self) {
        *self.destroy_failure.lock().unwrap() = None;
    }

    pub fn fail_lookups(&self, status: u16, message: &str) {
        *self.lookup_failure.lock().unwrap() = Some((status, message.to_string()));
    }

    /// Drops a container the way the worker does once its grace time ends
    pub fn forget_container(&self, handle: &str) {
        self.containers.lock().unwrap().remove(handle);
    }

    pub fn grace_times(&self, handle: &str) -> Vec<Duration> {
        self.containers
            .lock()
            .unwrap()
            .get(handle)
            .map(|container| container.grace_times())
            .unwrap_or_default()
    }

    fn container(&self, handle: &str, bind_mounts: Vec<BindMount>) -> Arc<FakeContainer> {
        Arc::new(FakeContainer::with_parts(
            handle,
            bind_mounts,
            Arc::clone(&self.log),
            self.fs.clone(),
        ))
    }
}

#[async_trait]
impl ContainerService for FakeContainerService {
    async fn create(&self, spec: CreateContainer) -> skiff_client::Result<Arc<dyn Container>> {
        let handle = if spec.handle.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            spec.handle.clone()
        };

        let container = self.container(&handle, spec.bind_mounts.clone());
        self.created.lock().unwrap().push(spec);
        self.containers
            .lock()
            .unwrap()
            .insert(handle, Arc::clone(&container));

        Ok(container)
    }

    async fn lookup(&self, handle: &str) -> skiff_client::Result<Arc<dyn Container>> {
        if let Some((status, message)) = self.lookup_failure.lock().unwrap().clone() {
            return Err(ClientError::api_error(status, message));
        }

        match self.containers.lock().unwrap().get(handle) {
            Some(container) => Ok(Arc::clone(container) as Arc<dyn Container>),
            None => Err(ClientError::ContainerNotFound(handle.to_string())),
        }
    }

    async fn destroy(&self, handle: &str) -> skiff_client::Result<()> {
        if let Some((status, message)) = self.destroy_failure.lock().unwrap().clone() {
            return Err(ClientError::api_error(status, message));
        }

        match self.containers.lock().unwrap().remove(handle) {
            Some(_) => {
                self.destroyed.lock().unwrap().push(handle.to_string());
                Ok(())
            }
            None => Err(ClientError::ContainerNotFound(handle.to_string())),
        }
    }
}

// Workers

/// Worker backed by fake services that share one volume store
pub struct FakeWorker {
    model: WorkerModel,
    containers: Arc<FakeContainerService>,
    volumes: Arc<FakeVolumeService>,
    placements: AtomicUsize,
}

impl FakeWorker {
    pub fn new(model: WorkerModel) -> Self {
        let volumes = Arc::new(FakeVolumeService::new());
        let containers = Arc::new(FakeContainerService::with_volumes(&volumes));

        Self {
            model,
            containers,
            volumes,
            placements: AtomicUsize::new(0),
        }
    }

    pub fn containers(&self) -> Arc<FakeContainerService> {
        Arc::clone(&self.containers)
    }

    pub fn volumes(&self) -> Arc<FakeVolumeService> {
        Arc::clone(&self.volumes)
    }

    /// Number of find-or-create calls placed on this worker
    pub fn created(&self) -> usize {
        self.placements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn model(&self) -> &WorkerModel {
        &self.model
    }

    fn container_service(&self) -> Arc<dyn ContainerService> {
        self.containers()
    }

    fn volume_service(&self) -> Arc<dyn VolumeService> {
        self.volumes()
    }

    async fn find_or_create_container(
        &self,
        _owner: &ContainerOwner,
        spec: &ContainerSpec,
        _resource_types: &VersionedResourceTypes,
    ) -> Result<Arc<dyn Container>, PoolError> {
        self.placements.fetch_add(1, Ordering::SeqCst);

        let container = self
            .containers
            .create(CreateContainer {
                handle: Uuid::new_v4().to_string(),
                rootfs_path: "raw:///fake".to_string(),
                bind_mounts: spec.bind_mounts.clone(),
                privileged: spec.privileged,
            })
            .await?;

        Ok(container)
    }

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, PoolError> {
        match self.containers.lookup(handle).await {
            Ok(container) => Ok(Some(container)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed set of workers plus container placements
pub struct FakeProvider {
    workers: Vec<Arc<FakeWorker>>,
    placements: Mutex<HashMap<ContainerOwner, String>>,
    records: Mutex<Vec<ContainerRecord>>,
}

impl FakeProvider {
    pub fn new(workers: Vec<Arc<FakeWorker>>) -> Self {
        Self {
            workers,
            placements: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Pretends `owner` already has a container on `worker_name`
    pub fn place(&self, owner: &ContainerOwner, worker_name: &str) {
        self.placements
            .lock()
            .unwrap()
            .insert(owner.clone(), worker_name.to_string());
    }

    /// Records a created container in bookkeeping
    pub fn record_container(&self, handle: &str, worker_name: &str) {
        let mut records = self.records.lock().unwrap();
        let id = records.len() as i64 + 1;
        records.push(ContainerRecord {
            id,
            handle: handle.to_string(),
            worker_name: worker_name.to_string(),
            state: ContainerState::Created,
            hijacked: false,
            owner: ContainerOwner::Build {
                build_id: id,
                plan_id: handle.to_string(),
            },
            team: None,
        });
    }

    fn worker(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .iter()
            .find(|worker| worker.name() == name)
            .map(|worker| Arc::clone(worker) as Arc<dyn Worker>)
    }
}

#[async_trait]
impl WorkerProvider for FakeProvider {
    async fn running_workers(&self, team: Option<&str>) -> Result<Vec<Arc<dyn Worker>>, PoolError> {
        Ok(self
            .workers
            .iter()
            .filter(|worker| worker.model().state == WorkerState::Running)
            .filter(|worker| {
                team.is_none() || worker.model().team.is_none() || worker.model().team.as_deref() == team
            })
            .map(|worker| Arc::clone(worker) as Arc<dyn Worker>)
            .collect())
    }

    async fn get_worker(&self, name: &str) -> Result<Option<Arc<dyn Worker>>, PoolError> {
        Ok(self.worker(name))
    }

    async fn find_worker_for_container(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<Arc<dyn Worker>>, PoolError> {
        let placed = self.placements.lock().unwrap().get(owner).cloned();
        Ok(placed
            .and_then(|name| self.worker(&name))
            .filter(|worker| !worker.model().state.clears_endpoints()))
    }

    async fn find_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRecord>, PoolError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.handle == handle)
            .cloned())
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>, PoolError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|record| &record.owner == owner)
            .cloned())
    }
}

/// Hands out one pair of fake services per worker name
#[derive(Default)]
pub struct FakeClientFactory {
    services: Mutex<HashMap<String, (Arc<FakeContainerService>, Arc<FakeVolumeService>)>>,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn containers_for(&self, worker_name: &str) -> Arc<FakeContainerService> {
        Arc::clone(&self.services_for(worker_name).0)
    }

    pub fn volumes_for(&self, worker_name: &str) -> Arc<FakeVolumeService> {
        Arc::clone(&self.services_for(worker_name).1)
    }

    fn services_for(&self, worker_name: &str) -> (Arc<FakeContainerService>, Arc<FakeVolumeService>) {
        self.services
            .lock()
            .unwrap()
            .entry(worker_name.to_string())
            .or_insert_with(|| {
                let volumes = Arc::new(FakeVolumeService::new());
                let containers = Arc::new(FakeContainerService::with_volumes(&volumes));
                (containers, volumes)
            })
            .clone()
    }
}

impl ClientFactory for FakeClientFactory {
    fn container_service(&self, worker: &WorkerModel) -> Result<Arc<dyn ContainerService>, ClientError> {
        if worker.garden_addr.is_none() {
            return Err(ClientError::MissingAddress(worker.name.clone()));
        }

        Ok(self.containers_for(&worker.name))
    }

    fn volume_service(&self, worker: &WorkerModel) -> Result<Arc<dyn VolumeService>, ClientError> {
        if worker.baggageclaim_url.is_none() {
            return Err(ClientError::MissingAddress(worker.name.clone()));
        }

        Ok(self.volumes_for(&worker.name))
    }
}

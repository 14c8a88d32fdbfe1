//! Desired-state reconciler: drives services, layers and instances to the
//! requested set and reports run status back.
//!
//! One reconciliation runs at a time; `run_instances` returns `WrongState`
//! while a cycle is in flight. Within a cycle all stops complete before any
//! start, and exactly one run-status report is emitted after the cycle —
//! deferred until the cloud connection is up.

pub mod instance;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::layermanager::LayerManager;
use crate::monitoring::ResourceMonitor;
use crate::network::NetworkManager;
use crate::oci::OciManager;
use crate::resourcemanager::ResourceManager;
use crate::storage::LauncherStorage;
use crate::types::{
    compare_versions, EnvVarStatus, EnvVarsInstanceInfo, EnvVarsInstanceStatus, InstanceData, InstanceIdent,
    InstanceInfo, InstanceStatus, LayerInfo, NodeInfo, RunState, ServiceData, ServiceInfo,
};

use instance::Instance;

/// Compiled-in persistence schema version. A mismatch against the stored
/// value wipes all persisted launcher state before the first run.
pub const OPERATION_VERSION: u64 = 9;

/// Paths of an installed service image the instance pipeline consumes.
#[derive(Debug, Clone, Default)]
pub struct ImageParts {
    pub image_config_path: PathBuf,
    pub service_config_path: PathBuf,
    pub service_fs_path: PathBuf,
    pub layer_digests: Vec<String>,
}

/// Runner callback entry for one instance.
#[derive(Debug)]
pub struct RunStatus {
    pub instance_id: String,
    pub state: RunState,
    pub error: Option<Error>,
}

/// Service installation and lookup, owned by the external service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn install_services(&self, services: &[ServiceInfo]) -> Result<()>;
    async fn get_all_services(&self) -> Result<Vec<ServiceData>>;
    async fn get_service(&self, service_id: &str) -> Result<ServiceData>;
    async fn image_parts(&self, service: &ServiceData) -> Result<ImageParts>;
}

/// Container runtime invocation (runc/crun/xrun behind the seam).
#[async_trait]
pub trait Runner: Send + Sync {
    async fn start_instance(&self, instance_id: &str, runtime_dir: &Path) -> RunStatus;
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;
}

/// Identity/permission registration for instances.
#[async_trait]
pub trait PermHandler: Send + Sync {
    async fn register_instance(
        &self,
        ident: &InstanceIdent,
        permissions: &std::collections::HashMap<String, String>,
    ) -> Result<String>;

    async fn unregister_instance(&self, ident: &InstanceIdent) -> Result<()>;
}

/// Host runtime operations: rootfs overlays, mount points, state dirs.
#[async_trait]
pub trait RuntimeOps: Send + Sync {
    async fn prepare_service_state(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
    async fn prepare_service_storage(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
    async fn prepare_network_dir(&self, path: &Path) -> Result<()>;
    async fn create_mount_points(&self, path: &Path, mounts: &[crate::oci::Mount]) -> Result<()>;
    async fn mount_service_rootfs(&self, rootfs: &Path, layers: &[PathBuf]) -> Result<()>;
    async fn umount_service_rootfs(&self, rootfs: &Path) -> Result<()>;
    async fn host_devices(&self, device_path: &Path) -> Result<Vec<crate::oci::LinuxDevice>>;
    async fn gid_by_name(&self, group: &str) -> Result<u32>;
}

/// Receives run/update status reports.
#[async_trait]
pub trait InstanceStatusReceiver: Send + Sync {
    async fn instances_run_status(&self, instances: Vec<InstanceStatus>) -> Result<()>;
    async fn instances_update_status(&self, instances: Vec<InstanceStatus>) -> Result<()>;
}

/// Shared dependencies handed to every instance.
pub(crate) struct InstanceContext {
    pub(crate) config: Config,
    pub(crate) node_info: NodeInfo,
    pub(crate) service_manager: Arc<dyn ServiceManager>,
    pub(crate) layer_manager: Arc<LayerManager>,
    pub(crate) resource_manager: Arc<ResourceManager>,
    pub(crate) network_manager: Arc<NetworkManager>,
    pub(crate) perm_handler: Arc<dyn PermHandler>,
    pub(crate) runner: Arc<dyn Runner>,
    pub(crate) runtime: Arc<dyn RuntimeOps>,
    pub(crate) monitor: Arc<ResourceMonitor>,
    pub(crate) oci: Arc<dyn OciManager>,
}

#[derive(Default)]
struct LauncherState {
    current_instances: HashMap<InstanceIdent, Arc<Instance>>,
    override_env: Vec<EnvVarsInstanceInfo>,
    pending_env_restarts: HashSet<InstanceIdent>,
    launch_in_progress: bool,
}

pub struct Launcher {
    ctx: Arc<InstanceContext>,
    storage: Arc<dyn LauncherStorage>,
    status_receiver: Arc<dyn InstanceStatusReceiver>,
    state: Mutex<LauncherState>,
    connected: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    cycle: Mutex<Option<JoinHandle<()>>>,
    num_workers: usize,
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Config,
        node_info: NodeInfo,
        service_manager: Arc<dyn ServiceManager>,
        layer_manager: Arc<LayerManager>,
        resource_manager: Arc<ResourceManager>,
        network_manager: Arc<NetworkManager>,
        perm_handler: Arc<dyn PermHandler>,
        runner: Arc<dyn Runner>,
        runtime: Arc<dyn RuntimeOps>,
        monitor: Arc<ResourceMonitor>,
        oci: Arc<dyn OciManager>,
        status_receiver: Arc<dyn InstanceStatusReceiver>,
        storage: Arc<dyn LauncherStorage>,
    ) -> Result<Arc<Self>> {
        tracing::debug!("init launcher");

        std::fs::create_dir_all(config.runtime_dir())?;
        std::fs::create_dir_all(config.host_whiteouts_dir())?;

        // A different stored operation version invalidates all persisted
        // launcher state.
        match storage.get_operation_version().await? {
            Some(version) if version != OPERATION_VERSION => {
                tracing::warn!(stored = version, current = OPERATION_VERSION, "operation version mismatch, wiping state");

                for data in storage.get_all_instances().await? {
                    storage.remove_instance(&data.info.ident).await?;
                }

                storage.set_override_env_vars(&[]).await?;
            }
            _ => {}
        }

        storage.set_operation_version(OPERATION_VERSION).await?;

        let override_env = storage.get_override_env_vars().await.unwrap_or_default();

        let num_workers = config.launcher.num_launch_workers.max(1);

        let ctx = Arc::new(InstanceContext {
            config,
            node_info,
            service_manager,
            layer_manager,
            resource_manager,
            network_manager,
            perm_handler,
            runner,
            runtime,
            monitor,
            oci,
        });

        Ok(Arc::new(Self {
            ctx,
            storage,
            status_receiver,
            state: Mutex::new(LauncherState { override_env, ..Default::default() }),
            connected: watch::channel(false).0,
            closed: watch::channel(false).0,
            cycle: Mutex::new(None),
            num_workers,
        }))
    }

    /// Restarts the instances persisted from the previous run and reports
    /// their status once connected.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::debug!("start launcher");

        {
            let mut state = self.state.lock().await;

            if state.launch_in_progress {
                return Err(Error::wrong_state("launch already in progress"));
            }

            state.launch_in_progress = true;
        }

        let stored = self.storage.get_all_instances().await?;

        let launcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            launcher.start_instances(&stored).await;
            launcher.finish_cycle().await;
        });

        *self.cycle.lock().await = Some(handle);

        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) {
        tracing::debug!("stop launcher");

        let _ = self.closed.send(true);

        let handle = self.cycle.lock().await.take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Applies a desired state. Validates and enqueues the reconciliation,
    /// returning immediately; `WrongState` if one is already in flight.
    pub async fn run_instances(
        self: &Arc<Self>,
        services: Vec<ServiceInfo>,
        layers: Vec<LayerInfo>,
        instances: Vec<InstanceInfo>,
        force_restart: bool,
    ) -> Result<()> {
        if force_restart {
            tracing::debug!("restart instances");
        } else {
            tracing::debug!("run instances");
        }

        {
            let mut state = self.state.lock().await;

            if state.launch_in_progress {
                return Err(Error::wrong_state("launch already in progress"));
            }

            state.launch_in_progress = true;
        }

        // A previous, already-finished cycle may still need joining.
        let previous = self.cycle.lock().await.take();

        if let Some(handle) = previous {
            let _ = handle.await;
        }

        let launcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            launcher.run_cycle(services, layers, instances, force_restart).await;
        });

        *self.cycle.lock().await = Some(handle);

        Ok(())
    }

    /// Replaces the override-env table. Affected instances restart on the
    /// next reconciliation.
    pub async fn override_env_vars(&self, env_info: Vec<EnvVarsInstanceInfo>) -> Result<Vec<EnvVarsInstanceStatus>> {
        tracing::debug!(count = env_info.len(), "override env vars");

        let now = Utc::now();

        let statuses = env_info
            .iter()
            .map(|info| EnvVarsInstanceStatus {
                filter: info.filter.clone(),
                statuses: info
                    .variables
                    .iter()
                    .map(|variable| EnvVarStatus {
                        name: variable.name.clone(),
                        error: variable
                            .ttl
                            .is_some_and(|ttl| ttl <= now)
                            .then_some(ErrorKind::Timeout),
                    })
                    .collect(),
            })
            .collect();

        if let Err(err) = self.storage.set_override_env_vars(&env_info).await {
            tracing::error!(%err, "can't store override env vars");
        }

        let mut state = self.state.lock().await;

        let affected: Vec<InstanceIdent> = state
            .current_instances
            .keys()
            .filter(|ident| env_info.iter().any(|info| info.filter.matches(ident)))
            .cloned()
            .collect();

        state.pending_env_restarts.extend(affected);
        state.override_env = env_info;

        Ok(statuses)
    }

    /// Sink for runner callbacks; updates instance state and forwards an
    /// update report when connected.
    pub async fn update_run_status(&self, statuses: Vec<RunStatus>) -> Result<()> {
        tracing::debug!(count = statuses.len(), "update run status");

        let mut updated = Vec::new();

        {
            let state = self.state.lock().await;

            for status in &statuses {
                let Some(instance) = state
                    .current_instances
                    .values()
                    .find(|instance| instance.instance_id() == status.instance_id)
                else {
                    tracing::warn!(instance_id = %status.instance_id, "run status for unknown instance");

                    continue;
                };

                instance.set_run_state(status.state, status.error.as_ref().map(Error::kind));
                updated.push(InstanceStatus::from(instance.as_ref()));
            }
        }

        for status in &statuses {
            if let Err(err) = self.ctx.monitor.update_instance_run_state(&status.instance_id, status.state).await {
                if !err.is(ErrorKind::NotFound) {
                    tracing::warn!(instance_id = %status.instance_id, %err, "can't update monitor run state");
                }
            }
        }

        let in_progress = self.state.lock().await.launch_in_progress;

        if !updated.is_empty() && *self.connected.borrow() && !in_progress {
            if let Err(err) = self.status_receiver.instances_update_status(updated).await {
                tracing::error!(%err, "sending update status failed");
            }
        }

        Ok(())
    }

    pub async fn on_connect(&self) {
        tracing::debug!("connection event");

        let _ = self.connected.send(true);

        if let Err(err) = self.storage.set_online_time(Utc::now()).await {
            tracing::warn!(%err, "can't store online time");
        }

        // Re-announce the current set if no cycle is about to do it.
        let in_progress = self.state.lock().await.launch_in_progress;

        if !in_progress {
            self.send_run_status().await;
        }
    }

    pub async fn on_disconnect(&self) {
        tracing::debug!("disconnection event");

        let _ = self.connected.send(false);
    }

    async fn run_cycle(
        self: Arc<Self>,
        services: Vec<ServiceInfo>,
        layers: Vec<LayerInfo>,
        instances: Vec<InstanceInfo>,
        force_restart: bool,
    ) {
        if let Err(err) = self.ctx.layer_manager.process_desired_layers(&layers).await {
            tracing::error!(%err, "can't process desired layers");
        }

        if let Err(err) = self.ctx.service_manager.install_services(&services).await {
            tracing::error!(%err, "can't install services");
        }

        let desired_data = match self.sync_storage(&instances).await {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%err, "can't update storage");

                // Degrade to fresh runtime handles; the node still converges.
                instances
                    .iter()
                    .map(|info| InstanceData {
                        info: info.clone(),
                        instance_id: uuid::Uuid::new_v4().to_string(),
                    })
                    .collect()
            }
        };

        self.stop_instances(&desired_data, force_restart).await;
        self.start_instances(&desired_data).await;

        self.finish_cycle().await;
    }

    /// Waits for connectivity, emits the run status report and clears the
    /// in-progress flag.
    async fn finish_cycle(&self) {
        if self.wait_connected().await {
            self.send_run_status().await;
        }

        self.state.lock().await.launch_in_progress = false;
    }

    async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.subscribe();
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow() {
                return false;
            }

            if *connected.borrow() {
                return true;
            }

            tokio::select! {
                changed = connected.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn send_run_status(&self) {
        let statuses: Vec<InstanceStatus> = {
            let state = self.state.lock().await;

            state
                .current_instances
                .values()
                .map(|instance| InstanceStatus::from(instance.as_ref()))
                .collect()
        };

        for status in &statuses {
            tracing::debug!(
                ident = %status.ident,
                version = %status.service_version,
                state = %status.run_state,
                "instance status"
            );
        }

        tracing::debug!("send run status");

        if let Err(err) = self.status_receiver.instances_run_status(statuses).await {
            tracing::error!(%err, "sending run status failed");
        }
    }

    /// Brings the persisted instance set in line with the desired one and
    /// assigns runtime handles: known instances keep their `instance_id`,
    /// new ones get a fresh one.
    async fn sync_storage(&self, desired: &[InstanceInfo]) -> Result<Vec<InstanceData>> {
        let stored = self.storage.get_all_instances().await?;
        let mut result = Vec::with_capacity(desired.len());

        for info in desired {
            match stored.iter().find(|data| data.info.ident == info.ident) {
                Some(existing) => {
                    let data = InstanceData { info: info.clone(), instance_id: existing.instance_id.clone() };

                    if existing.info != *info {
                        if let Err(err) = self.storage.update_instance(&data).await {
                            tracing::error!(ident = %info.ident, %err, "can't update stored instance");
                        }
                    }

                    result.push(data);
                }
                None => {
                    let data = InstanceData {
                        info: info.clone(),
                        instance_id: uuid::Uuid::new_v4().to_string(),
                    };

                    if let Err(err) = self.storage.add_instance(&data).await {
                        tracing::error!(ident = %info.ident, %err, "can't store instance");
                    }

                    result.push(data);
                }
            }
        }

        for data in &stored {
            if !desired.iter().any(|info| info.ident == data.info.ident) {
                if let Err(err) = self.storage.remove_instance(&data.info.ident).await {
                    tracing::error!(ident = %data.info.ident, %err, "can't remove stored instance");
                }
            }
        }

        Ok(result)
    }

    /// Stops every current instance that must not survive this cycle:
    /// force-restart, dropped from the desired set, service gone or version
    /// changed, pending env-override restart, or not running.
    async fn stop_instances(&self, desired: &[InstanceData], force_restart: bool) {
        tracing::debug!("stop instances");

        let services = match self.ctx.service_manager.get_all_services().await {
            Ok(services) => services,
            Err(err) => {
                tracing::error!(%err, "can't get current services");

                Vec::new()
            }
        };

        let to_stop: Vec<Arc<Instance>> = {
            let mut state = self.state.lock().await;
            let env_restarts = std::mem::take(&mut state.pending_env_restarts);

            let idents: Vec<InstanceIdent> = state
                .current_instances
                .iter()
                .filter(|(ident, instance)| {
                    if force_restart || env_restarts.contains(ident) {
                        return true;
                    }

                    if !desired.iter().any(|data| data.info.ident == **ident) {
                        return true;
                    }

                    if instance.run_state().0 != RunState::Active {
                        return true;
                    }

                    match services.iter().find(|service| service.service_id == ident.service_id) {
                        Some(service) => !same_version(&service.version, instance.service_version()),
                        None => true,
                    }
                })
                .map(|(ident, _)| ident.clone())
                .collect();

            idents
                .into_iter()
                .filter_map(|ident| state.current_instances.remove(&ident))
                .collect()
        };

        futures::stream::iter(to_stop)
            .for_each_concurrent(self.num_workers, |instance| async move {
                if let Err(err) = instance.stop().await {
                    tracing::error!(ident = %instance.info().ident, %err, "can't stop instance");
                }
            })
            .await;
    }

    /// Starts every desired instance not currently running. Per-instance
    /// failures leave a `Failed` entry; other starts continue.
    async fn start_instances(self: &Arc<Self>, desired: &[InstanceData]) {
        tracing::debug!("start instances");

        let to_start: Vec<InstanceData> = {
            let state = self.state.lock().await;

            desired
                .iter()
                .filter(|data| !state.current_instances.contains_key(&data.info.ident))
                .cloned()
                .collect()
        };

        futures::stream::iter(to_start)
            .for_each_concurrent(self.num_workers, |data| {
                let launcher = Arc::clone(self);

                async move {
                    if let Err(err) = launcher.start_instance(data).await {
                        tracing::error!(%err, "can't start instance");
                    }
                }
            })
            .await;
    }

    async fn start_instance(&self, data: InstanceData) -> Result<()> {
        let ident = data.info.ident.clone();

        let (service, service_err) = match self.ctx.service_manager.get_service(&ident.service_id).await {
            Ok(service) => (service, None),
            Err(err) => (
                ServiceData {
                    service_id: ident.service_id.clone(),
                    provider_id: String::new(),
                    version: String::new(),
                    gid: 0,
                    image_path: PathBuf::new(),
                },
                Some(err),
            ),
        };

        let override_env = self.resolved_env(&ident).await;

        let instance = Arc::new(Instance::new(
            Arc::clone(&self.ctx),
            data.instance_id,
            data.info,
            service,
            override_env,
        ));

        {
            let mut state = self.state.lock().await;

            if state.current_instances.contains_key(&ident) {
                return Err(Error::already_exist(format!("instance {ident} already started")));
            }

            state.current_instances.insert(ident.clone(), Arc::clone(&instance));
        }

        if let Some(err) = service_err {
            instance.set_run_state(RunState::Failed, Some(err.kind()));

            return Err(err.context(format!("can't get service for instance {ident}")));
        }

        if let Err(err) = instance.start().await {
            instance.set_run_state(RunState::Failed, Some(err.kind()));

            return Err(err.context(format!("can't start instance {ident}")));
        }

        Ok(())
    }

    /// Override-env entries matching the ident with unexpired TTLs, as
    /// `NAME=VALUE` strings.
    async fn resolved_env(&self, ident: &InstanceIdent) -> Vec<String> {
        let now = Utc::now();
        let state = self.state.lock().await;

        state
            .override_env
            .iter()
            .filter(|info| info.filter.matches(ident))
            .flat_map(|info| {
                info.variables
                    .iter()
                    .filter(|variable| variable.ttl.map_or(true, |ttl| ttl > now))
                    .map(|variable| format!("{}={}", variable.name, variable.value))
            })
            .collect()
    }
}

fn same_version(left: &str, right: &str) -> bool {
    match compare_versions(left, right) {
        Ok(ordering) => ordering == std::cmp::Ordering::Equal,
        Err(_) => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::layermanager::{
        Downloader, ImageHandler, InstalledLayer, LayerManagerConfig,
    };
    use crate::monitoring::alert::{Alert, AlertSender};
    use crate::monitoring::{MonitorSender, NodeMonitoringData, ResourceUsageProvider};
    use crate::network::cni::{Cni, CniResult, NetworkConfigList, RuntimeConf};
    use crate::network::{InterfaceManager, NetnsManager, TrafficCounter, TrafficMonitor};
    use crate::oci::{ImageManifest, ImageSpec, OciManager, ServiceConfig};
    use crate::spaceallocator::FsPlatform;
    use crate::storage::SqliteStorage;
    use crate::types::{MonitoringData, NetworkParameters, PartitionUsage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct StubOci;

    #[async_trait]
    impl OciManager for StubOci {
        async fn load_image_spec(&self, _path: &Path) -> Result<ImageSpec> {
            Ok(ImageSpec { os: "linux".to_string(), ..Default::default() })
        }

        async fn load_service_config(&self, _path: &Path) -> Result<ServiceConfig> {
            Ok(ServiceConfig::default())
        }

        async fn load_image_manifest(&self, _path: &Path) -> Result<ImageManifest> {
            Ok(ImageManifest::default())
        }

        async fn save_runtime_spec(&self, path: &Path, spec: &crate::oci::RuntimeSpec) -> Result<()> {
            crate::tools::fs::write_file_atomic(path, &serde_json::to_vec(spec)?)
        }
    }

    #[derive(Default)]
    struct StubServiceManager {
        services: parking_lot::Mutex<HashMap<String, ServiceData>>,
    }

    #[async_trait]
    impl ServiceManager for StubServiceManager {
        async fn install_services(&self, services: &[ServiceInfo]) -> Result<()> {
            let mut installed = self.services.lock();

            installed.retain(|service_id, _| services.iter().any(|info| info.service_id == *service_id));

            for info in services {
                installed.insert(
                    info.service_id.clone(),
                    ServiceData {
                        service_id: info.service_id.clone(),
                        provider_id: info.provider_id.clone(),
                        version: info.version.clone(),
                        gid: info.gid,
                        image_path: PathBuf::from("/srv/services").join(&info.service_id),
                    },
                );
            }

            Ok(())
        }

        async fn get_all_services(&self) -> Result<Vec<ServiceData>> {
            Ok(self.services.lock().values().cloned().collect())
        }

        async fn get_service(&self, service_id: &str) -> Result<ServiceData> {
            self.services
                .lock()
                .get(service_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("service {service_id} not found")))
        }

        async fn image_parts(&self, service: &ServiceData) -> Result<ImageParts> {
            Ok(ImageParts {
                image_config_path: service.image_path.join("image.json"),
                service_config_path: service.image_path.join("service.json"),
                service_fs_path: service.image_path.join("rootfs"),
                layer_digests: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct StubRunner {
        started: parking_lot::Mutex<Vec<String>>,
        stopped: parking_lot::Mutex<Vec<String>>,
        delay: Option<Duration>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Runner for StubRunner {
        async fn start_instance(&self, instance_id: &str, _runtime_dir: &Path) -> RunStatus {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.started.lock().push(instance_id.to_string());

            if self.fail.load(Ordering::SeqCst) {
                return RunStatus {
                    instance_id: instance_id.to_string(),
                    state: RunState::Failed,
                    error: Some(Error::failed("runner start failed")),
                };
            }

            RunStatus { instance_id: instance_id.to_string(), state: RunState::Active, error: None }
        }

        async fn stop_instance(&self, instance_id: &str) -> Result<()> {
            self.stopped.lock().push(instance_id.to_string());

            Ok(())
        }
    }

    struct StubPermHandler;

    #[async_trait]
    impl PermHandler for StubPermHandler {
        async fn register_instance(
            &self,
            _ident: &InstanceIdent,
            _permissions: &std::collections::HashMap<String, String>,
        ) -> Result<String> {
            Ok("secret".to_string())
        }

        async fn unregister_instance(&self, _ident: &InstanceIdent) -> Result<()> {
            Ok(())
        }
    }

    struct StubRuntimeOps;

    #[async_trait]
    impl RuntimeOps for StubRuntimeOps {
        async fn prepare_service_state(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
            Ok(())
        }

        async fn prepare_service_storage(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<()> {
            Ok(())
        }

        async fn prepare_network_dir(&self, path: &Path) -> Result<()> {
            std::fs::create_dir_all(path)?;

            Ok(())
        }

        async fn create_mount_points(&self, path: &Path, _mounts: &[crate::oci::Mount]) -> Result<()> {
            std::fs::create_dir_all(path)?;

            Ok(())
        }

        async fn mount_service_rootfs(&self, _rootfs: &Path, _layers: &[PathBuf]) -> Result<()> {
            Ok(())
        }

        async fn umount_service_rootfs(&self, _rootfs: &Path) -> Result<()> {
            Ok(())
        }

        async fn host_devices(&self, _device_path: &Path) -> Result<Vec<crate::oci::LinuxDevice>> {
            Ok(Vec::new())
        }

        async fn gid_by_name(&self, _group: &str) -> Result<u32> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct StubStatusReceiver {
        run_statuses: parking_lot::Mutex<Vec<Vec<InstanceStatus>>>,
        update_statuses: parking_lot::Mutex<Vec<Vec<InstanceStatus>>>,
    }

    #[async_trait]
    impl InstanceStatusReceiver for StubStatusReceiver {
        async fn instances_run_status(&self, instances: Vec<InstanceStatus>) -> Result<()> {
            self.run_statuses.lock().push(instances);

            Ok(())
        }

        async fn instances_update_status(&self, instances: Vec<InstanceStatus>) -> Result<()> {
            self.update_statuses.lock().push(instances);

            Ok(())
        }
    }

    struct StubCni;

    #[async_trait]
    impl Cni for StubCni {
        async fn add_network_list(&self, _config: &NetworkConfigList, _rt: &RuntimeConf) -> Result<CniResult> {
            Ok(CniResult::default())
        }

        async fn delete_network_list(&self, _config: &NetworkConfigList, _rt: &RuntimeConf) -> Result<()> {
            Ok(())
        }

        async fn cached_network_list(&self, network_name: &str, _rt: &RuntimeConf) -> Result<NetworkConfigList> {
            Ok(NetworkConfigList { name: network_name.to_string(), ..Default::default() })
        }
    }

    struct StubNetns;

    #[async_trait]
    impl NetnsManager for StubNetns {
        async fn create_namespace(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_namespace(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        fn namespace_path(&self, instance_id: &str) -> PathBuf {
            PathBuf::from("/run/netns").join(instance_id)
        }
    }

    struct StubNetIf;

    #[async_trait]
    impl InterfaceManager for StubNetIf {
        async fn create_bridge(&self, _name: &str, _ip: &str, _subnet: &str) -> Result<()> {
            Ok(())
        }

        async fn create_vlan(&self, _name: &str, _vlan_id: u64) -> Result<()> {
            Ok(())
        }

        async fn set_master(&self, _link: &str, _master: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_link(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct NullCounter;

    #[async_trait]
    impl TrafficCounter for NullCounter {
        async fn chain_bytes(&self, _chain: &str) -> Result<u64> {
            Ok(0)
        }
    }

    struct StubFs {
        mount_point: PathBuf,
    }

    impl FsPlatform for StubFs {
        fn mount_point(&self, _path: &Path) -> Result<PathBuf> {
            Ok(self.mount_point.clone())
        }

        fn total_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(u64::MAX / 2)
        }

        fn available_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(u64::MAX / 2)
        }

        fn dir_size(&self, _path: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    struct NullDownloader;

    #[async_trait]
    impl Downloader for NullDownloader {
        async fn download(&self, _url: &str, target: &Path) -> Result<()> {
            std::fs::write(target, b"archive")?;

            Ok(())
        }
    }

    struct NullImageHandler;

    #[async_trait]
    impl ImageHandler for NullImageHandler {
        async fn install_layer(
            &self,
            _archive: &Path,
            layers_dir: &Path,
            layer: &LayerInfo,
        ) -> Result<InstalledLayer> {
            let path = layers_dir.join("sha256").join(layer.layer_digest.trim_start_matches("sha256:"));
            std::fs::create_dir_all(&path)?;

            Ok(InstalledLayer { path, digest: layer.layer_digest.clone() })
        }
    }

    struct NullUsage;

    #[async_trait]
    impl ResourceUsageProvider for NullUsage {
        async fn node_monitoring_data(&self, _node_id: &str) -> Result<MonitoringData> {
            Ok(MonitoringData::default())
        }

        async fn instance_monitoring_data(
            &self,
            _instance_id: &str,
            _partitions: &[PartitionUsage],
        ) -> Result<MonitoringData> {
            Ok(MonitoringData::default())
        }
    }

    struct NullMonitorSender;

    #[async_trait]
    impl MonitorSender for NullMonitorSender {
        async fn send_monitoring_data(&self, _data: &NodeMonitoringData) -> Result<()> {
            Ok(())
        }
    }

    struct NullAlertSender;

    #[async_trait]
    impl AlertSender for NullAlertSender {
        async fn send_alert(&self, _alert: Alert) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        launcher: Arc<Launcher>,
        runner: Arc<StubRunner>,
        receiver: Arc<StubStatusReceiver>,
        storage: Arc<SqliteStorage>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(tag: &str, runner: StubRunner) -> Fixture {
        crate::tools::logging::init("warn");

        let dir = tempfile::tempdir().unwrap();

        let config = Config::new(
            dir.path().join("work"),
            dir.path().join("storage"),
            dir.path().join("state"),
        );

        let node_info = NodeInfo {
            node_id: "node1".to_string(),
            node_type: "edge".to_string(),
            max_dmips: 10_000,
            total_ram: 1 << 30,
            num_cpu_cores: 2,
            partitions: Vec::new(),
        };

        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let fs_platform = Arc::new(StubFs { mount_point: PathBuf::from(format!("/mnt/launcher-{tag}")) });

        let layer_manager = LayerManager::new(
            LayerManagerConfig {
                layers_dir: config.layers_dir(),
                download_dir: config.download_dir(),
                ttl: Duration::from_secs(3600),
                limit_percent: 0,
                num_install_workers: 2,
            },
            fs_platform,
            storage.clone(),
            Arc::new(NullDownloader),
            Arc::new(NullImageHandler),
            Arc::new(StubOci),
        )
        .await
        .unwrap();

        let resource_manager = Arc::new(ResourceManager::new(dir.path().join("nodeconfig.json"), "edge"));

        let traffic = TrafficMonitor::new(storage.clone(), Arc::new(NullCounter), Duration::from_secs(60));
        let network_manager = Arc::new(
            NetworkManager::new(
                &config.work_dir,
                storage.clone(),
                Arc::new(StubCni),
                Arc::new(StubNetns),
                Arc::new(StubNetIf),
                traffic,
            )
            .await
            .unwrap(),
        );

        let monitor = Arc::new(ResourceMonitor::new(
            MonitorConfig::default(),
            node_info.clone(),
            Arc::new(NullUsage),
            Arc::new(NullMonitorSender),
            Arc::new(NullAlertSender),
        ));

        let runner = Arc::new(runner);
        let receiver = Arc::new(StubStatusReceiver::default());

        let launcher = Launcher::new(
            config,
            node_info,
            Arc::new(StubServiceManager::default()),
            layer_manager,
            resource_manager,
            network_manager,
            Arc::new(StubPermHandler),
            runner.clone(),
            Arc::new(StubRuntimeOps),
            monitor,
            Arc::new(StubOci),
            receiver.clone(),
            storage.clone(),
        )
        .await
        .unwrap();

        Fixture { launcher, runner, receiver, storage, _dir: dir }
    }

    fn desired_services() -> Vec<ServiceInfo> {
        vec![ServiceInfo {
            service_id: "service1".to_string(),
            provider_id: "provider1".to_string(),
            version: "1.0.0".to_string(),
            gid: 0,
            url: "https://example.com/service1".to_string(),
            sha256: Vec::new(),
            size: 0,
        }]
    }

    fn desired_instances(count: u64) -> Vec<InstanceInfo> {
        (0..count)
            .map(|index| InstanceInfo {
                ident: InstanceIdent {
                    service_id: "service1".to_string(),
                    subject_id: "subject1".to_string(),
                    instance: index,
                },
                uid: 5000 + index as u32,
                priority: 0,
                state_path: String::new(),
                storage_path: String::new(),
                network_parameters: NetworkParameters::default(),
            })
            .collect()
    }

    async fn wait_cycle(fixture: &Fixture) {
        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;

            if !fixture.launcher.state.lock().await.launch_in_progress {
                return;
            }
        }

        panic!("reconciliation did not finish");
    }

    #[tokio::test]
    async fn launch_three_instances() {
        let fixture = fixture("three", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(3), false)
            .await
            .unwrap();

        wait_cycle(&fixture).await;

        let reports = fixture.receiver.run_statuses.lock();
        let report = reports.last().unwrap();

        assert_eq!(report.len(), 3);

        for index in 0..3u64 {
            let status = report
                .iter()
                .find(|status| status.ident.instance == index)
                .unwrap();

            assert_eq!(status.ident.service_id, "service1");
            assert_eq!(status.service_version, "1.0.0");
            assert_eq!(status.run_state, RunState::Active);
            assert_eq!(status.error, None);
        }

        drop(reports);

        assert_eq!(fixture.storage.get_all_instances().await.unwrap().len(), 3);
        assert_eq!(fixture.runner.started.lock().len(), 3);
    }

    #[tokio::test]
    async fn version_upgrade_restarts_instances() {
        let fixture = fixture("upgrade", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(3), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        let mut upgraded = desired_services();
        upgraded[0].version = "2.0.0".to_string();

        fixture
            .launcher
            .run_instances(upgraded, Vec::new(), desired_instances(3), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        assert_eq!(fixture.runner.stopped.lock().len(), 3);
        assert_eq!(fixture.runner.started.lock().len(), 6);

        let reports = fixture.receiver.run_statuses.lock();
        let report = reports.last().unwrap();

        assert_eq!(report.len(), 3);
        assert!(report.iter().all(|status| status.service_version == "2.0.0"));
        assert!(report.iter().all(|status| status.run_state == RunState::Active));
    }

    #[tokio::test]
    async fn rerun_same_state_is_idempotent() {
        let fixture = fixture("idempotent", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        let stored_ids: Vec<String> = fixture
            .storage
            .get_all_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|data| data.instance_id)
            .collect();

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        assert_eq!(fixture.runner.started.lock().len(), 2);
        assert!(fixture.runner.stopped.lock().is_empty());

        // Runtime handles survive across cycles.
        let stored_after: Vec<String> = fixture
            .storage
            .get_all_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|data| data.instance_id)
            .collect();
        assert_eq!(stored_ids, stored_after);

        // Force restart overrides the match.
        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), true)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        assert_eq!(fixture.runner.stopped.lock().len(), 2);
        assert_eq!(fixture.runner.started.lock().len(), 4);
    }

    #[tokio::test]
    async fn empty_desired_state_stops_everything() {
        let fixture = fixture("empty", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        fixture
            .launcher
            .run_instances(Vec::new(), Vec::new(), Vec::new(), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        assert_eq!(fixture.runner.stopped.lock().len(), 2);
        assert!(fixture.storage.get_all_instances().await.unwrap().is_empty());

        let reports = fixture.receiver.run_statuses.lock();
        assert!(reports.last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reentrant_run_is_wrong_state() {
        let fixture = fixture("reentrant", StubRunner { delay: Some(Duration::from_millis(200)), ..Default::default() }).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(1), false)
            .await
            .unwrap();

        let err = fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(1), false)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WrongState);

        wait_cycle(&fixture).await;
    }

    #[tokio::test]
    async fn status_deferred_until_connect() {
        let fixture = fixture("deferred", StubRunner::default()).await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(1), false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.receiver.run_statuses.lock().is_empty());

        fixture.launcher.on_connect().await;
        wait_cycle(&fixture).await;

        let reports = fixture.receiver.run_statuses.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].len(), 1);
    }

    #[tokio::test]
    async fn runner_failure_reports_failed_instance() {
        let runner = StubRunner::default();
        runner.fail.store(true, Ordering::SeqCst);

        let fixture = fixture("failed", runner).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(1), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        let reports = fixture.receiver.run_statuses.lock();
        let report = reports.last().unwrap();

        assert_eq!(report.len(), 1);
        assert_eq!(report[0].run_state, RunState::Failed);
        assert_eq!(report[0].error, Some(ErrorKind::Failed));
    }

    #[tokio::test]
    async fn operation_version_mismatch_wipes_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());

        storage.set_operation_version(OPERATION_VERSION + 1).await.unwrap();
        storage
            .add_instance(&InstanceData {
                info: desired_instances(1).remove(0),
                instance_id: "stale".to_string(),
            })
            .await
            .unwrap();

        // Reuse the fixture wiring but with the pre-seeded storage.
        let config = Config::new(
            dir.path().join("work"),
            dir.path().join("storage"),
            dir.path().join("state"),
        );

        let fs_platform = Arc::new(StubFs { mount_point: PathBuf::from("/mnt/launcher-opver") });

        let layer_manager = LayerManager::new(
            LayerManagerConfig {
                layers_dir: config.layers_dir(),
                download_dir: config.download_dir(),
                ttl: Duration::from_secs(3600),
                limit_percent: 0,
                num_install_workers: 2,
            },
            fs_platform,
            storage.clone(),
            Arc::new(NullDownloader),
            Arc::new(NullImageHandler),
            Arc::new(StubOci),
        )
        .await
        .unwrap();

        let traffic = TrafficMonitor::new(storage.clone(), Arc::new(NullCounter), Duration::from_secs(60));
        let network_manager = Arc::new(
            NetworkManager::new(
                &config.work_dir,
                storage.clone(),
                Arc::new(StubCni),
                Arc::new(StubNetns),
                Arc::new(StubNetIf),
                traffic,
            )
            .await
            .unwrap(),
        );

        let node_info = NodeInfo { node_id: "node1".to_string(), ..Default::default() };

        let monitor = Arc::new(ResourceMonitor::new(
            MonitorConfig::default(),
            node_info.clone(),
            Arc::new(NullUsage),
            Arc::new(NullMonitorSender),
            Arc::new(NullAlertSender),
        ));

        let _launcher = Launcher::new(
            config,
            node_info,
            Arc::new(StubServiceManager::default()),
            layer_manager,
            Arc::new(ResourceManager::new(dir.path().join("nodeconfig.json"), "edge")),
            network_manager,
            Arc::new(StubPermHandler),
            Arc::new(StubRunner::default()),
            Arc::new(StubRuntimeOps),
            monitor,
            Arc::new(StubOci),
            Arc::new(StubStatusReceiver::default()),
            storage.clone(),
        )
        .await
        .unwrap();

        assert!(storage.get_all_instances().await.unwrap().is_empty());
        assert_eq!(storage.get_operation_version().await.unwrap(), Some(OPERATION_VERSION));
    }

    #[tokio::test]
    async fn override_env_restarts_affected_instances() {
        let fixture = fixture("env", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        let env_info = vec![EnvVarsInstanceInfo {
            filter: crate::types::InstanceFilter {
                service_id: Some("service1".to_string()),
                ..Default::default()
            },
            variables: vec![
                crate::types::EnvVarInfo { name: "LOG_LEVEL".to_string(), value: "debug".to_string(), ttl: None },
                crate::types::EnvVarInfo {
                    name: "EXPIRED".to_string(),
                    value: "1".to_string(),
                    ttl: Some(Utc::now() - chrono::Duration::seconds(60)),
                },
            ],
        }];

        let statuses = fixture.launcher.override_env_vars(env_info).await.unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].statuses[0].error, None);
        assert_eq!(statuses[0].statuses[1].error, Some(ErrorKind::Timeout));

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(2), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        // Both matching instances were restarted on the next cycle.
        assert_eq!(fixture.runner.stopped.lock().len(), 2);
        assert_eq!(fixture.runner.started.lock().len(), 4);
    }

    #[tokio::test]
    async fn run_status_updates_forwarded() {
        let fixture = fixture("updates", StubRunner::default()).await;
        fixture.launcher.on_connect().await;

        fixture
            .launcher
            .run_instances(desired_services(), Vec::new(), desired_instances(1), false)
            .await
            .unwrap();
        wait_cycle(&fixture).await;

        let instance_id = fixture.storage.get_all_instances().await.unwrap()[0].instance_id.clone();

        fixture
            .launcher
            .update_run_status(vec![RunStatus {
                instance_id,
                state: RunState::Failed,
                error: Some(Error::runtime("container exited")),
            }])
            .await
            .unwrap();

        let updates = fixture.receiver.update_statuses.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0][0].run_state, RunState::Failed);
        assert_eq!(updates[0][0].error, Some(ErrorKind::Runtime));
    }
}

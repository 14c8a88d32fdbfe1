//! One service instance: runtime spec assembly and the start/stop pipelines.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::launcher::InstanceContext;
use crate::monitoring::InstanceMonitorParams;
use crate::network::InstanceNetworkParams;
use crate::oci::{
    self, ImageSpec, Linux, LinuxCpu, LinuxMemory, LinuxNamespace, LinuxPids, LinuxResources, Mount, PosixRlimit,
    Process, Root, RuntimeSpec, ServiceConfig, User, RUNTIME_SPEC_FILE,
};
use crate::types::{InstanceInfo, PartitionUsage, RunState, ServiceData};

const ROOTFS_DIR: &str = "rootfs";
const MOUNT_POINTS_DIR: &str = "mounts";
const STATE_PARTITION: &str = "state";
const STORAGE_PARTITION: &str = "storage";
const INSTANCE_STATE_FILE: &str = "/state.dat";
const INSTANCE_STORAGE_DIR: &str = "/storage";
const LINUX_OS: &str = "linux";
const XRUN_RUNNER: &str = "xrun";

const DEFAULT_CPU_PERIOD: u64 = 100_000;
const MIN_CPU_QUOTA: i64 = 1_000;

const ENV_SERVICE_ID: &str = "AOS_SERVICE_ID";
const ENV_SUBJECT_ID: &str = "AOS_SUBJECT_ID";
const ENV_INSTANCE_INDEX: &str = "AOS_INSTANCE_INDEX";
const ENV_INSTANCE_ID: &str = "AOS_INSTANCE_ID";
const ENV_SECRET: &str = "AOS_SECRET";

static BIND_ETC_ENTRIES: &[&str] = &["nsswitch.conf", "ssl"];

pub(crate) struct Instance {
    ctx: Arc<InstanceContext>,
    instance_id: String,
    info: InstanceInfo,
    service: ServiceData,
    override_env: Vec<String>,
    runtime_dir: PathBuf,
    state: parking_lot::Mutex<(RunState, Option<ErrorKind>)>,
    permissions_registered: AtomicBool,
}

impl Instance {
    pub(crate) fn new(
        ctx: Arc<InstanceContext>,
        instance_id: String,
        info: InstanceInfo,
        service: ServiceData,
        override_env: Vec<String>,
    ) -> Self {
        let runtime_dir = ctx.config.runtime_dir().join(&instance_id);

        tracing::debug!(ident = %info.ident, instance_id, "create instance");

        Self {
            ctx,
            instance_id,
            info,
            service,
            override_env,
            runtime_dir,
            state: parking_lot::Mutex::new((RunState::Failed, None)),
            permissions_registered: AtomicBool::new(false),
        }
    }

    pub(crate) fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub(crate) fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub(crate) fn service_version(&self) -> &str {
        &self.service.version
    }

    pub(crate) fn run_state(&self) -> (RunState, Option<ErrorKind>) {
        *self.state.lock()
    }

    pub(crate) fn set_run_state(&self, state: RunState, error: Option<ErrorKind>) {
        *self.state.lock() = (state, error);
    }

    pub(crate) async fn start(&self) -> Result<()> {
        tracing::info!(ident = %self.info.ident, instance_id = %self.instance_id, "start instance");

        crate::tools::fs::clear_dir(&self.runtime_dir)?;

        let parts = self.ctx.service_manager.image_parts(&self.service).await?;
        let service_config = self.ctx.oci.load_service_config(&parts.service_config_path).await?;

        let runtime_spec = self.create_runtime_spec(&parts.image_config_path, &parts.service_fs_path, &service_config).await?;

        self.ctx
            .oci
            .save_runtime_spec(&self.runtime_dir.join(RUNTIME_SPEC_FILE), &runtime_spec)
            .await?;

        self.setup_network(&service_config).await?;

        if !self.info.state_path.is_empty() {
            let state_path = self.full_state_path();

            tracing::debug!(ident = %self.info.ident, path = %state_path.display(), "prepare state");

            self.ctx
                .runtime
                .prepare_service_state(&state_path, self.info.uid, self.service.gid)
                .await?;
        }

        if !self.info.storage_path.is_empty() {
            let storage_path = self.full_storage_path();

            tracing::debug!(ident = %self.info.ident, path = %storage_path.display(), "prepare storage");

            self.ctx
                .runtime
                .prepare_service_storage(&storage_path, self.info.uid, self.service.gid)
                .await?;
        }

        self.prepare_rootfs(&parts.service_fs_path, &parts.layer_digests, &runtime_spec.mounts).await?;

        let run_status = self.ctx.runner.start_instance(&self.instance_id, &self.runtime_dir).await;

        self.set_run_state(run_status.state, run_status.error.as_ref().map(Error::kind));

        if let Some(err) = run_status.error {
            return Err(err);
        }

        self.setup_monitoring(&service_config).await?;

        tracing::info!(ident = %self.info.ident, instance_id = %self.instance_id, "instance started");

        Ok(())
    }

    /// Stops the instance. Every teardown step runs even when an earlier one
    /// fails; the first error is returned.
    pub(crate) async fn stop(&self) -> Result<()> {
        tracing::info!(ident = %self.info.ident, instance_id = %self.instance_id, "stop instance");

        let mut stop_err: Option<Error> = None;

        if let Err(err) = self.ctx.runner.stop_instance(&self.instance_id).await {
            tracing::error!(instance_id = %self.instance_id, %err, "can't stop runner instance");
            stop_err.get_or_insert(err);
        }

        if let Err(err) = self.ctx.monitor.stop_instance_monitoring(&self.instance_id).await {
            tracing::error!(instance_id = %self.instance_id, %err, "can't stop instance monitoring");
            stop_err.get_or_insert(err);
        }

        if self.permissions_registered.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.ctx.perm_handler.unregister_instance(&self.info.ident).await {
                tracing::error!(instance_id = %self.instance_id, %err, "can't unregister instance permissions");
                stop_err.get_or_insert(err);
            }
        }

        if let Err(err) = self.ctx.resource_manager.release_instance_devices(&self.instance_id).await {
            if !err.is(ErrorKind::NotFound) {
                tracing::error!(instance_id = %self.instance_id, %err, "can't release instance devices");
                stop_err.get_or_insert(err);
            }
        }

        if let Err(err) = self
            .ctx
            .network_manager
            .remove_instance_from_network(&self.instance_id, &self.service.provider_id)
            .await
        {
            if !err.is(ErrorKind::NotFound) {
                tracing::error!(instance_id = %self.instance_id, %err, "can't remove instance from network");
                stop_err.get_or_insert(err);
            }
        }

        let rootfs = self.runtime_dir.join(ROOTFS_DIR);

        if rootfs.exists() {
            if let Err(err) = self.ctx.runtime.umount_service_rootfs(&rootfs).await {
                tracing::error!(instance_id = %self.instance_id, %err, "can't umount rootfs");
                stop_err.get_or_insert(err);
            }
        }

        if self.runtime_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.runtime_dir) {
                tracing::error!(instance_id = %self.instance_id, %err, "can't remove runtime dir");
                stop_err.get_or_insert(err.into());
            }
        }

        match stop_err {
            Some(err) => Err(err),
            None => {
                tracing::info!(ident = %self.info.ident, instance_id = %self.instance_id, "instance stopped");

                Ok(())
            }
        }
    }

    fn full_state_path(&self) -> PathBuf {
        self.ctx.config.state_dir.join(&self.info.state_path)
    }

    fn full_storage_path(&self) -> PathBuf {
        self.ctx.config.storage_dir.join(&self.info.storage_path)
    }

    async fn create_runtime_spec(
        &self,
        image_config_path: &Path,
        service_fs_path: &Path,
        service_config: &ServiceConfig,
    ) -> Result<RuntimeSpec> {
        let image_spec = self.ctx.oci.load_image_spec(image_config_path).await?;

        if service_config.runners.iter().any(|runner| runner == XRUN_RUNNER) {
            return self.create_vm_spec(service_fs_path, &image_spec);
        }

        self.create_linux_spec(&image_spec, service_config).await
    }

    fn create_vm_spec(&self, service_fs_path: &Path, image_spec: &ImageSpec) -> Result<RuntimeSpec> {
        tracing::debug!(instance_id = %self.instance_id, "create VM runtime spec");

        let entry_point = image_spec
            .config
            .entrypoint
            .first()
            .ok_or_else(|| Error::invalid_argument("VM image config has no entry point"))?;

        Ok(RuntimeSpec {
            oci_version: "1.0.2".to_string(),
            vm: Some(oci::Vm {
                hw_config: oci::VmHwConfig { vcpus: 1, mem_kb: 8192 },
                kernel: oci::VmKernel {
                    path: service_fs_path.join(entry_point),
                    parameters: image_spec.config.cmd.clone(),
                },
            }),
            ..Default::default()
        })
    }

    async fn create_linux_spec(&self, image_spec: &ImageSpec, service_config: &ServiceConfig) -> Result<RuntimeSpec> {
        tracing::debug!(instance_id = %self.instance_id, "create Linux runtime spec");

        if image_spec.os.to_lowercase() != LINUX_OS {
            return Err(Error::not_supported(format!("unsupported OS {} in image config", image_spec.os)));
        }

        let mut spec = RuntimeSpec {
            oci_version: "1.0.2".to_string(),
            process: Some(Process {
                terminal: false,
                user: User { uid: self.info.uid, gid: self.service.gid, additional_gids: Vec::new() },
                cwd: if image_spec.config.working_dir.is_empty() {
                    "/".to_string()
                } else {
                    image_spec.config.working_dir.clone()
                },
                ..Default::default()
            }),
            root: Some(Root { path: self.runtime_dir.join(ROOTFS_DIR), readonly: false }),
            linux: Some(Linux {
                cgroups_path: format!("/edged/{}", self.instance_id),
                sysctl: service_config.sysctl.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let process = spec.process.as_mut().expect("process is set");

        // Image entry point and command become the process args.
        process.args.extend(image_spec.config.entrypoint.iter().cloned());
        process.args.extend(image_spec.config.cmd.iter().cloned());
        process.env.extend(image_spec.config.env.iter().cloned());

        process.env.push(format!("{ENV_SERVICE_ID}={}", self.service.service_id));
        process.env.push(format!("{ENV_SUBJECT_ID}={}", self.info.ident.subject_id));
        process.env.push(format!("{ENV_INSTANCE_INDEX}={}", self.info.ident.instance));
        process.env.push(format!("{ENV_INSTANCE_ID}={}", self.instance_id));
        process.env.extend(self.override_env.iter().cloned());

        if let Some(hostname) = &service_config.hostname {
            spec.hostname = hostname.clone();
        }

        for entry in BIND_ETC_ENTRIES {
            let path = format!("/etc/{entry}");
            spec.mounts.push(Mount::bind(path.clone(), path, "bind,ro"));
        }

        for bind in &self.ctx.config.host_binds {
            spec.mounts.push(Mount::bind(bind.clone(), bind.clone(), "bind,ro"));
        }

        let netns_path = self.ctx.network_manager.netns_path(&self.instance_id);

        spec.linux.as_mut().expect("linux is set").namespaces.push(LinuxNamespace {
            ns_type: "network".to_string(),
            path: netns_path.to_string_lossy().into_owned(),
        });

        self.apply_service_config(&mut spec, service_config).await?;
        self.apply_state_storage(&mut spec);

        Ok(spec)
    }

    async fn apply_service_config(&self, spec: &mut RuntimeSpec, service_config: &ServiceConfig) -> Result<()> {
        let linux = spec.linux.as_mut().expect("linux is set");
        let process = spec.process.as_mut().expect("process is set");
        let mut resources = LinuxResources::default();

        if let Some(dmips_limit) = service_config.quotas.cpu_dmips_limit {
            let num_cores = self.ctx.node_info.num_cpu_cores.max(1);
            let mut quota = (dmips_limit * DEFAULT_CPU_PERIOD * num_cores / self.ctx.node_info.max_dmips.max(1)) as i64;

            if quota < MIN_CPU_QUOTA {
                quota = MIN_CPU_QUOTA;
            }

            resources.cpu = Some(LinuxCpu { quota: Some(quota), period: Some(DEFAULT_CPU_PERIOD) });
        }

        if let Some(ram_limit) = service_config.quotas.ram_limit {
            resources.memory = Some(LinuxMemory { limit: Some(ram_limit as i64) });
        }

        if let Some(pids_limit) = service_config.quotas.pids_limit {
            resources.pids = Some(LinuxPids { limit: pids_limit as i64 });

            process.rlimits.push(PosixRlimit {
                rlimit_type: "RLIMIT_NPROC".to_string(),
                hard: pids_limit,
                soft: pids_limit,
            });
        }

        if let Some(no_file_limit) = service_config.quotas.no_file_limit {
            process.rlimits.push(PosixRlimit {
                rlimit_type: "RLIMIT_NOFILE".to_string(),
                hard: no_file_limit,
                soft: no_file_limit,
            });
        }

        if let Some(tmp_limit) = service_config.quotas.tmp_limit {
            spec.mounts.push(Mount {
                destination: "/tmp".to_string(),
                mount_type: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options: format!("nosuid,strictatime,mode=1777,size={tmp_limit}")
                    .split(',')
                    .map(str::to_string)
                    .collect(),
            });
        }

        if !service_config.permissions.is_empty() {
            let secret = self
                .ctx
                .perm_handler
                .register_instance(&self.info.ident, &service_config.permissions)
                .await?;

            self.permissions_registered.store(true, Ordering::SeqCst);

            process.env.push(format!("{ENV_SECRET}={secret}"));
        }

        for resource_name in &service_config.resources {
            let resource = self.ctx.resource_manager.resource_info(resource_name).await?;

            for group in &resource.groups {
                let gid = self.ctx.runtime.gid_by_name(group).await?;

                if !process.user.additional_gids.contains(&gid) {
                    process.user.additional_gids.push(gid);
                }
            }

            spec.mounts.extend(resource.mounts.iter().cloned());
            process.env.extend(resource.env.iter().cloned());
        }

        for device in &service_config.devices {
            let device_info = self.ctx.resource_manager.device_info(&device.device).await?;

            self.ctx.resource_manager.allocate_device(&device.device, &self.instance_id).await?;

            for group in &device_info.groups {
                let gid = self.ctx.runtime.gid_by_name(group).await?;

                if !process.user.additional_gids.contains(&gid) {
                    process.user.additional_gids.push(gid);
                }
            }

            for host_device in &device_info.host_devices {
                let populated = self.ctx.runtime.host_devices(Path::new(host_device)).await?;

                for linux_device in populated {
                    resources.devices.push(oci::LinuxDeviceCgroup {
                        allow: true,
                        device_type: linux_device.device_type.clone(),
                        major: Some(linux_device.major),
                        minor: Some(linux_device.minor),
                        access: if device.permissions.is_empty() {
                            "rwm".to_string()
                        } else {
                            device.permissions.clone()
                        },
                    });

                    linux.devices.push(linux_device);
                }
            }
        }

        if resources != LinuxResources::default() {
            linux.resources = Some(resources);
        }

        Ok(())
    }

    fn apply_state_storage(&self, spec: &mut RuntimeSpec) {
        if !self.info.state_path.is_empty() {
            spec.mounts.push(Mount::bind(
                self.full_state_path().to_string_lossy().into_owned(),
                INSTANCE_STATE_FILE,
                "bind,rw",
            ));
        }

        if !self.info.storage_path.is_empty() {
            spec.mounts.push(Mount::bind(
                self.full_storage_path().to_string_lossy().into_owned(),
                INSTANCE_STORAGE_DIR,
                "bind,rw",
            ));
        }
    }

    async fn setup_network(&self, service_config: &ServiceConfig) -> Result<()> {
        tracing::debug!(instance_id = %self.instance_id, "setup network");

        let mount_points = self.runtime_dir.join(MOUNT_POINTS_DIR);

        let mut hosts = self.ctx.config.hosts.clone();

        for resource_name in &service_config.resources {
            let resource = self.ctx.resource_manager.resource_info(resource_name).await?;
            hosts.extend(resource.hosts.iter().cloned());
        }

        let params = InstanceNetworkParams {
            ident: self.info.ident.clone(),
            network: self.info.network_parameters.clone(),
            hostname: service_config.hostname.clone().unwrap_or_default(),
            aliases: service_config.aliases.clone(),
            exposed_ports: service_config.exposed_ports.clone(),
            ingress_kbit: service_config.quotas.download_speed.unwrap_or(0),
            egress_kbit: service_config.quotas.upload_speed.unwrap_or(0),
            download_limit: service_config.quotas.download_limit.unwrap_or(0),
            upload_limit: service_config.quotas.upload_limit.unwrap_or(0),
            hosts,
            hosts_file_path: Some(mount_points.join("etc/hosts")),
            resolv_conf_file_path: Some(mount_points.join("etc/resolv.conf")),
        };

        self.ctx.runtime.prepare_network_dir(&mount_points).await?;

        match self
            .ctx
            .network_manager
            .add_instance_to_network(&self.instance_id, &self.service.provider_id, &params)
            .await
        {
            Ok(()) => Ok(()),
            // Idempotent re-add after an aborted cycle.
            Err(err) if err.is(ErrorKind::AlreadyExist) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn setup_monitoring(&self, service_config: &ServiceConfig) -> Result<()> {
        tracing::debug!(instance_id = %self.instance_id, "setup monitoring");

        let mut partitions = Vec::new();

        if !self.info.state_path.is_empty() {
            partitions.push(PartitionUsage {
                name: STATE_PARTITION.to_string(),
                path: self.full_state_path(),
                total_size: 0,
                used_size: 0,
            });
        }

        if !self.info.storage_path.is_empty() {
            partitions.push(PartitionUsage {
                name: STORAGE_PARTITION.to_string(),
                path: self.full_storage_path(),
                total_size: 0,
                used_size: 0,
            });
        }

        let params = InstanceMonitorParams {
            ident: self.info.ident.clone(),
            uid: self.info.uid,
            gid: self.service.gid,
            partitions,
            alert_rules: service_config.alert_rules.clone(),
        };

        self.ctx
            .monitor
            .start_instance_monitoring(&self.instance_id, params)
            .await
    }

    async fn prepare_rootfs(
        &self,
        service_fs_path: &Path,
        layer_digests: &[String],
        mounts: &[Mount],
    ) -> Result<()> {
        tracing::debug!(instance_id = %self.instance_id, "prepare rootfs");

        let mount_points = self.runtime_dir.join(MOUNT_POINTS_DIR);

        self.ctx.runtime.create_mount_points(&mount_points, mounts).await?;

        let mut layers = vec![mount_points, service_fs_path.to_path_buf()];

        for digest in layer_digests {
            let layer = self.ctx.layer_manager.layer(digest).await?;

            layers.push(layer.path);
        }

        layers.push(self.ctx.config.host_whiteouts_dir());
        layers.push(PathBuf::from("/"));

        self.ctx
            .runtime
            .mount_service_rootfs(&self.runtime_dir.join(ROOTFS_DIR), &layers)
            .await
    }
}

impl From<&Instance> for crate::types::InstanceStatus {
    fn from(instance: &Instance) -> Self {
        let (run_state, error) = instance.run_state();

        Self {
            ident: instance.info.ident.clone(),
            service_version: instance.service.version.clone(),
            run_state,
            error,
        }
    }
}

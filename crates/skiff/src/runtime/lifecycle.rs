//! Container lifecycle: run, ps, logs, exec, stop and rm.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use skiff_common::{ContainerId, SkiffError, SkiffResult};
use skiff_network::portmap::endpoint_mappings;
use skiff_network::NetworkContext;

use super::config::RuntimeConfig;
use super::container::{ContainerInfo, ContainerStatus, NetworkAttachment};
use super::state::ContainerStore;
use crate::cgroup::{CgroupManager, ResourceConfig};
use crate::exec::{self, InitOptions, StartupDescriptor};
use crate::filesystem::{HostMounter, Mounter, Workspace};
use crate::image::{ImageStore, resolve_command};

/// How often `logs -f` checks for new output.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Network a container is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    /// Share the host's network namespace.
    Host,
    /// Share the network namespace of another container.
    Container(String),
    /// Attach to a named network.
    Network(String),
}

impl FromStr for NetworkMode {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(SkiffError::Config {
                message: "network name must not be empty".to_string(),
            }),
            "host" => Ok(Self::Host),
            _ => match s.strip_prefix("container:") {
                Some("") => Err(SkiffError::Config {
                    message: "container:<name> needs a container".to_string(),
                }),
                Some(reference) => Ok(Self::Container(reference.to_string())),
                None => Ok(Self::Network(s.to_string())),
            },
        }
    }
}

/// Parameters of `skiff run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Attach the terminal and wait for the container.
    pub tty: bool,
    /// Resource limits.
    pub resources: ResourceConfig,
    /// `host:container` volume specs.
    pub volumes: Vec<String>,
    /// Container name.
    pub name: Option<String>,
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Image reference.
    pub image: String,
    /// Network to join.
    pub network: Option<NetworkMode>,
    /// `hostPort:containerPort` mappings.
    pub ports: Vec<String>,
    /// User command.
    pub command: Vec<String>,
}

/// Result of `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Id of the new container.
    pub id: ContainerId,
    /// Host pid of init.
    pub pid: u32,
    /// Exit code, for containers run in the foreground.
    pub exit_code: Option<i32>,
}

/// Entry point for container operations.
#[derive(Debug)]
pub struct Runtime<M: Mounter = HostMounter> {
    config: RuntimeConfig,
    containers: ContainerStore,
    images: ImageStore,
    workspace: Workspace<M>,
}

impl Runtime {
    /// Runtime performing real mounts.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_mounter(config, HostMounter)
    }
}

impl<M: Mounter> Runtime<M> {
    /// Runtime using `mounter` for workspace mounts.
    #[must_use]
    pub fn with_mounter(config: RuntimeConfig, mounter: M) -> Self {
        Self {
            containers: ContainerStore::new(config.paths.clone()),
            images: ImageStore::new(config.paths.clone()),
            workspace: Workspace::with_mounter(config.paths.clone(), mounter),
            config,
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Container records.
    #[must_use]
    pub const fn containers(&self) -> &ContainerStore {
        &self.containers
    }

    /// Image store.
    #[must_use]
    pub const fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Start a container.
    ///
    /// The workspace is built and init cloned; then the record is written,
    /// limits applied and the network connected, and only then is the
    /// command handed to init. Cgroup and network failures are logged and
    /// the container keeps running. In the foreground this waits for the
    /// container and tears it down.
    ///
    /// # Errors
    ///
    /// Returns an error if the image or a referenced container cannot be
    /// resolved, the name is taken, an option is malformed, or the container
    /// cannot be started.
    pub fn run(&self, options: RunOptions) -> SkiffResult<RunOutcome> {
        let image = self.images.resolve(&options.image)?;
        if let Some(name) = &options.name {
            if self.containers.name_in_use(name)? {
                return Err(SkiffError::NameInUse { name: name.clone() });
            }
        }
        if let Some(NetworkMode::Container(reference)) = &options.network {
            self.containers.resolve(reference, false)?;
        }
        endpoint_mappings(Ipv4Addr::UNSPECIFIED, &options.ports)?;

        let cmds = resolve_command(&options.command, &image, options.tty);
        if cmds.is_empty() {
            return Err(SkiffError::Config {
                message: format!("no command given and image '{}' has no default", image.id),
            });
        }

        let mut info = ContainerInfo::new(
            ContainerId::generate(),
            options.name.clone(),
            &image.id,
            &self.config.paths,
        );
        info.command = cmds.join(" ");
        info.port_mapping.clone_from(&options.ports);
        fs::create_dir_all(&info.base_url)
            .map_err(|e| SkiffError::from_io(e, format!("create {}", info.base_url.display())))?;

        let merged = match self
            .workspace
            .create(&mut info, &options.volumes, &self.images, &image)
        {
            Ok(merged) => merged,
            Err(e) => {
                self.abandon(&info);
                return Err(e);
            }
        };

        let log_file = self.config.paths.container_log(info.id.as_str());
        let launched = exec::spawn_init(&InitOptions {
            root: &self.config.paths.root,
            merged: &merged,
            interactive: options.tty,
            log_file: &log_file,
            env: &options.env,
        });
        let (init, pipe) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.abandon(&info);
                return Err(e);
            }
        };

        let pid = init.pid();
        info.pid = Some(pid);
        info.set_cgroup = !options.resources.is_empty();
        self.containers.save(&info)?;
        tracing::info!(container_id = %info.id, name = %info.name, pid, "Container started");

        if info.set_cgroup {
            self.limit(&info, pid, &options.resources);
        }

        let mut descriptor = StartupDescriptor {
            cmds,
            work_dir: image.work_dir.clone(),
            ..StartupDescriptor::default()
        };
        match &options.network {
            Some(NetworkMode::Host) => descriptor.host = true,
            Some(NetworkMode::Container(reference)) => {
                descriptor.shared_ns_container.clone_from(reference);
            }
            Some(NetworkMode::Network(name)) => {
                match self.connect(&info.id, name, pid, &options.ports) {
                    Ok(attachment) => {
                        info.network = Some(attachment);
                        self.containers.save(&info)?;
                    }
                    Err(e) => tracing::warn!(
                        container_id = %info.id,
                        network = %name,
                        error = %e,
                        "Network connect failed; container runs without network"
                    ),
                }
            }
            None => {}
        }

        descriptor.send(pipe)?;

        if !options.tty {
            return Ok(RunOutcome {
                id: info.id,
                pid,
                exit_code: None,
            });
        }

        let code = init.wait()?;
        tracing::info!(container_id = %info.id, exit_code = code, "Container exited");
        if let Err(e) = self.teardown(&info) {
            tracing::warn!(container_id = %info.id, error = %e, "Teardown incomplete");
        }
        Ok(RunOutcome {
            id: info.id,
            pid,
            exit_code: Some(code),
        })
    }

    fn limit(&self, info: &ContainerInfo, pid: u32, resources: &ResourceConfig) {
        let cgroup = self.cgroup(info);
        let set = cgroup.set(resources);
        let applied = cgroup.apply(pid);
        if set.is_fully_applied() && applied.is_fully_applied() {
            tracing::debug!(container_id = %info.id, cgroup = %cgroup.path().display(), "Limits applied");
        } else {
            let failed: Vec<_> = set
                .failures()
                .chain(applied.failures())
                .map(|(name, _)| name)
                .collect();
            tracing::warn!(container_id = %info.id, ?failed, "Limits partially applied");
        }
    }

    fn connect(
        &self,
        id: &ContainerId,
        network: &str,
        pid: u32,
        ports: &[String],
    ) -> SkiffResult<NetworkAttachment> {
        let context = NetworkContext::load(&self.config.paths)?;
        let endpoint = context.connect(network, id, pid, ports)?;
        Ok(NetworkAttachment {
            network: network.to_string(),
            ip: endpoint.ip,
            port_mappings: endpoint.port_mappings,
        })
    }

    fn cgroup(&self, info: &ContainerInfo) -> CgroupManager {
        CgroupManager::new(self.config.cgroup_path(info.id.as_str()))
            .with_mountinfo(&self.config.mountinfo)
    }

    /// Undo the workspace of a container that never started. The directory
    /// is only removed once nothing is mounted under it.
    fn abandon(&self, info: &ContainerInfo) {
        if let Err(e) = self.workspace.delete(info) {
            tracing::warn!(container_id = %info.id, error = %e, "Workspace cleanup failed");
            return;
        }
        if let Err(e) = self.containers.delete(info.id.as_str()) {
            tracing::warn!(container_id = %info.id, error = %e, "Failed to remove container directory");
        }
    }

    /// All containers, with running records whose init is gone marked
    /// exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub fn ps(&self) -> SkiffResult<Vec<ContainerInfo>> {
        self.containers
            .list()?
            .into_iter()
            .map(|info| self.refresh(info))
            .collect()
    }

    /// Update a stale running record.
    fn refresh(&self, mut info: ContainerInfo) -> SkiffResult<ContainerInfo> {
        let alive = info.pid.is_some_and(exec::is_alive);
        if info.status == ContainerStatus::Running && !alive {
            tracing::debug!(container_id = %info.id, "Init is gone; marking exited");
            info.status = ContainerStatus::Exited;
            info.pid = None;
            self.containers.save(&info)?;
        }
        Ok(info)
    }

    fn resolve(&self, reference: &str) -> SkiffResult<ContainerInfo> {
        let info = self.containers.resolve(reference, false)?;
        self.refresh(info)
    }

    /// Copy a container's log to `out`. With `follow`, keep copying new
    /// output until the container stops running.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be resolved or the log
    /// cannot be read or written.
    pub fn logs(&self, reference: &str, follow: bool, out: &mut impl Write) -> SkiffResult<()> {
        let info = self.containers.resolve(reference, false)?;
        let path = self.config.paths.container_log(info.id.as_str());
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !follow => return Ok(()),
            Err(e) => return Err(SkiffError::from_io(e, format!("open {}", path.display()))),
        };

        let mut offset = 0;
        loop {
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = Vec::new();
            offset += file.read_to_end(&mut chunk)? as u64;
            out.write_all(&chunk)?;
            out.flush()?;

            if !follow || !info.pid.is_some_and(exec::is_alive) {
                return Ok(());
            }
            std::thread::sleep(FOLLOW_INTERVAL);
        }
    }

    /// Run `args` inside a running container and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not running or the command
    /// cannot be started.
    pub fn exec(&self, reference: &str, args: &[String]) -> SkiffResult<i32> {
        let info = self.resolve(reference)?;
        let pid = running_pid(&info, "exec")?;
        exec::exec_in_container(pid, args)
    }

    /// Signal a container's init with SIGTERM and mark it stopped without
    /// waiting for it to exit. An exited container is just marked stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is already stopped or the signal
    /// cannot be sent.
    pub fn stop(&self, reference: &str) -> SkiffResult<ContainerInfo> {
        let mut info = self.resolve(reference)?;
        match info.status {
            ContainerStatus::Running => {
                let pid = running_pid(&info, "stop")?;
                if let Err(e) = exec::terminate(pid) {
                    if exec::is_alive(pid) {
                        return Err(e);
                    }
                }
            }
            ContainerStatus::Exited => {}
            ContainerStatus::Stopped => return Err(invalid_state(&info, "stop", "running")),
        }

        info.status = ContainerStatus::Stopped;
        info.pid = None;
        self.containers.save(&info)?;
        tracing::info!(container_id = %info.id, "Container stopped");
        Ok(info)
    }

    /// Remove a stopped container: its workspace, record, cgroup and
    /// network address.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving everything in place, if the container is
    /// not stopped; otherwise the first teardown failure.
    pub fn remove(&self, reference: &str) -> SkiffResult<()> {
        let info = self.resolve(reference)?;
        if info.status != ContainerStatus::Stopped {
            return Err(invalid_state(&info, "remove", "stopped"));
        }
        self.teardown(&info)?;
        tracing::info!(container_id = %info.id, "Container removed");
        Ok(())
    }

    /// Release everything a container holds. Every step runs; the first
    /// failure is returned. The directory is kept when an unmount failed,
    /// so bind-mounted host data is never deleted through it.
    fn teardown(&self, info: &ContainerInfo) -> SkiffResult<()> {
        let mut first_error = None;

        match self.workspace.delete(info) {
            Ok(()) => {
                if let Err(e) = self.containers.delete(info.id.as_str()) {
                    tracing::warn!(container_id = %info.id, error = %e, "Failed to delete container directory");
                    first_error.get_or_insert(e);
                }
            }
            Err(e) => {
                tracing::warn!(container_id = %info.id, "Keeping container directory; mounts remain");
                first_error.get_or_insert(e);
            }
        }

        if info.set_cgroup {
            if let Err(e) = self.cgroup(info).remove().into_result() {
                first_error.get_or_insert(e);
            }
        }

        if let Some(attachment) = &info.network {
            let released = NetworkContext::load(&self.config.paths).and_then(|context| {
                context.disconnect(&attachment.network, attachment.ip, &attachment.port_mappings)
            });
            if let Err(e) = released {
                tracing::warn!(container_id = %info.id, error = %e, "Failed to release network address");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn running_pid(info: &ContainerInfo, operation: &'static str) -> SkiffResult<u32> {
    match (info.status, info.pid) {
        (ContainerStatus::Running, Some(pid)) => Ok(pid),
        _ => Err(invalid_state(info, operation, "running")),
    }
}

fn invalid_state(info: &ContainerInfo, operation: &'static str, required: &'static str) -> SkiffError {
    SkiffError::InvalidState {
        id: info.id.to_string(),
        status: info.status.to_string(),
        operation,
        required,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::filesystem::VolumeInfo;
    use crate::image::ImageInfo;

    #[derive(Debug, Default)]
    struct NoopMounter;

    impl Mounter for NoopMounter {
        fn overlay(&self, _options: &str, _target: &std::path::Path) -> SkiffResult<()> {
            Ok(())
        }

        fn bind(&self, _source: &std::path::Path, _target: &std::path::Path) -> SkiffResult<()> {
            Ok(())
        }

        fn unmount(&self, target: &std::path::Path) -> SkiffResult<()> {
            if target.ends_with("stuck") {
                return Err(SkiffError::Internal {
                    message: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    fn runtime() -> (TempDir, Runtime<NoopMounter>) {
        let dir = TempDir::new().unwrap();
        let config = RuntimeConfig::default()
            .with_root(dir.path())
            .with_mountinfo(dir.path().join("mountinfo"));
        (dir, Runtime::with_mounter(config, NoopMounter))
    }

    fn record(runtime: &Runtime<NoopMounter>, id: &str, status: ContainerStatus) -> ContainerInfo {
        let mut info = ContainerInfo::new(
            ContainerId::new(id).unwrap(),
            None,
            "base",
            &runtime.config().paths,
        );
        info.status = status;
        if status == ContainerStatus::Running {
            info.pid = Some(std::process::id());
        }
        fs::create_dir_all(info.merged_dir()).unwrap();
        runtime.containers().save(&info).unwrap();
        info
    }

    #[test]
    fn network_modes() {
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!(
            "container:web".parse::<NetworkMode>().unwrap(),
            NetworkMode::Container("web".into())
        );
        assert_eq!(
            "skiff0".parse::<NetworkMode>().unwrap(),
            NetworkMode::Network("skiff0".into())
        );
        assert!("container:".parse::<NetworkMode>().is_err());
        assert!("".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn remove_requires_stopped() {
        let (_dir, runtime) = runtime();
        let info = record(&runtime, "abc123", ContainerStatus::Running);

        let err = runtime.remove("abc123").unwrap_err();
        assert!(matches!(err, SkiffError::InvalidState { .. }));
        assert!(info.base_url.join("config.json").exists());
        assert!(info.merged_dir().exists());
        assert_eq!(
            runtime.containers().load("abc123").unwrap().status,
            ContainerStatus::Running
        );
    }

    #[test]
    fn remove_stopped_deletes_directory() {
        let (_dir, runtime) = runtime();
        let info = record(&runtime, "abc123", ContainerStatus::Stopped);

        runtime.remove("abc").unwrap();
        assert!(!info.base_url.exists());
        assert!(matches!(
            runtime.remove("abc"),
            Err(SkiffError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn failed_unmount_keeps_directory() {
        let (dir, runtime) = runtime();
        let mut info = record(&runtime, "abc123", ContainerStatus::Stopped);
        info.volumes.push(VolumeInfo {
            host_volume_path: dir.path().join("data"),
            container_path: "/stuck".into(),
            container_path_in_host: info.merged_dir().join("stuck"),
            anonymous: false,
        });
        runtime.containers().save(&info).unwrap();

        assert!(runtime.remove("abc123").is_err());
        assert!(info.base_url.exists());
    }

    #[test]
    fn ps_marks_dead_containers_exited() {
        let (_dir, runtime) = runtime();
        let mut dead = record(&runtime, "dead00", ContainerStatus::Running);
        dead.pid = Some(i32::MAX as u32);
        runtime.containers().save(&dead).unwrap();
        record(&runtime, "live00", ContainerStatus::Running);

        let listed = runtime.ps().unwrap();
        let status = |id: &str| listed.iter().find(|c| c.id.as_str() == id).unwrap().status;
        assert_eq!(status("dead00"), ContainerStatus::Exited);
        assert_eq!(status("live00"), ContainerStatus::Running);
        assert_eq!(
            runtime.containers().load("dead00").unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[test]
    fn stop_exited_then_remove() {
        let (_dir, runtime) = runtime();
        record(&runtime, "gone00", ContainerStatus::Exited);

        let stopped = runtime.stop("gone00").unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert!(matches!(
            runtime.stop("gone00"),
            Err(SkiffError::InvalidState { .. })
        ));
        runtime.remove("gone00").unwrap();
    }

    #[test]
    fn exec_requires_running() {
        let (_dir, runtime) = runtime();
        record(&runtime, "abc123", ContainerStatus::Stopped);
        assert!(matches!(
            runtime.exec("abc123", &["ls".to_string()]),
            Err(SkiffError::InvalidState { .. })
        ));
    }

    #[test]
    fn logs_are_copied() {
        let (_dir, runtime) = runtime();
        let info = record(&runtime, "abc123", ContainerStatus::Stopped);
        fs::write(runtime.config().paths.container_log(info.id.as_str()), "hello\n").unwrap();

        let mut out = Vec::new();
        runtime.logs("abc123", true, &mut out).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn run_validates_before_starting() {
        let (_dir, runtime) = runtime();
        runtime.images().save(&ImageInfo::base()).unwrap();
        record(&runtime, "abc123", ContainerStatus::Stopped);
        let existing = runtime.containers().load("abc123").unwrap();

        let taken = runtime.run(RunOptions {
            image: "base".into(),
            name: Some(existing.name),
            ..RunOptions::default()
        });
        assert!(matches!(taken, Err(SkiffError::NameInUse { .. })));

        let missing_image = runtime.run(RunOptions {
            image: "nope".into(),
            ..RunOptions::default()
        });
        assert!(matches!(missing_image, Err(SkiffError::ImageNotFound { .. })));

        let bad_port = runtime.run(RunOptions {
            image: "base".into(),
            ports: vec!["80".into()],
            ..RunOptions::default()
        });
        assert!(matches!(bad_port, Err(SkiffError::InvalidPortMapping { .. })));

        assert_eq!(runtime.containers().list().unwrap().len(), 1);
    }
}

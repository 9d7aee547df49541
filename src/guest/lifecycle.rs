//! The five-step start sequence and stop sequence of spec §4.5.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Duration,
};

use stacked_errors::{Result, StackableErr};
use tokio::time::sleep;

use super::handlers::{HandlerChain, Phase};
use crate::{
    cloud_init::{self, CloudInitRequest, NetInfo},
    cni::{CniDriver, CniRuntime},
    config::{BinariesConfig, MachineConfig, ResourcesConfig},
    control_socket,
    identity::SshKeypair,
    remote_exec::GuestClient,
    Command,
};

/// Builds a connected [`GuestClient`] once the guest's SSH port is
/// reachable. Kept as a caller-supplied factory because establishing the
/// authenticated session is the "SSH/SFTP to a connected guest" external
/// collaborator (spec §1) this crate does not implement a concrete backend
/// for.
pub type GuestClientFactory = Arc<
    dyn Fn(SocketAddr, Arc<SshKeypair>, String) -> Pin<Box<dyn Future<Output = Result<Arc<dyn GuestClient>>> + Send>>
        + Send
        + Sync,
>;

/// Guest reachable over TCP but the caller declined to test egress (or the
/// optional egress check was disabled) versus a check that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    StoppedGracefully,
    StoppedForcefully,
}

pub struct EgressCheck {
    pub target: SocketAddr,
    pub timeout: Duration,
}

/// Everything [`start`] needs to bring up one jailed guest.
pub struct StartRequest {
    pub vm_id: String,
    pub base_rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    pub jail_root: PathBuf,
    pub binaries: BinariesConfig,
    pub resources: ResourcesConfig,
    pub machine: MachineConfig,
    pub cni: Arc<CniDriver>,
    pub cni_net_name: String,
    pub cni_net_ns: String,
    pub cni_if_name: String,
    pub ssh_keypair: Arc<SshKeypair>,
    pub ssh_connect_timeout: Duration,
    pub egress_check: Option<EgressCheck>,
    pub shutdown_graceful_timeout: Duration,
    pub env: std::collections::BTreeMap<String, String>,
    pub hostname: Option<String>,
    pub metadata: serde_json::Value,
    pub guest_client_factory: Option<GuestClientFactory>,
}

/// The scratch rootfs file's name inside the jail (`<jail_dir>/root/<name>`,
/// spec §6 on-disk layout).
pub const ROOTFS_NAME: &str = "rootfs.ext4";

/// A running (or just-stopped) jailed guest. Created by [`start`]; consumed
/// by [`GuestHandle::stop`].
pub struct GuestHandle {
    pub vm_id: String,
    pub jail_dir: PathBuf,
    pub control_socket: PathBuf,
    pub cni: CniRuntime,
    pub guest_client: Option<Arc<dyn GuestClient>>,
    pub pid: Option<u32>,
    process: tokio::sync::Mutex<Option<crate::CommandRunner>>,
    cni_driver: Arc<CniDriver>,
    cni_net_name: String,
    shutdown_graceful_timeout: Duration,
    was_stopped: AtomicBool,
}

impl GuestHandle {

    /// Runs the spec §4.5 stop sequence. Idempotent via `was_stopped`: a
    /// second call (from an explicit caller racing a watcher task) is a
    /// no-op returning the outcome of whichever call actually ran first is
    /// unobservable here, so the second caller just gets `StoppedGracefully`
    /// for "already stopped".
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<StopOutcome> {
        if self.was_stopped.swap(true, Ordering::SeqCst) {
            return Ok(StopOutcome::StoppedGracefully);
        }

        let sent = control_socket::send_ctrl_alt_del(&self.control_socket)
            .await
            .stack_err("GuestHandle::stop -> send_ctrl_alt_del")?;

        let mut outcome = StopOutcome::StoppedForcefully;
        let mut guard = self.process.lock().await;
        if let Some(runner) = guard.as_mut() {
            if sent {
                match runner.wait_with_timeout(self.shutdown_graceful_timeout).await {
                    Ok(()) => outcome = StopOutcome::StoppedGracefully,
                    Err(e) if e.is_timeout() => {
                        tracing::warn!(vm_id = %self.vm_id, "graceful shutdown timed out, forcing stop");
                        runner.terminate().await.stack_err("GuestHandle::stop -> terminate")?;
                    }
                    Err(e) => return Err(e).stack_err("GuestHandle::stop -> wait_with_timeout"),
                }
            } else {
                // control socket already refused the connection: process is
                // either already gone or about to be; force-stop either way.
                runner.terminate().await.stack_err("GuestHandle::stop -> terminate")?;
            }
        }
        drop(guard);

        if let Err(e) = self
            .cni_driver
            .cleanup(&self.cni_net_name, &self.vm_id, &self.cni.veth_name, &self.cni.net_ns)
            .await
        {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "CNI cleanup failed during stop");
        }

        Ok(outcome)
    }
}

/// Runs the spec §4.5 start sequence: copy rootfs, compose the handler
/// chain with pseudo-cloud-init spliced before boot-source, start the
/// hypervisor, wait for SSH, optionally probe egress.
#[tracing::instrument(skip_all, fields(vm_id = %request.vm_id))]
pub async fn start(request: StartRequest) -> Result<GuestHandle> {
    let firecracker = request
        .binaries
        .firecracker
        .clone()
        .stack_err_locationless("guest::start -> no firecracker binary configured")?;
    let jailer = request
        .binaries
        .jailer
        .clone()
        .stack_err_locationless("guest::start -> no jailer binary configured")?;
    let chroot_base = request
        .binaries
        .chroot_base
        .clone()
        .unwrap_or_else(|| request.jail_root.clone());
    let hypervisor_basename = firecracker
        .file_name()
        .stack_err_locationless("guest::start -> firecracker path has no basename")?
        .to_string_lossy()
        .into_owned();

    // the jailer places guest state at `<chroot_base>/<basename(exec_file)>/<id>/root`
    // (spec §3 `JailLocation`, §6 on-disk layout)
    let jail_location = super::jail::JailLocation::new(&chroot_base, &hypervisor_basename, &request.vm_id);
    let jail_dir = jail_location.path();
    let root_dir = jail_location.root_dir();
    tokio::fs::create_dir_all(&root_dir)
        .await
        .stack_err_with(|| format!("guest::start -> creating {root_dir:?}"))?;

    let scratch_rootfs = root_dir.join(ROOTFS_NAME);
    tokio::fs::copy(&request.base_rootfs_path, &scratch_rootfs)
        .await
        .stack_err("guest::start -> copying base rootfs to scratch path")?;

    let control_socket_path = jail_dir.join("firecracker.socket");

    let process = Command::new_os_str(&jailer)
        .args([
            "--id",
            &request.vm_id,
            "--exec-file",
            &firecracker.to_string_lossy(),
            "--chroot-base-dir",
            &chroot_base.to_string_lossy(),
        ])
        .debug(true)
        .run()
        .await
        .stack_err("guest::start -> spawning jailer")?;

    wait_for_control_socket(&control_socket_path, Duration::from_secs(10)).await?;

    let cni_runtime = request
        .cni
        .setup(&request.cni_net_name, &request.vm_id, &request.cni_net_ns, &request.cni_if_name)
        .await
        .stack_err("guest::start -> CNI setup")?;

    let ssh_authorized_key = request
        .ssh_keypair
        .public_authorized_keys_line(&request.vm_id)
        .stack_err("guest::start -> encoding SSH public key")?;
    let chain = build_handler_chain(
        &request,
        &control_socket_path,
        &cni_runtime,
        &scratch_rootfs,
        &jail_dir,
        &ssh_authorized_key,
    );
    chain.run().await.stack_err("guest::start -> running handler chain")?;

    let guest_ip: IpAddr = cni_runtime
        .ip
        .parse()
        .stack_err_with(|| format!("guest::start -> parsing CNI ip {:?}", cni_runtime.ip))?;
    let ssh_addr = SocketAddr::new(guest_ip, 22);
    wait_for_ssh(ssh_addr, request.ssh_connect_timeout).await?;

    let guest_client = if let Some(factory) = &request.guest_client_factory {
        Some(
            factory(ssh_addr, request.ssh_keypair.clone(), request.machine.ssh_user.clone())
                .await
                .stack_err("guest::start -> connecting guest client")?,
        )
    } else {
        None
    };

    if let Some(egress) = &request.egress_check {
        if let Some(client) = &guest_client {
            probe_egress(client.as_ref(), egress).await?;
        } else {
            tracing::warn!("egress check requested but no guest client factory was supplied; skipping");
        }
    }

    Ok(GuestHandle {
        vm_id: request.vm_id,
        jail_dir,
        control_socket: control_socket_path,
        cni: cni_runtime,
        guest_client,
        pid: process.pid(),
        process: tokio::sync::Mutex::new(Some(process)),
        cni_driver: request.cni,
        cni_net_name: request.cni_net_name,
        shutdown_graceful_timeout: request.shutdown_graceful_timeout,
        was_stopped: AtomicBool::new(false),
    })
}

fn build_handler_chain(
    request: &StartRequest,
    control_socket_path: &Path,
    cni_runtime: &CniRuntime,
    scratch_rootfs: &Path,
    jail_dir: &Path,
    ssh_authorized_key: &str,
) -> HandlerChain {
    let socket = control_socket_path.to_owned();
    let resources = request.resources.clone();
    let machine_config_handler: super::handlers::Handler = Arc::new(move || {
        let socket = socket.clone();
        let resources = resources.clone();
        Box::pin(async move {
            control_socket::put(
                &socket,
                "/machine-config",
                serde_json::json!({"vcpu_count": resources.cpu, "mem_size_mib": resources.mem_mib}),
            )
            .await
            .map(|_| ())
        })
    });

    let socket = control_socket_path.to_owned();
    let rootfs_name = ROOTFS_NAME.to_owned();
    let drives_handler: super::handlers::Handler = Arc::new(move || {
        let socket = socket.clone();
        let rootfs_name = rootfs_name.clone();
        Box::pin(async move {
            control_socket::put(
                &socket,
                "/drives/rootfs",
                serde_json::json!({
                    "drive_id": "rootfs",
                    "path_on_host": format!("root/{rootfs_name}"),
                    "is_root_device": true,
                    "is_read_only": false,
                }),
            )
            .await
            .map(|_| ())
        })
    });

    let socket = control_socket_path.to_owned();
    let veth = cni_runtime.veth_name.clone();
    let network_handler: super::handlers::Handler = Arc::new(move || {
        let socket = socket.clone();
        let veth = veth.clone();
        Box::pin(async move {
            control_socket::put(
                &socket,
                "/network-interfaces/eth0",
                serde_json::json!({"iface_id": "eth0", "host_dev_name": veth}),
            )
            .await
            .map(|_| ())
        })
    });

    let socket = control_socket_path.to_owned();
    let kernel_path = request.kernel_path.clone();
    let boot_source_handler: super::handlers::Handler = Arc::new(move || {
        let socket = socket.clone();
        let kernel_path = kernel_path.clone();
        Box::pin(async move {
            control_socket::put(
                &socket,
                "/boot-source",
                serde_json::json!({"kernel_image_path": kernel_path.to_string_lossy()}),
            )
            .await
            .map(|_| ())
        })
    });

    let socket = control_socket_path.to_owned();
    let start_instance_handler: super::handlers::Handler = Arc::new(move || {
        let socket = socket.clone();
        Box::pin(async move {
            control_socket::put(&socket, "/actions", serde_json::json!({"action_type": "InstanceStart"}))
                .await
                .map(|_| ())
        })
    });

    let mut chain = HandlerChain::new(vec![
        (Phase::MachineConfig, machine_config_handler),
        (Phase::Drives, drives_handler),
        (Phase::NetworkInterfaces, network_handler),
        (Phase::BootSource, boot_source_handler),
        (Phase::StartInstance, start_instance_handler),
    ]);

    let jail_dir = jail_dir.to_owned();
    let rootfs_name = ROOTFS_NAME.to_owned();
    let cloud_init_request = CloudInitRequest {
        env: request.env.clone(),
        hostname: request.hostname.clone(),
        cni_ip: Some(cni_runtime.ip.clone()),
        ssh_user: request.machine.ssh_user.clone(),
        ssh_public_keys: vec![ssh_authorized_key.to_owned()],
        metadata: request.metadata.clone(),
        netinfo: Some(NetInfo {
            mac: String::new(),
            host_dev: cni_runtime.veth_name.clone(),
            ip: cni_runtime.ip.clone(),
            mask: cni_runtime.mask.clone(),
            gateway: cni_runtime.gateway.clone(),
            nameservers: cni_runtime.nameservers.clone(),
        }),
    };
    let cloud_init_handler: super::handlers::Handler = Arc::new(move || {
        let jail_dir = jail_dir.clone();
        let rootfs_name = rootfs_name.clone();
        let request = cloud_init_request.clone();
        Box::pin(async move { cloud_init::run(&jail_dir, &rootfs_name, request).await })
    });
    chain.prepend_before_phase(Phase::BootSource, "pseudo-cloud-init", cloud_init_handler);

    let _ = scratch_rootfs;
    chain
}

async fn wait_for_control_socket(path: &Path, timeout: Duration) -> Result<()> {
    let mut interval = Duration::from_millis(20);
    let mut elapsed = Duration::ZERO;
    loop {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        if elapsed > timeout {
            return Err(stacked_errors::Error::timeout())
                .stack_err_with(|| format!("guest::start -> control socket {path:?} never appeared"));
        }
        sleep(interval).await;
        elapsed += interval;
        interval = (interval * 2).min(Duration::from_millis(500));
    }
}

async fn wait_for_ssh(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let mut interval = Duration::from_millis(50);
    let mut elapsed = Duration::ZERO;
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if elapsed > timeout {
            return Err(stacked_errors::Error::timeout())
                .stack_err_with(|| format!("guest::start -> SSH at {addr} never became reachable"));
        }
        sleep(interval).await;
        elapsed += interval;
        interval = (interval * 2).min(Duration::from_millis(1000));
    }
}

async fn probe_egress(client: &dyn GuestClient, egress: &EgressCheck) -> Result<()> {
    let shell = ["sh".to_owned(), "-c".to_owned()];
    let command = format!(
        "timeout {} sh -c 'cat < /dev/null > /dev/tcp/{}/{}'",
        egress.timeout.as_secs(),
        egress.target.ip(),
        egress.target.port()
    );
    let result = client
        .run_shell(&shell, "root", "/", &Default::default(), &command)
        .await
        .stack_err("guest::start -> egress check")?;
    if !result.success() {
        stacked_errors::bail_locationless!("egress check to {} failed", egress.target);
    }
    Ok(())
}

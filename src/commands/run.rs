//! `run` (spec §4.5, §4.8, §6): boots a previously-built, tagged rootfs and
//! publishes any requested ports.

use std::{path::PathBuf, sync::Arc};

use stacked_errors::{Result, StackableErr};

use super::context::{cni_driver, cni_net_ns, firewall_controller, merged_env, run_cache_dir, secs};
use crate::{
    cli::RunArgs,
    firewall::PortSpec,
    guest::{self, StartRequest},
    identity::SshKeypair,
    misc::ctrlc_issued_reset,
    registry::{
        is_pid_alive, CniSection, DriveInfo, EntrypointInfo, JailInfo, MachineInfo,
        NetworkInterfaceInfo, VMMetadata,
    },
    storage::{DirectoryStorage, ImageStorage, ImageTag},
};

pub async fn run(args: RunArgs) -> Result<()> {
    let tag = ImageTag::parse(&args.tag).stack_err("run -> parsing --tag")?;

    let rootfs_root = args
        .storage
        .directory_rootfs_storage_root
        .clone()
        .stack_err_locationless("--storage-provider.directory.rootfs-storage-root is required")?;
    let kernel_root = args
        .storage
        .directory_kernel_storage_root
        .clone()
        .stack_err_locationless("--storage-provider.directory.kernel-storage-root is required")?;
    let storage = DirectoryStorage::new(rootfs_root, kernel_root);

    let (base_rootfs_path, artifact_metadata) = storage
        .fetch_rootfs(&tag)
        .await
        .stack_err_with(|| format!("run -> fetching rootfs {tag}"))?;

    let kernel_id = args
        .machine
        .vmlinux_id
        .clone()
        .stack_err_locationless("--machine-vmlinux-id is required")?;
    let (kernel_path, _kernel_metadata) = storage
        .fetch_kernel(&kernel_id)
        .await
        .stack_err_with(|| format!("run -> fetching kernel {kernel_id:?}"))?;

    let env = merged_env(&args.env, args.env_file.as_deref()).await?;

    let firecracker = args
        .binaries
        .firecracker
        .clone()
        .stack_err_locationless("--binary-firecracker is required")?;
    let hypervisor_basename = firecracker
        .file_name()
        .stack_err_locationless("run -> --binary-firecracker path has no basename")?
        .to_string_lossy()
        .into_owned();
    let chroot_base = args
        .binaries
        .chroot_base
        .clone()
        .unwrap_or_else(|| PathBuf::from("/srv/jailer"));

    let vm_id = uuid::Uuid::new_v4().to_string();
    let ssh_keypair = Arc::new(SshKeypair::generate()?);
    let cni = Arc::new(cni_driver(&args.cni));
    let cni_net_name = args
        .machine
        .cni_network_name
        .clone()
        .stack_err_locationless("--machine-cni-network-name is required")?;
    let net_ns = cni_net_ns(&args.cni, &vm_id);

    let request = StartRequest {
        vm_id: vm_id.clone(),
        base_rootfs_path,
        kernel_path,
        jail_root: chroot_base.clone(),
        binaries: args.binaries.clone(),
        resources: args.resources.clone(),
        machine: args.machine.clone(),
        cni: cni.clone(),
        cni_net_name: cni_net_name.clone(),
        cni_net_ns: net_ns,
        cni_if_name: args.cni.if_name.clone(),
        ssh_keypair,
        ssh_connect_timeout: secs(args.ssh_connect_timeout_seconds),
        egress_check: None,
        shutdown_graceful_timeout: secs(args.shutdown_graceful_timeout_seconds),
        env,
        hostname: Some(format!("{}-{}", tag.name, &vm_id[..8])),
        metadata: serde_json::json!({"tag": tag.to_string()}),
        guest_client_factory: None,
    };

    let handle = guest::start(request).await.stack_err("run -> starting guest")?;

    let mut exposed = vec![];
    if !args.expose_port.is_empty() {
        let mut ports = vec![];
        for raw in &args.expose_port {
            ports.push(PortSpec::parse(raw).stack_err_with(|| format!("run -> --expose-port {raw:?}"))?);
        }
        let firewall = firewall_controller();
        if let Err(e) = firewall.publish(&vm_id, &handle.cni.ip, &ports).await {
            tracing::warn!(vm_id, error = %e, "failed to publish firewall rules, stopping guest");
            let _ = handle.stop().await;
            return Err(e).stack_err("run -> publishing firewall rules");
        }
        exposed = ports.iter().map(PortSpec::render).collect();
    }

    let run_cache_dir_path = run_cache_dir(&args.run_cache)?;
    let meta = VMMetadata {
        vm_id: handle.vm_id.clone(),
        pid: handle.pid,
        drives: vec![DriveInfo {
            drive_id: "rootfs".to_owned(),
            path_on_host: format!("root/{}", guest::ROOTFS_NAME),
            is_root_device: true,
            is_read_only: false,
        }],
        network_interfaces: vec![NetworkInterfaceInfo::from_cni_runtime(&args.cni.if_name, &handle.cni)],
        jail: JailInfo {
            chroot_base,
            hypervisor_basename,
        },
        machine: MachineInfo {
            cpu: args.resources.cpu,
            mem_mib: args.resources.mem_mib,
            kernel_args: vec![],
            kernel_id,
        },
        cni: CniSection {
            net_name: cni_net_name,
            runtime: handle.cni.clone(),
        },
        image_tag: tag,
        entrypoint: EntrypointInfo {
            entrypoint: artifact_metadata.entrypoint,
            cmd: artifact_metadata.cmd,
        },
        exposed_ports: exposed,
        run_cache_dir: run_cache_dir_path,
        started_at_utc: chrono::Utc::now(),
    };
    meta.save().await.stack_err("run -> persisting VM metadata")?;

    println!("{}", meta.vm_id);

    if args.daemonize {
        return Ok(());
    }

    // foreground: block until the guest process exits or Ctrl-C is pressed,
    // then run the stop sequence (spec §4.5).
    loop {
        if ctrlc_issued_reset() {
            break;
        }
        if let Some(pid) = handle.pid {
            if !is_pid_alive(pid) {
                break;
            }
        } else {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }
    handle.stop().await.stack_err("run -> stopping guest")?;
    Ok(())
}

//! `baseos` and `rootfs` (spec §4.1–§4.5, §6): the Dockerfile-model build
//! orchestrator. `rootfs` drives the full C1→C2→C3→C4/C5 pipeline over a
//! booted guest; `baseos` wraps the external container-image toolchain
//! (spec §1: base-OS image production is itself a wrapper around a
//! container toolchain, an out-of-scope external collaborator) and needs no
//! guest at all.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use stacked_errors::{bail_locationless, Result, StackableErr};

use super::context::{apply_profile, build_arg_map, cni_driver, cni_net_ns, merged_env, secs};
use crate::{
    build_state::BuildState,
    cli::{BaseosArgs, BuildArgs, RootfsArgs},
    dockerfile::{Instruction, Stage, Stages},
    guest::{self, GuestClientFactory, GuestHandle, StartRequest},
    identity::SshKeypair,
    remote_exec::{replay_stage, GuestClient, SshGuestClient, StageArtifacts},
    source::{self, ContextResolver, ResolvedResource},
    storage::{ArtifactMetadata, DirectoryStorage, ImageStorage, ImageTag},
    Command,
};

/// `baseos`: shells out to the configured image-builder toolchain and
/// stores whatever rootfs it produces (spec §1, §6).
pub async fn baseos(args: BaseosArgs) -> Result<()> {
    let mut build = args.build;
    apply_profile(
        build.profile.as_deref(),
        &build.profile_dir,
        &mut build.binaries,
        &mut build.storage,
        &mut build.run_cache,
        &mut build.tracing,
    )
    .await?;

    let tag = ImageTag::parse(&build.tag).stack_err("baseos -> parsing --tag")?;
    let storage = directory_storage(&build)?;

    let image_builder = build.binaries.image_builder.clone().stack_err_locationless(
        "--binary-image-builder is required for baseos (spec §1: base-OS image production wraps an external container toolchain)",
    )?;

    let result = Command::new_os_str(&image_builder)
        .args(["build", "--dockerfile", build.dockerfile.as_str(), "--tag", build.tag.as_str()])
        .debug(true)
        .run_to_completion()
        .await
        .stack_err("baseos -> running image-builder toolchain")?;
    result
        .assert_success()
        .stack_err("baseos -> image-builder toolchain exited non-zero")?;

    let stdout = result
        .stdout_as_utf8()
        .stack_err("baseos -> image-builder output was not UTF-8")?;
    let last_line = stdout
        .lines()
        .last()
        .stack_err_locationless("baseos -> image-builder produced no output")?;
    let output: BaseosBuilderOutput =
        serde_json::from_str(last_line).stack_err("baseos -> parsing image-builder output")?;

    if !output.rootfs_path.is_file() {
        bail_locationless!(
            "baseos -> image-builder reported rootfs {:?} which is not a regular file",
            output.rootfs_path
        );
    }

    let metadata = ArtifactMetadata {
        labels: output.labels,
        created_at_utc: Some(chrono::Utc::now()),
        ..Default::default()
    };
    let (rootfs_path, metadata_path) = storage
        .store_rootfs(&output.rootfs_path, &tag, &metadata)
        .await
        .stack_err("baseos -> storing rootfs")?;
    println!("{}", rootfs_path.display());
    if let Some(path) = metadata_path {
        tracing::debug!(?path, "wrote baseos image metadata");
    }
    Ok(())
}

/// Output contract of the external image-builder binary `baseos` invokes: a
/// single line of JSON on stdout naming the produced rootfs file and any
/// image labels to persist alongside it.
#[derive(Debug, serde::Deserialize)]
struct BaseosBuilderOutput {
    rootfs_path: std::path::PathBuf,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// `rootfs`: parses the Dockerfile into a stage graph, builds every
/// dependency stage the main stage's `COPY --from` expressions reference,
/// then builds and stores the main stage (spec §4.1–§4.5).
pub async fn rootfs(args: RootfsArgs) -> Result<()> {
    let mut build = args.build;
    apply_profile(
        build.profile.as_deref(),
        &build.profile_dir,
        &mut build.binaries,
        &mut build.storage,
        &mut build.run_cache,
        &mut build.tracing,
    )
    .await?;

    let tag = ImageTag::parse(&build.tag).stack_err("rootfs -> parsing --tag")?;
    let build_args = build_arg_map(&build.build_arg)?;
    let env = merged_env(&build.env, build.env_file.as_deref()).await?;
    let storage = directory_storage(&build)?;

    let loaded = source::load_dockerfile(&build.dockerfile)
        .await
        .stack_err("rootfs -> loading Dockerfile")?;
    let stages = Stages::parse(&loaded.text).stack_err("rootfs -> parsing Dockerfile")?;
    let resolver = ContextResolver::new(loaded.origin.clone());

    let main_stage = stages.main().stack_err("rootfs -> locating main stage")?;

    let mut dep_artifacts = StageArtifacts::default();
    for dep_name in &main_stage.depends_on {
        let dep_stage = stages
            .by_name(dep_name)
            .stack_err_with(|| format!("rootfs -> COPY --from={dep_name} references an undeclared stage"))?;
        let copy_sources = copy_from_sources(main_stage, dep_name);
        let artifacts = build_dependency_stage(dep_stage, &build_args, &env, &resolver, &build, &copy_sources)
            .await
            .stack_err_with(|| format!("rootfs -> building dependency stage {dep_name:?}"))?;
        dep_artifacts.insert(dep_name.clone(), artifacts);
    }

    let main_state = BuildState::apply_all(&main_stage.instructions, &build_args)
        .stack_err("rootfs -> applying main stage instructions")?;

    let base_tag = ImageTag::parse(&main_stage.base_image)
        .stack_err_with(|| format!("rootfs -> main stage FROM {:?} is not a published tag", main_stage.base_image))?;
    let (base_rootfs_path, _base_metadata) = storage
        .fetch_rootfs(&base_tag)
        .await
        .stack_err_with(|| format!("rootfs -> fetching base rootfs {base_tag}"))?;
    let kernel_id = build
        .machine
        .vmlinux_id
        .clone()
        .stack_err_locationless("--machine-vmlinux-id is required")?;
    let (kernel_path, _kernel_metadata) = storage
        .fetch_kernel(&kernel_id)
        .await
        .stack_err_with(|| format!("rootfs -> fetching kernel {kernel_id:?}"))?;

    let handle = start_build_guest(&build, base_rootfs_path, kernel_path, &env, &format!("{}-build", tag.name))
        .await
        .stack_err("rootfs -> starting main stage guest")?;
    let guest_client = require_guest_client(&handle)?;

    let replay_result = replay_stage(
        guest_client.as_ref(),
        &main_state.instructions,
        resolver.excludes(),
        &resolver,
        &dep_artifacts,
        &build.pre_build_command,
        &build.post_build_command,
    )
    .await;

    if let Err(e) = replay_result {
        let _ = handle.stop().await;
        return Err(e).stack_err("rootfs -> replaying main stage instructions");
    }

    handle.stop().await.stack_err("rootfs -> stopping main stage guest")?;

    let scratch_rootfs = handle.jail_dir.join("root").join(guest::ROOTFS_NAME);
    let metadata = ArtifactMetadata {
        labels: main_state.labels.clone(),
        exposed_ports: main_state.exposed_ports.clone(),
        volumes: main_state.volumes.clone(),
        cmd: main_state.cmd.clone(),
        entrypoint: main_state.entrypoint.clone(),
        created_at_utc: Some(chrono::Utc::now()),
    };
    let (rootfs_path, metadata_path) = storage
        .store_rootfs(&scratch_rootfs, &tag, &metadata)
        .await
        .stack_err("rootfs -> storing built rootfs")?;
    if let Err(e) = tokio::fs::remove_dir_all(&handle.jail_dir).await {
        tracing::warn!(jail_dir = ?handle.jail_dir, error = %e, "rootfs -> failed to remove build jail directory, continuing");
    }

    println!("{}", rootfs_path.display());
    if let Some(path) = metadata_path {
        tracing::debug!(?path, "wrote rootfs image metadata");
    }
    Ok(())
}

/// Builds `dep_stage` against a throwaway guest, then scavenges only the
/// file paths `copy_sources` names out of the resulting guest filesystem
/// (spec §4.4: "scavenging only the file paths the parent stage's `COPY
/// --from` expressions reference").
async fn build_dependency_stage(
    dep_stage: &Stage,
    build_args: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
    resolver: &ContextResolver,
    build: &BuildArgs,
    copy_sources: &[String],
) -> Result<Vec<ResolvedResource>> {
    let storage = directory_storage(build)?;
    let state = BuildState::apply_all(&dep_stage.instructions, build_args)
        .stack_err_with(|| format!("applying instructions for dependency stage {:?}", dep_stage.name))?;

    let base_tag = ImageTag::parse(&dep_stage.base_image).stack_err_with(|| {
        format!(
            "dependency stage {:?} FROM {:?} is not a published tag",
            dep_stage.name, dep_stage.base_image
        )
    })?;
    let (base_rootfs_path, _metadata) = storage
        .fetch_rootfs(&base_tag)
        .await
        .stack_err_with(|| format!("fetching dependency stage base rootfs {base_tag}"))?;
    let kernel_id = build
        .machine
        .vmlinux_id
        .clone()
        .stack_err_locationless("--machine-vmlinux-id is required")?;
    let (kernel_path, _kernel_metadata) = storage
        .fetch_kernel(&kernel_id)
        .await
        .stack_err_with(|| format!("fetching kernel {kernel_id:?}"))?;

    let handle = start_build_guest(
        build,
        base_rootfs_path,
        kernel_path,
        env,
        &format!("dep-{}", dep_stage.name),
    )
    .await
    .stack_err_with(|| format!("starting guest for dependency stage {:?}", dep_stage.name))?;
    let guest_client = require_guest_client(&handle)?;

    let replay_result = replay_stage(
        guest_client.as_ref(),
        &state.instructions,
        resolver.excludes(),
        resolver,
        &StageArtifacts::default(),
        &[],
        &[],
    )
    .await;

    let scavenge_result = match &replay_result {
        Ok(()) => scavenge(guest_client.as_ref(), copy_sources).await,
        Err(_) => Ok(vec![]),
    };

    let _ = handle.stop().await;
    if let Err(e) = tokio::fs::remove_dir_all(&handle.jail_dir).await {
        tracing::warn!(jail_dir = ?handle.jail_dir, error = %e, "failed to remove dependency build jail directory, continuing");
    }

    replay_result.stack_err_with(|| format!("replaying dependency stage {:?}", dep_stage.name))?;
    scavenge_result
}

async fn scavenge(guest: &dyn GuestClient, copy_sources: &[String]) -> Result<Vec<ResolvedResource>> {
    let mut out = Vec::with_capacity(copy_sources.len());
    for src in copy_sources {
        let bytes = guest
            .download(src)
            .await
            .stack_err_with(|| format!("scavenging {src:?} from dependency stage guest"))?;
        out.push(ResolvedResource::from_bytes(src.clone(), src.clone(), bytes));
    }
    Ok(out)
}

/// Every `src` a `COPY --from=<dep_name>` in `stage` names, in source order.
fn copy_from_sources(stage: &Stage, dep_name: &str) -> Vec<String> {
    stage
        .instructions
        .iter()
        .filter_map(|instr| match instr {
            Instruction::Copy {
                src,
                from_stage: Some(from),
                ..
            } if from == dep_name => Some(src.clone()),
            _ => None,
        })
        .collect()
}

fn directory_storage(build: &BuildArgs) -> Result<DirectoryStorage> {
    let rootfs_root = build
        .storage
        .directory_rootfs_storage_root
        .clone()
        .stack_err_locationless("--storage-provider.directory.rootfs-storage-root is required")?;
    let kernel_root = build
        .storage
        .directory_kernel_storage_root
        .clone()
        .stack_err_locationless("--storage-provider.directory.kernel-storage-root is required")?;
    Ok(DirectoryStorage::new(rootfs_root, kernel_root))
}

/// Starts a guest for a build stage: fresh vm id, ephemeral SSH keypair, the
/// `ssh2`-backed guest client factory (spec §4.5 start sequence).
async fn start_build_guest(
    build: &BuildArgs,
    base_rootfs_path: std::path::PathBuf,
    kernel_path: std::path::PathBuf,
    env: &BTreeMap<String, String>,
    hostname_prefix: &str,
) -> Result<GuestHandle> {
    let firecracker = build
        .binaries
        .firecracker
        .clone()
        .stack_err_locationless("--binary-firecracker is required")?;
    let hypervisor_basename = firecracker
        .file_name()
        .stack_err_locationless("--binary-firecracker path has no basename")?
        .to_string_lossy()
        .into_owned();
    let chroot_base = build
        .binaries
        .chroot_base
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("/srv/jailer"));

    let vm_id = uuid::Uuid::new_v4().to_string();
    let ssh_keypair = Arc::new(SshKeypair::generate()?);
    let cni = Arc::new(cni_driver(&build.cni));
    let cni_net_name = build
        .machine
        .cni_network_name
        .clone()
        .stack_err_locationless("--machine-cni-network-name is required")?;
    let net_ns = cni_net_ns(&build.cni, &vm_id);

    let factory: GuestClientFactory = Arc::new(|addr: SocketAddr, keypair, user| Box::pin(SshGuestClient::connect(addr, keypair, user)));

    let request = StartRequest {
        vm_id: vm_id.clone(),
        base_rootfs_path,
        kernel_path,
        jail_root: chroot_base.clone(),
        binaries: build.binaries.clone(),
        resources: build.resources.clone(),
        machine: build.machine.clone(),
        cni,
        cni_net_name,
        cni_net_ns: net_ns,
        cni_if_name: build.cni.if_name.clone(),
        ssh_keypair,
        ssh_connect_timeout: secs(build.ssh_connect_timeout_seconds),
        egress_check: None,
        shutdown_graceful_timeout: secs(build.shutdown_graceful_timeout_seconds),
        env: env.clone(),
        hostname: Some(format!("{hostname_prefix}-{}", &vm_id[..8])),
        metadata: serde_json::json!({"tag": build.tag}),
        guest_client_factory: Some(factory),
    };

    guest::start(request).await
}

fn require_guest_client(handle: &GuestHandle) -> Result<Arc<dyn GuestClient>> {
    handle
        .guest_client
        .clone()
        .stack_err_locationless("guest started without a connected SSH client")
}

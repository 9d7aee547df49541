//! `profile-create`/`profile-ls`/`profile-inspect` (spec §6).

use stacked_errors::{Result, StackableErr};

use crate::{
    cli::{ProfileCreateArgs, ProfileInspectArgs, ProfileLsArgs},
    profile::{Profile, TracingOptions},
};

pub async fn create(args: ProfileCreateArgs) -> Result<()> {
    tokio::fs::create_dir_all(&args.profile_dir)
        .await
        .stack_err_with(|| format!("creating profile directory {:?}", args.profile_dir))?;
    let mut profile = Profile::new(&args.name);
    profile.binary_firecracker = args.binaries.firecracker;
    profile.binary_jailer = args.binaries.jailer;
    profile.binary_image_builder = args.binaries.image_builder;
    profile.chroot_base = args.binaries.chroot_base;
    profile.run_cache_dir = args.run_cache.run_cache_dir;
    profile.storage_provider_properties.directory_rootfs_storage_root =
        args.storage.directory_rootfs_storage_root;
    profile.storage_provider_properties.directory_kernel_storage_root =
        args.storage.directory_kernel_storage_root;
    profile.tracing = TracingOptions {
        enable: args.tracing.enable,
        collector_host_port: args.tracing.collector_host_port,
    };
    let path = profile
        .save(&args.profile_dir)
        .await
        .stack_err_with(|| format!("saving profile {:?}", args.name))?;
    println!("{}", path.display());
    Ok(())
}

pub async fn ls(args: ProfileLsArgs) -> Result<()> {
    let names = Profile::ls(&args.profile_dir)
        .await
        .stack_err_with(|| format!("listing profiles in {:?}", args.profile_dir))?;
    for name in names {
        println!("{name}");
    }
    Ok(())
}

pub async fn inspect(args: ProfileInspectArgs) -> Result<()> {
    let profile = Profile::load(&args.profile_dir, &args.name)
        .await
        .stack_err_with(|| format!("loading profile {:?}", args.name))?;
    let s = serde_json::to_string_pretty(&profile).stack_err("serializing profile")?;
    println!("{s}");
    Ok(())
}

//! `inspect` (spec §4.9, §6).

use stacked_errors::{Result, StackableErr};

use super::context::run_cache_dir;
use crate::{cli::InspectArgs, registry};

pub async fn run(args: InspectArgs) -> Result<()> {
    let dir = run_cache_dir(&args.run_cache)?;
    let s = registry::inspect(&dir, &args.vm_id)
        .await
        .stack_err_with(|| format!("inspecting {:?}", args.vm_id))?;
    println!("{s}");
    Ok(())
}

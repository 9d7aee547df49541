//! `kill` (spec §4.9, §6, §8 "Kill idempotence").

use stacked_errors::{Result, StackableErr};

use super::context::{cni_driver, firewall_controller, run_cache_dir};
use crate::{
    cli::KillArgs,
    registry::{self, KillOutcome},
};

pub async fn run(args: KillArgs) -> Result<()> {
    let dir = run_cache_dir(&args.run_cache)?;
    let cni = cni_driver(&args.cni);
    let firewall = firewall_controller();
    match registry::kill(&dir, &args.vm_id, &cni, Some(&firewall))
        .await
        .stack_err_with(|| format!("kill {:?}", args.vm_id))?
    {
        KillOutcome::Killed => println!("killed {}", args.vm_id),
        KillOutcome::NotFound => println!("{} not found, nothing to do", args.vm_id),
    }
    Ok(())
}

//! `purge` (spec §4.9, §6, §8 "Purge safety").

use stacked_errors::{Result, StackableErr};

use super::context::{cni_driver, firewall_controller, run_cache_dir};
use crate::{cli::PurgeArgs, registry};

pub async fn run(args: PurgeArgs) -> Result<()> {
    let dir = run_cache_dir(&args.run_cache)?;
    let cni = cni_driver(&args.cni);
    let firewall = firewall_controller();
    let purged = registry::purge(&dir, &cni, Some(&firewall)).await.stack_err("purge")?;
    for id in &purged {
        println!("purged {id}");
    }
    if purged.is_empty() {
        println!("nothing to purge");
    }
    Ok(())
}

//! `ls` (spec §4.9, §6).

use stacked_errors::{Result, StackableErr};

use super::context::run_cache_dir;
use crate::{cli::LsArgs, registry};

pub async fn run(args: LsArgs) -> Result<()> {
    let dir = run_cache_dir(&args.run_cache)?;
    let entries = registry::ls(&dir).await.stack_err("ls")?;
    let s = serde_json::to_string_pretty(&entries).stack_err("serializing ls output")?;
    println!("{s}");
    Ok(())
}

//! Thin CLI entry point: parses flags, installs tracing, and dispatches to
//! the library-level subcommand handlers in `firebuild::commands` (spec §6).

use clap::Parser;
use firebuild::{
    cli::{Cli, Commands},
    commands,
};

#[tokio::main]
async fn main() {
    if let Err(e) = firebuild::std_init() {
        eprintln!("firebuild: failed to initialize: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Baseos(args) => commands::build::baseos(args).await,
        Commands::Rootfs(args) => commands::build::rootfs(args).await,
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Ls(args) => commands::ls::run(args).await,
        Commands::Inspect(args) => commands::inspect::run(args).await,
        Commands::Kill(args) => commands::kill::run(args).await,
        Commands::Purge(args) => commands::purge::run(args).await,
        Commands::ProfileCreate(args) => commands::profile::create(args).await,
        Commands::ProfileLs(args) => commands::profile::ls(args).await,
        Commands::ProfileInspect(args) => commands::profile::inspect(args).await,
    };

    if let Err(e) = result {
        tracing::error!(error = ?e, "command failed");
        eprintln!("firebuild: {e:?}");
        std::process::exit(1);
    }
}

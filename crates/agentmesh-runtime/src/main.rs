//! agentmesh: agent coordination runtime over a pull-only message log.
//!
//! `run` drives a `ConnectionManager` and a `ProposalCoordinator` from
//! per-topic feeds of a file-backed local log; `status` and `publish` are
//! offline helpers over the same directories.

use clap::Parser;

mod cli;
mod config;
mod file_log;
mod run_loop;
mod status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let file = config::FileConfig::load(args.config.as_deref())?;

    match &args.command {
        cli::Command::Run(opts) => {
            let filter = std::env::var("AGENTMESH_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .with_writer(std::io::stderr)
                .init();

            let settings = config::Settings::resolve(file, &args, opts).inspect_err(|e| {
                tracing::error!("invalid configuration: {e:#}");
            })?;
            tracing::info!(
                state_dir = %settings.state_dir.display(),
                log_dir = %settings.log_dir.display(),
                "agentmesh starting"
            );
            run_loop::run(settings).await?;
        }
        cli::Command::Status => {
            status::cmd_status(&config::state_dir(&file, &args))?;
        }
        cli::Command::Publish(opts) => {
            file_log::cmd_publish(&config::log_dir(&file, &args), opts).await?;
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use bully_election::{
    cli::{Cli, Command, NodeArgs},
    directory::Directory,
    multiplexer::{NodeConfig, spawn_node},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Directory(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let directory = Directory::new(listener);
            let addr = directory.local_addr()?;
            info!("directory listening on {}", addr);
            if let Err(err) = directory.run_until_ctrl_c().await {
                warn!("directory exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Node(args) => run_node(args).await?,
    }

    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let today = chrono::Local::now().date_naive();
    let identity = args.identity(today)?;
    let config = NodeConfig {
        identity,
        listen_addr: args.listen.clone(),
        directory: args.directory(),
        election: args.election_config(),
    };

    let node = spawn_node(config)
        .await
        .with_context(|| format!("node {identity} failed to start"))?;
    info!("node {} listening on {}", identity, node.address());

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    node.shutdown().await
}

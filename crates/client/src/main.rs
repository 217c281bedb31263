// eventsyncd: push channels, room chat and the notice mailbox in one process.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use eventsync_client::config::SyncConfig;
use eventsync_client::runtime::{self, RunOptions};

#[derive(Parser)]
#[command(name = "eventsyncd", about = "Real-time sync for chat and notices")]
struct Args {
    /// Config file. Defaults to `~/.eventsync/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Push namespace to connect.
    #[arg(long)]
    namespace: Option<String>,
    /// Room to join after connecting. Requires --namespace.
    #[arg(long, requires = "namespace")]
    room: Option<String>,
    /// Our user id within the chat service.
    #[arg(long, default_value = "")]
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => SyncConfig::load(),
    };

    info!(namespace = ?args.namespace, room = ?args.room, "starting eventsyncd");
    let options = RunOptions { namespace: args.namespace, room: args.room, user_id: args.user_id };
    runtime::run(config, options).await.context("eventsyncd terminated unexpectedly")
}

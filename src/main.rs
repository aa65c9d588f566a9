use std::error::Error;

use clap::Parser;
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use streamraft::args::Args;
use streamraft::config::RaftConfig;
use streamraft::raft::log::StateMachine;
use streamraft::raft::raft_server::RaftServer;
use streamraft::rpc::raft::LogEntry;

/// Stands in for the event store until one is plugged in: entries are only traced.
struct TracingStateMachine;

impl StateMachine for TracingStateMachine {
    fn commit_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
        info!(index = entry.index, term = entry.term, key = ?String::from_utf8_lossy(&entry.key), "committed");
        Ok(())
    }

    fn drop_entry(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
        info!(index = entry.index, term = entry.term, "dropped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_logger();
    let args = Args::parse();
    info!("Args: {:?}", &args);

    let conf = RaftConfig::from_env_with(args.replica_id, args.peers.as_deref())?;
    let handle = RaftServer::start_server(conf, Box::new(TracingStateMachine)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, stopping replica {}", handle.pid());
    handle.shutdown().await?;
    Ok(())
}

pub fn setup_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .finish();
    subscriber.init()
}

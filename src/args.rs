use std::path::PathBuf;

use clap::Parser;

/// Command line overrides for the `RAFT_*` environment.
#[derive(Parser, Debug)]
#[command(
    version,
    about = "streamraft - the consensus replica of the event-streaming platform"
)]
pub struct Args {
    #[arg(short = 'r', long = "replica-id", help = "Peer id of this replica in the quorum (overrides RAFT_REPLICA_ID)")]
    pub replica_id: Option<u32>,

    #[arg(short = 'p', long = "peers", value_name = "FILE", help = "Peers file in json or yaml (overrides RAFT_PEERS_PATH)")]
    pub peers: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::parse_from(["streamraft", "--replica-id", "2", "--peers", "peers.yaml"]);
        assert_eq!(args.replica_id, Some(2));
        assert_eq!(args.peers, Some(PathBuf::from("peers.yaml")));

        let args = Args::parse_from(["streamraft", "-r", "3"]);
        assert_eq!(args.replica_id, Some(3));
        assert_eq!(args.peers, None);
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{QuorumError, ValidationError};

/// The static membership of a single Raft group, as described by the peers file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Quorum {
    #[serde(rename = "quorum_id")]
    pub qid: u32,
    /// The pid of the replica that starts as leader at term 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_leader: Option<u32>,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Peer {
    #[serde(rename = "peer_id")]
    pub pid: u32,
    pub name: String,
    pub bind_addr: String,
    pub endpoint: String,
}

enum FileFormat {
    Json,
    Yaml,
}

impl FileFormat {
    fn from_path(path: &Path) -> Result<FileFormat, QuorumError> {
        let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        match ext {
            "json" => Ok(FileFormat::Json),
            "yaml" | "yml" => Ok(FileFormat::Yaml),
            _ => Err(QuorumError::UnknownExtension(ext.to_string())),
        }
    }
}

impl Quorum {
    /// Checks the quorum and every peer, collecting all violations into one error.
    pub fn validate(&self) -> Result<(), QuorumError> {
        let mut errors = Vec::new();
        if self.qid == 0 {
            errors.push(ValidationError::MissingQid);
        }

        if self.peers.is_empty() {
            errors.push(ValidationError::NoPeers);
        }

        let mut pids: HashMap<u32, usize> = HashMap::new();
        for peer in self.peers.iter() {
            if let Err(e) = peer.validate() {
                errors.push(e);
            }
            *pids.entry(peer.pid).or_default() += 1;
        }

        if pids.values().any(|&count| count > 1) {
            errors.push(ValidationError::UniquePid);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(QuorumError::Invalid(errors))
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.peers.iter().any(|p| p.pid == pid)
    }

    pub fn get(&self, pid: u32) -> Option<&Peer> {
        self.peers.iter().find(|p| p.pid == pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.peers.iter().map(|p| p.pid).collect()
    }

    /// All peers except the one identified by `pid`.
    pub fn remotes(&self, pid: u32) -> Vec<&Peer> {
        self.peers.iter().filter(|p| p.pid != pid).collect()
    }

    /// Loads a quorum from a `.json` or `.yaml` file. The result is not validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Quorum, QuorumError> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path)?;
        let content = fs::read_to_string(path)?;
        let quorum = match format {
            FileFormat::Json => serde_json::from_str(&content)?,
            FileFormat::Yaml => serde_yaml::from_str(&content)?,
        };
        debug!(path = %path.display(), "loaded quorum configuration");
        Ok(quorum)
    }

    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<(), QuorumError> {
        let path = path.as_ref();
        let content = match FileFormat::from_path(path)? {
            FileFormat::Json => serde_json::to_string_pretty(self)?,
            FileFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(path, content)?;
        Ok(())
    }
}

impl Peer {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pid == 0 {
            return Err(ValidationError::MissingPid);
        }

        if self.name.is_empty() || self.bind_addr.is_empty() || self.endpoint.is_empty() {
            return Err(ValidationError::PeerMissingField);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    fn peer(pid: u32, name: &str) -> Peer {
        Peer {
            pid,
            name: name.to_string(),
            bind_addr: format!("127.0.0.1:{}", 7000 + pid),
            endpoint: format!("http://127.0.0.1:{}", 7000 + pid),
        }
    }

    fn quorum() -> Quorum {
        Quorum {
            qid: 1,
            bootstrap_leader: Some(10),
            peers: vec![peer(10, "alpha"), peer(15, "bravo"), peer(20, "charlie")],
        }
    }

    fn validation_errors(quorum: &Quorum) -> Vec<ValidationError> {
        match quorum.validate() {
            Err(QuorumError::Invalid(errors)) => errors,
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_quorum_validation() {
        assert!(quorum().validate().is_ok());

        let empty = Quorum::default();
        assert_eq!(validation_errors(&empty), vec![ValidationError::MissingQid, ValidationError::NoPeers]);

        let mut duplicate = quorum();
        duplicate.peers.push(peer(15, "delta"));
        assert_eq!(validation_errors(&duplicate), vec![ValidationError::UniquePid]);

        let mut broken = quorum();
        broken.qid = 0;
        broken.peers[0].pid = 0;
        broken.peers[1].endpoint = String::new();
        assert_eq!(
            validation_errors(&broken),
            vec![ValidationError::MissingQid, ValidationError::MissingPid, ValidationError::PeerMissingField]
        );
    }

    #[test]
    fn test_peer_validation() {
        assert!(peer(1, "alpha").validate().is_ok());
        assert_eq!(peer(0, "alpha").validate(), Err(ValidationError::MissingPid));

        for field in 0..3 {
            let mut p = peer(1, "alpha");
            match field {
                0 => p.name.clear(),
                1 => p.bind_addr.clear(),
                _ => p.endpoint.clear(),
            }
            assert_eq!(p.validate(), Err(ValidationError::PeerMissingField));
        }
    }

    #[test]
    fn test_contains() {
        let q = quorum();
        assert!(q.contains(10));
        assert!(q.contains(20));
        assert!(!q.contains(0));
        assert!(!q.contains(11));
        assert_eq!(q.get(15).map(|p| p.name.as_str()), Some("bravo"));
        assert_eq!(q.pids(), vec![10, 15, 20]);
        assert_eq!(q.remotes(15).iter().map(|p| p.pid).collect::<Vec<u32>>(), vec![10, 20]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let dir = tempdir().unwrap();
        for name in ["quorum.json", "quorum.yaml", "quorum.yml"] {
            let path = dir.path().join(name);
            quorum().dump(&path).unwrap();
            let loaded = Quorum::load(&path).unwrap();
            assert_eq!(loaded, quorum());
        }
    }

    #[test]
    fn test_load_fixture_formats() {
        let dir = tempdir().unwrap();
        let yaml = dir.path().join("peers.yaml");
        fs::write(
            &yaml,
            "quorum_id: 4\npeers:\n  - peer_id: 1\n    name: alpha\n    bind_addr: 0.0.0.0:7000\n    endpoint: alpha:7000\n",
        )
        .unwrap();
        let q = Quorum::load(&yaml).unwrap();
        assert_eq!(q.qid, 4);
        assert_eq!(q.bootstrap_leader, None);
        assert_eq!(q.peers.len(), 1);
        assert_eq!(q.peers[0].endpoint, "alpha:7000");

        let json = dir.path().join("peers.json");
        fs::write(&json, r#"{"quorum_id": 9, "bootstrap_leader": 2, "peers": []}"#).unwrap();
        let q = Quorum::load(&json).unwrap();
        assert_eq!(q.qid, 9);
        assert_eq!(q.bootstrap_leader, Some(2));
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quorum.toml");
        assert!(matches!(quorum().dump(&path), Err(QuorumError::UnknownExtension(ext)) if ext == "toml"));
        fs::write(&path, "quorum_id = 1").unwrap();
        assert!(matches!(Quorum::load(&path), Err(QuorumError::UnknownExtension(_))));
        assert!(matches!(Quorum::load(dir.path().join("missing.json")), Err(QuorumError::Io(_))));
    }
}

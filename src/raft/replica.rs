use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::RaftConfig;
use crate::errors::{LogError, RaftError, RaftResult};
use crate::peers::Quorum;
use crate::raft::election::Election;
use crate::raft::interval::{FixedInterval, Interval, RandomInterval};
use crate::raft::log::Log;
use crate::raft::state::State;
use crate::rpc::raft::{AppendReply, AppendRequest, LogEntry, VoteReply, VoteRequest};
use crate::rpc::{RaftEvent, Responder};

/// Tick channels of the replica's two timers, consumed by the run loop.
#[derive(Debug)]
pub struct Ticks {
    pub heartbeat: mpsc::Receiver<()>,
    pub candidacy: mpsc::Receiver<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub pid: u32,
    pub name: String,
    pub state: State,
    pub term: u64,
    pub leader: u32,
    pub voted_for: Option<u32>,
    pub last_applied: u64,
    pub commit_index: u64,
}

/// What the leader knows about a remote's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    next_index: u64,
    match_index: u64,
}

/// A member of a Raft quorum. The replica owns the term, vote and leader state, the
/// log and both timers, and is driven one event at a time by the run loop: it never
/// touches the network itself, outbound requests are emitted on the outbox for the
/// peer network to deliver.
pub struct Replica {
    pid: u32,
    name: String,
    quorum: Arc<Quorum>,
    aggregate: bool,

    state: State,
    term: u64,
    leader: u32,
    voted_for: Option<u32>,

    log: Log,
    election: Option<Election>,
    heartbeat: FixedInterval,
    candidacy: RandomInterval,
    remotes: HashMap<u32, Progress>,

    outbox: mpsc::UnboundedSender<RaftEvent>,
}

impl Replica {
    pub fn new(
        conf: &RaftConfig,
        quorum: Arc<Quorum>,
        log: Log,
        outbox: mpsc::UnboundedSender<RaftEvent>,
    ) -> RaftResult<(Replica, Ticks)> {
        let peer = quorum
            .get(conf.replica_id)
            .ok_or_else(|| RaftError::Config(format!("replica {} is not a member of quorum {}", conf.replica_id, quorum.qid)))?;
        let name = peer.name.clone();
        let (term, voted_for) = (log.term(), log.voted_for());

        let (heartbeat, heartbeat_rx) = FixedInterval::new(conf.tick());
        let (min, max) = conf.candidacy_timeout();
        let (candidacy, candidacy_rx) = RandomInterval::new(min, max);

        let mut replica = Replica {
            pid: conf.replica_id,
            name,
            quorum,
            aggregate: conf.aggregate,
            state: State::Stopped,
            term,
            leader: 0,
            voted_for,
            log,
            election: None,
            heartbeat,
            candidacy,
            remotes: HashMap::new(),
            outbox,
        };
        replica.set_state(State::Initialized)?;

        let ticks = Ticks {
            heartbeat: heartbeat_rx,
            candidacy: candidacy_rx,
        };
        Ok((replica, ticks))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> u32 {
        self.leader
    }

    pub fn voted_for(&self) -> Option<u32> {
        self.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn is_leader(&self) -> bool {
        self.state == State::Leader
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state,
            term: self.term,
            leader: self.leader,
            voted_for: self.voted_for,
            last_applied: self.log.last_applied(),
            commit_index: self.log.commit_index(),
        }
    }

    /// Moves an initialized replica to running. On a fresh log the quorum's bootstrap
    /// leader takes leadership at term 0; everyone else, and any replica restarted with
    /// history, starts as a follower.
    pub fn start(&mut self) -> RaftResult<()> {
        self.set_state(State::Running)?;
        let fresh = self.term == 0 && self.log.last_applied() == 0;
        if fresh && self.quorum.bootstrap_leader == Some(self.pid) {
            return self.set_state(State::Leader);
        }
        self.set_state(State::Follower)
    }

    /// Stops both timers and closes the log.
    pub fn stop(&mut self) -> RaftResult<()> {
        self.set_state(State::Stopped)?;
        self.log.close()?;
        Ok(())
    }

    /// Applies a single event from the run loop. Requests that expect an answer carry a
    /// responder; replies from peers arrive without one.
    pub fn step(&mut self, event: (RaftEvent, Option<Responder>)) -> RaftResult<()> {
        match event {
            (RaftEvent::VoteRequestEvent(req), Some(sender)) => {
                let result = self.request_vote(req).map(RaftEvent::VoteReplyEvent);
                let _ = sender.send(result);
            }
            (RaftEvent::AppendRequestEvent(req), Some(sender)) => {
                let result = self.append_entries(req).map(RaftEvent::AppendReplyEvent);
                let _ = sender.send(result);
            }
            (RaftEvent::ProposeEvent { key, value }, Some(sender)) => {
                let result = self.propose(key, value).map(RaftEvent::ProposeReplyEvent);
                let _ = sender.send(result);
            }
            (RaftEvent::StatusEvent, Some(sender)) => {
                let _ = sender.send(Ok(RaftEvent::StatusReplyEvent(self.status())));
            }
            (RaftEvent::VoteReplyEvent(reply), None) => self.on_vote_reply(reply)?,
            (RaftEvent::AppendReplyEvent(reply), None) => self.on_append_reply(reply)?,
            (event, _) => {
                error!("Unexpected event received: {:?}", event);
                return Err(RaftError::InternalServerErrorWithContext(format!(
                    "Unexpected event received: {:?}",
                    event
                )));
            }
        }
        Ok(())
    }

    // State transitions

    pub fn set_state(&mut self, state: State) -> RaftResult<()> {
        match state {
            State::Stopped => self.set_stopped_state(),
            State::Initialized => self.set_initialized_state(),
            State::Running => self.set_running_state()?,
            State::Follower => self.set_follower_state(),
            State::Candidate => self.set_candidate_state()?,
            State::Leader => self.set_leader_state()?,
        }
        self.state = state;
        Ok(())
    }

    fn set_stopped_state(&mut self) {
        if self.state == State::Stopped {
            trace!(replica = %self.name, "already stopped");
            return;
        }
        self.heartbeat.stop();
        self.candidacy.stop();
        debug!(replica = %self.name, "replica stopped");
    }

    /// Resets volatile state; called on the way into follower and candidate.
    fn set_initialized_state(&mut self) {
        self.election = None;
        self.remotes.clear();
        debug!(replica = %self.name, "replica initialized");
    }

    fn set_running_state(&mut self) -> RaftResult<()> {
        if self.state != State::Initialized {
            return Err(RaftError::InvalidTransition {
                from: self.state,
                to: State::Running,
            });
        }
        self.candidacy.start();
        debug!(replica = %self.name, "replica running");
        Ok(())
    }

    fn set_follower_state(&mut self) {
        self.set_initialized_state();
        self.heartbeat.stop();
        self.reset_candidacy();
        info!(replica = %self.name, term = self.term, leader = self.leader, "replica is now a follower");
    }

    fn set_candidate_state(&mut self) -> RaftResult<()> {
        self.set_initialized_state();
        self.heartbeat.stop();

        self.term += 1;
        self.leader = 0;
        self.voted_for = Some(self.pid);
        self.record_vote()?;
        let mut election = Election::new(self.quorum.pids());
        election.vote(self.pid, true);
        self.election = Some(election);
        self.reset_candidacy();
        info!(replica = %self.name, term = self.term, "replica is now a candidate");

        let req = VoteRequest {
            term: self.term,
            candidate: self.pid,
            last_log_index: self.log.last_applied(),
            last_log_term: self.log.last_term(),
        };
        self.outbox
            .send(RaftEvent::PeerVoteRequestEvent(req))
            .map_err(|e| anyhow!("Unable to send request vote to peers: {:?}", e))?;
        Ok(())
    }

    fn set_leader_state(&mut self) -> RaftResult<()> {
        if self.state == State::Leader {
            return Ok(());
        }

        self.election = None;
        self.candidacy.stop();
        self.leader = self.pid;

        let next_index = self.log.last_applied() + 1;
        self.remotes = self
            .quorum
            .remotes(self.pid)
            .into_iter()
            .map(|peer| {
                let progress = Progress {
                    next_index,
                    match_index: 0,
                };
                (peer.pid, progress)
            })
            .collect();

        if !self.heartbeat.interrupt() {
            self.heartbeat.start();
        }
        info!(replica = %self.name, term = self.term, "replica is now the leader");
        self.broadcast_append()
    }

    /// Writes the term and vote through the log before they are acted upon.
    fn record_vote(&mut self) -> RaftResult<()> {
        self.log.set_vote(self.term, self.voted_for)?;
        Ok(())
    }

    /// Restarts the election timeout, starting it if needed.
    fn reset_candidacy(&mut self) {
        if !self.candidacy.interrupt() {
            self.candidacy.start();
        }
    }

    /// Adopts `term` if it is newer than ours, clearing the vote, and steps down to
    /// follower if we were campaigning or leading.
    fn observe_term(&mut self, term: u64, leader: Option<u32>) -> RaftResult<()> {
        if term > self.term {
            debug!(replica = %self.name, term, current_term = self.term, "adopting newer term");
            self.term = term;
            self.voted_for = None;
            self.leader = 0;
            self.record_vote()?;
        }
        if let Some(leader) = leader {
            self.leader = leader;
        }

        if matches!(self.state, State::Candidate | State::Leader) {
            self.set_state(State::Follower)?;
        }
        Ok(())
    }

    // Timer events

    /// The election timeout fired: start a new election unless we are the leader.
    pub fn on_candidacy_timeout(&mut self) -> RaftResult<()> {
        if !matches!(self.state, State::Running | State::Follower | State::Candidate) {
            trace!(replica = %self.name, state = %self.state, "ignoring candidacy timeout");
            return Ok(());
        }

        self.set_state(State::Candidate)?;
        if self.election.as_ref().is_some_and(|e| e.passed()) {
            self.set_state(State::Leader)?;
        }
        Ok(())
    }

    pub fn on_heartbeat(&mut self) -> RaftResult<()> {
        if self.state != State::Leader {
            trace!(replica = %self.name, state = %self.state, "ignoring heartbeat");
            return Ok(());
        }
        self.broadcast_append()
    }

    // RequestVote

    pub fn request_vote(&mut self, req: VoteRequest) -> RaftResult<VoteReply> {
        debug!(replica = %self.name, candidate = req.candidate, term = req.term, "handling vote request");
        if req.term >= self.term {
            self.observe_term(req.term, None)?;
        }

        let granted = req.term == self.term
            && self.voted_for.map_or(true, |pid| pid == req.candidate)
            && self.log.as_up_to_date(req.last_log_index, req.last_log_term);

        if granted {
            self.voted_for = Some(req.candidate);
            self.record_vote()?;
            self.reset_candidacy();
            info!(replica = %self.name, candidate = req.candidate, term = self.term, "vote granted");
        }

        Ok(VoteReply {
            remote: self.pid,
            term: self.term,
            granted,
        })
    }

    fn on_vote_reply(&mut self, reply: VoteReply) -> RaftResult<()> {
        if reply.term > self.term {
            return self.observe_term(reply.term, None);
        }

        if self.state != State::Candidate || reply.term < self.term {
            trace!(replica = %self.name, remote = reply.remote, "ignoring stale vote reply");
            return Ok(());
        }

        let passed = match self.election.as_mut() {
            Some(election) => {
                election.vote(reply.remote, reply.granted);
                debug!(
                    replica = %self.name,
                    remote = reply.remote,
                    granted = reply.granted,
                    votes = election.votes(),
                    majority = election.majority(),
                    "vote received"
                );
                election.passed()
            }
            None => false,
        };

        if passed {
            self.set_state(State::Leader)?;
        }
        Ok(())
    }

    // AppendEntries

    /// Handles a heartbeat or replication request from the leader. On success the reply
    /// carries the last index known to match the leader's log; on rejection it carries
    /// the last index of the local log so the leader can back off.
    pub fn append_entries(&mut self, req: AppendRequest) -> RaftResult<AppendReply> {
        trace!(
            replica = %self.name,
            leader = req.leader,
            term = req.term,
            prev_log_index = req.prev_log_index,
            entries = req.entries.len(),
            "handling append entries"
        );
        if req.term < self.term {
            debug!(replica = %self.name, leader = req.leader, term = req.term, "rejecting append from stale leader");
            return Ok(self.append_reply(false, self.log.last_applied()));
        }

        self.observe_term(req.term, Some(req.leader))?;
        self.reset_candidacy();

        match self.log.get(req.prev_log_index) {
            Ok(prev) if prev.term == req.prev_log_term => {}
            _ => {
                debug!(
                    replica = %self.name,
                    prev_log_index = req.prev_log_index,
                    prev_log_term = req.prev_log_term,
                    "log does not contain matching previous entry"
                );
                return Ok(self.append_reply(false, self.log.last_applied()));
            }
        }

        let last_new_index = req.prev_log_index + req.entries.len() as u64;
        if let Err(err) = self.reconcile(req.entries) {
            return self.reject_or_fail(err);
        }

        let commit_index = req.leader_commit.min(last_new_index);
        if commit_index > self.log.commit_index() {
            self.commit(commit_index)?;
        }

        Ok(self.append_reply(true, last_new_index))
    }

    /// Skips entries already in the log, truncates at the first conflict and appends the rest.
    fn reconcile(&mut self, mut entries: Vec<LogEntry>) -> Result<(), LogError> {
        let matching = entries
            .iter()
            .take_while(|e| self.log.get(e.index).is_ok_and(|local| local.term == e.term))
            .count();
        let entries = entries.split_off(matching);

        let Some(first) = entries.first() else {
            return Ok(());
        };

        if first.index <= self.log.last_applied() {
            let keep = first.index.saturating_sub(1);
            let term = self.log.get(keep)?.term;
            debug!(replica = %self.name, index = keep, term, "truncating conflicting entries");
            self.log.truncate(keep, term)?;
        }
        self.log.append(entries)
    }

    fn reject_or_fail(&self, err: LogError) -> RaftResult<AppendReply> {
        if err.is_sequencing() || matches!(err, LogError::StateMachine { .. }) {
            debug!(replica = %self.name, error = %err, "rejecting append entries");
            return Ok(self.append_reply(false, self.log.last_applied()));
        }
        Err(err.into())
    }

    /// Commits up to `index`. State machine failures leave the commit index where it was
    /// and are retried by the next commit; sync failures are returned.
    fn commit(&mut self, index: u64) -> RaftResult<()> {
        match self.log.commit(index) {
            Ok(()) => Ok(()),
            Err(err @ LogError::Sync(_)) => Err(err.into()),
            Err(err) => {
                warn!(replica = %self.name, index, error = %err, "could not commit");
                Ok(())
            }
        }
    }

    fn append_reply(&self, success: bool, index: u64) -> AppendReply {
        AppendReply {
            remote: self.pid,
            term: self.term,
            success,
            index,
            commit_index: self.log.commit_index(),
        }
    }

    fn on_append_reply(&mut self, reply: AppendReply) -> RaftResult<()> {
        if reply.term > self.term {
            return self.observe_term(reply.term, None);
        }

        if self.state != State::Leader || reply.term < self.term {
            trace!(replica = %self.name, remote = reply.remote, "ignoring stale append reply");
            return Ok(());
        }

        let Some(progress) = self.remotes.get_mut(&reply.remote) else {
            warn!(replica = %self.name, remote = reply.remote, "append reply from unknown remote");
            return Ok(());
        };

        if reply.success {
            progress.match_index = progress.match_index.max(reply.index);
            progress.next_index = progress.match_index + 1;
            trace!(replica = %self.name, remote = reply.remote, match_index = progress.match_index, "remote caught up");
            return self.advance_commit();
        }

        progress.next_index = progress.next_index.saturating_sub(1).min(reply.index + 1).max(1);
        debug!(replica = %self.name, remote = reply.remote, next_index = progress.next_index, "remote rejected append, backing off");
        if !self.aggregate {
            self.send_append(reply.remote)?;
        }
        Ok(())
    }

    // Leader duties

    /// Creates a new entry in the current term and hands it to the followers.
    pub fn propose(&mut self, key: Vec<u8>, value: Vec<u8>) -> RaftResult<LogEntry> {
        if self.state != State::Leader {
            return Err(RaftError::NotLeader(self.leader));
        }

        let entry = self.log.create(key, value, self.term)?;
        debug!(replica = %self.name, index = entry.index, term = entry.term, "entry proposed");
        if !self.aggregate {
            self.broadcast_append()?;
        }
        self.advance_commit()?;
        Ok(entry)
    }

    /// Commits the highest index stored on a majority of the quorum, as long as the entry
    /// there is from the current term.
    fn advance_commit(&mut self) -> RaftResult<()> {
        let mut matched = self.remotes.values().map(|p| p.match_index).collect::<Vec<u64>>();
        matched.push(self.log.last_applied());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let majority = self.quorum.peers.len() / 2 + 1;
        let Some(&index) = matched.get(majority - 1) else {
            return Ok(());
        };

        if index <= self.log.commit_index() || self.log.get(index)?.term != self.term {
            return Ok(());
        }
        self.commit(index)
    }

    fn broadcast_append(&mut self) -> RaftResult<()> {
        let mut pids = self.remotes.keys().copied().collect::<Vec<u32>>();
        pids.sort_unstable();
        for pid in pids {
            self.send_append(pid)?;
        }
        Ok(())
    }

    /// Sends a remote every entry from its next index onwards; an empty request is a
    /// plain heartbeat.
    fn send_append(&mut self, pid: u32) -> RaftResult<()> {
        let Some(progress) = self.remotes.get(&pid) else {
            return Ok(());
        };
        let next_index = progress.next_index.clamp(1, self.log.last_applied() + 1);
        let prev = self.log.prev(next_index)?;
        let entries = self.log.after(next_index).map(|e| e.to_vec()).unwrap_or_default();

        let req = AppendRequest {
            term: self.term,
            leader: self.pid,
            prev_log_index: prev.index,
            prev_log_term: prev.term,
            leader_commit: self.log.commit_index(),
            entries,
        };
        self.outbox
            .send(RaftEvent::PeerAppendRequestEvent(pid, req))
            .map_err(|e| anyhow!("Unable to send append entries to peer {}: {:?}", pid, e))?;
        Ok(())
    }
}

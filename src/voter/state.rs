use std::collections::HashSet;
use std::hash::Hasher;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::models::{cmd_msg::Entry, CmdMsg, Confirmation, Elected, Ping, Proposal};
use crate::voter::LeaderState;

/// The election state machine of a single peer.
///
/// This type performs no IO. It is driven by the entries of the command log, in log order, and by
/// the passage of time, and it returns the entries which the peer must append to the command log
/// in response.
pub struct VoterState {
    /// The ID of this peer.
    id: String,
    /// The ID of this run of the peer, announced in its liveness entries.
    incarnation: String,
    /// The number of distinct confirmations needed to win an election.
    quorum: usize,
    liveness_interval: Duration,
    leader_timeout: Duration,
    max_leader_time: Option<Duration>,
    /// Source of election jitter, seeded from the peer ID.
    rng: StdRng,

    /// The highest term observed on the command log.
    max_term: u64,
    /// The highest term in which this peer has voted.
    voted_term: u64,
    /// This peer's candidacy, if it has proposed itself.
    candidacy: Option<Candidacy>,
    /// The adopted leader, if any.
    leader: Option<Leader>,
    /// The time at which this peer assumed leadership.
    leading_since: Option<Instant>,
    /// The last time this peer emitted a liveness entry.
    last_ping: Option<Instant>,
    /// The time at which this peer will propose itself if no leader has been found.
    election_at: Option<Instant>,
}

struct Candidacy {
    term: u64,
    voters: HashSet<String>,
    elected: bool,
}

struct Leader {
    term: u64,
    id: String,
    last_seen: Instant,
}

impl VoterState {
    /// Create a new instance for the given peer.
    pub fn new(id: impl Into<String>, quorum: usize, liveness_interval: Duration, leader_timeout: Duration, max_leader_time: Option<Duration>) -> Self {
        let id = id.into();
        let mut hasher = seahash::SeaHasher::new();
        hasher.write(id.as_bytes());
        let rng = StdRng::seed_from_u64(hasher.finish());
        Self {
            id,
            incarnation: String::new(),
            quorum: quorum.max(1),
            liveness_interval,
            leader_timeout,
            max_leader_time,
            rng,
            max_term: 0,
            voted_term: 0,
            candidacy: None,
            leader: None,
            leading_since: None,
            last_ping: None,
            election_at: None,
        }
    }

    /// Announce the given incarnation in every liveness entry.
    pub fn with_incarnation(mut self, incarnation: impl Into<String>) -> Self {
        self.incarnation = incarnation.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The highest term observed on the command log.
    pub fn max_term(&self) -> u64 {
        self.max_term
    }

    /// The current leadership state as seen by this peer.
    pub fn state(&self) -> LeaderState {
        match &self.leader {
            Some(leader) if leader.id == self.id => LeaderState::Leading { term: leader.term },
            Some(leader) => LeaderState::Following {
                term: leader.term,
                leader: leader.id.clone(),
            },
            None => LeaderState::Standby,
        }
    }

    /// Observe the next entry of the command log.
    pub fn observe(&mut self, msg: &CmdMsg, now: Instant) -> Vec<CmdMsg> {
        match &msg.entry {
            Some(Entry::Proposal(proposal)) => self.observe_proposal(proposal, now),
            Some(Entry::Confirmation(confirmation)) => self.observe_confirmation(confirmation),
            Some(Entry::Elected(elected)) => {
                self.observe_elected(elected, now);
                vec![]
            }
            Some(Entry::Ping(ping)) => {
                self.observe_ping(ping, now);
                vec![]
            }
            Some(Entry::Assignment(_)) | None => vec![],
        }
    }

    /// Advance the state machine's timers.
    pub fn tick(&mut self, now: Instant) -> Vec<CmdMsg> {
        let mut out = vec![];
        if self.is_leading() {
            if let (Some(max), Some(since)) = (self.max_leader_time, self.leading_since) {
                if now.saturating_duration_since(since) >= max {
                    tracing::info!(peer = %self.id, term = self.max_term, "max leader time reached, stepping down");
                    self.leader = None;
                    self.leading_since = None;
                    self.candidacy = None;
                    self.election_at = Some(now + self.leader_timeout + self.jitter());
                    return out;
                }
            }
        }

        if self.ping_due(now) {
            self.last_ping = Some(now);
            let (term, leading) = match &self.leader {
                Some(leader) if leader.id == self.id => (leader.term, true),
                _ => (self.max_term, false),
            };
            out.push(CmdMsg::ping(term, self.id.clone(), self.incarnation.clone(), leading));
        }
        if self.is_leading() {
            return out;
        }

        // Drop a leader which has gone silent.
        if let Some(leader) = self.leader.take() {
            if now.saturating_duration_since(leader.last_seen) >= self.leader_timeout {
                tracing::info!(peer = %self.id, leader = %leader.id, term = leader.term, "leader timed out");
                self.election_at = Some(now + self.jitter());
            } else {
                self.leader = Some(leader);
            }
        }
        if self.leader.is_some() {
            return out;
        }

        // Propose this peer as leader once the election delay has elapsed.
        let election_at = match self.election_at {
            Some(election_at) => election_at,
            None => {
                let election_at = now + self.leader_timeout + self.jitter();
                self.election_at = Some(election_at);
                election_at
            }
        };
        if now >= election_at {
            let term = self.max_term + 1;
            self.max_term = term;
            self.candidacy = Some(Candidacy {
                term,
                voters: HashSet::new(),
                elected: false,
            });
            self.election_at = Some(now + self.leader_timeout + self.jitter());
            tracing::debug!(peer = %self.id, term, "proposing self as leader");
            out.push(CmdMsg::proposal(term, self.id.clone()));
        }
        out
    }

    fn observe_proposal(&mut self, proposal: &Proposal, now: Instant) -> Vec<CmdMsg> {
        self.max_term = self.max_term.max(proposal.term);
        if proposal.term <= self.voted_term {
            return vec![];
        }
        self.voted_term = proposal.term;
        if matches!(&self.candidacy, Some(candidacy) if candidacy.term < proposal.term) {
            self.candidacy = None;
        }
        // Give the candidate time to collect its votes before competing with it.
        if !self.is_leading() {
            self.election_at = Some(now + self.leader_timeout + self.jitter());
        }
        vec![CmdMsg::confirmation(proposal.term, proposal.candidate.clone(), self.id.clone())]
    }

    fn observe_confirmation(&mut self, confirmation: &Confirmation) -> Vec<CmdMsg> {
        self.max_term = self.max_term.max(confirmation.term);
        if confirmation.candidate != self.id {
            return vec![];
        }
        let quorum = self.quorum;
        let candidacy = match &mut self.candidacy {
            Some(candidacy) if candidacy.term == confirmation.term && !candidacy.elected => candidacy,
            _ => return vec![],
        };
        candidacy.voters.insert(confirmation.voter.clone());
        if candidacy.voters.len() < quorum {
            return vec![];
        }
        candidacy.elected = true;
        tracing::debug!(peer = %self.id, term = candidacy.term, votes = candidacy.voters.len(), "quorum reached");
        vec![CmdMsg::elected(candidacy.term, self.id.clone())]
    }

    fn observe_elected(&mut self, elected: &Elected, now: Instant) {
        self.max_term = self.max_term.max(elected.term);
        if matches!(&self.leader, Some(leader) if leader.term >= elected.term) {
            return;
        }
        self.adopt(elected.term, &elected.leader, now);
    }

    fn observe_ping(&mut self, ping: &Ping, now: Instant) {
        self.max_term = self.max_term.max(ping.term);
        if !ping.leading {
            return;
        }
        let is_current = matches!(&self.leader, Some(leader) if leader.term == ping.term && leader.id == ping.peer);
        let is_stale = matches!(&self.leader, Some(leader) if leader.term >= ping.term);
        if is_current {
            if let Some(leader) = self.leader.as_mut() {
                leader.last_seen = now;
            }
        } else if !is_stale {
            self.adopt(ping.term, &ping.peer, now);
        }
    }

    /// Adopt the given peer as the leader of the given term.
    fn adopt(&mut self, term: u64, id: &str, now: Instant) {
        let was_leading = self.is_leading();
        self.leader = Some(Leader {
            term,
            id: id.to_string(),
            last_seen: now,
        });
        self.election_at = None;
        if matches!(&self.candidacy, Some(candidacy) if candidacy.term <= term) {
            self.candidacy = None;
        }
        if id == self.id {
            if !was_leading {
                self.leading_since = Some(now);
                // Announce leadership right away.
                self.last_ping = None;
            }
        } else {
            self.leading_since = None;
        }
        tracing::debug!(peer = %self.id, leader = %id, term, "leader adopted");
    }

    fn is_leading(&self) -> bool {
        matches!(&self.leader, Some(leader) if leader.id == self.id)
    }

    fn ping_due(&self, now: Instant) -> bool {
        match self.last_ping {
            Some(last) => now.saturating_duration_since(last) >= self.liveness_interval,
            None => true,
        }
    }

    /// A random delay used to spread competing elections apart.
    fn jitter(&mut self) -> Duration {
        let max = (self.leader_timeout.as_millis() as u64 / 2).max(1);
        Duration::from_millis(self.rng.gen_range(0..max))
    }
}

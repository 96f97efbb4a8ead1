use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::manager::InstanceTask;
use crate::models::{cmd_msg::Entry, CmdMsg, Instance, TopicSlice};
use crate::voter::LeaderState;

/// The operators of a grid along with the partitions of their input topics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub ops: BTreeMap<String, OpTopology>,
}

/// An operator's parallelism and the partitions of each of its input topics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpTopology {
    pub parallelism: u32,
    pub partitions: BTreeMap<String, Vec<i32>>,
}

impl Topology {
    /// Add an operator to the topology.
    pub fn insert(&mut self, name: impl Into<String>, parallelism: u32, partitions: BTreeMap<String, Vec<i32>>) {
        self.ops.insert(name.into(), OpTopology { parallelism, partitions });
    }

    /// All input topics of all operators, sorted & deduplicated.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.ops.values().flat_map(|op| op.partitions.keys().cloned()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Update the partitions of a topic for every operator reading it.
    pub fn set_partitions(&mut self, topic: &str, partitions: &[i32]) {
        for op in self.ops.values_mut() {
            if let Some(parts) = op.partitions.get_mut(topic) {
                parts.clear();
                parts.extend_from_slice(partitions);
            }
        }
    }
}

/// Compute the assignment of partitions to operator instances & of instances to peers.
///
/// For each operator, the partition at sorted index `i` of each of its input topics is assigned
/// to instance `i % parallelism`. Instances without partitions are omitted. The remaining
/// instances, in `(operator, id)` order, are assigned round-robin to the sorted `peers`. The
/// returned instances carry a term & seq of `0`.
pub fn plan(topology: &Topology, peers: &[String]) -> Vec<Instance> {
    let mut peers = peers.to_vec();
    peers.sort();
    peers.dedup();
    if peers.is_empty() {
        return vec![];
    }

    let mut instances = vec![];
    for (name, op) in topology.ops.iter() {
        let n = op.parallelism.max(1) as usize;
        let mut slices: Vec<BTreeMap<&str, Vec<i32>>> = vec![BTreeMap::new(); n];
        for (topic, partitions) in op.partitions.iter() {
            let mut partitions = partitions.clone();
            partitions.sort_unstable();
            for (idx, partition) in partitions.into_iter().enumerate() {
                slices[idx % n].entry(topic.as_str()).or_default().push(partition);
            }
        }
        for (id, slice) in slices.into_iter().enumerate() {
            if slice.is_empty() {
                continue;
            }
            instances.push(Instance {
                term: 0,
                seq: 0,
                fname: name.clone(),
                id: id as u32,
                peer: String::new(),
                topic_slices: slice
                    .into_iter()
                    .map(|(topic, partitions)| TopicSlice {
                        topic: topic.to_string(),
                        partitions,
                    })
                    .collect(),
            });
        }
    }
    for (idx, inst) in instances.iter_mut().enumerate() {
        inst.peer = peers[idx % peers.len()].clone();
    }
    instances
}

/// The assignment state machine of a single peer.
///
/// Every peer tracks the membership of the grid & the latest assignment of every instance from
/// the command log. While its peer is the leader, it also plans & emits assignments.
pub struct ManagerState {
    /// The ID of this peer.
    id: String,
    /// The duration after which a silent peer is no longer considered live.
    peer_timeout: Duration,
    /// The last time each peer was observed on the command log.
    peers: HashMap<String, Instant>,
    /// The incarnation last announced by each live peer.
    incarnations: HashMap<String, String>,
    /// The latest assignment observed for each instance.
    assignments: BTreeMap<(String, u32), Instance>,
    /// The term of this peer's leadership, if leading.
    term: Option<u64>,
    /// The plan last emitted under the current term.
    last_plan: Option<Vec<Instance>>,
    /// The sequence number of the last assignment emitted under the current term.
    seq: u64,
}

impl ManagerState {
    /// Create a new instance.
    pub fn new(id: impl Into<String>, peer_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            peer_timeout,
            peers: HashMap::new(),
            incarnations: HashMap::new(),
            assignments: BTreeMap::new(),
            term: None,
            last_plan: None,
            seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sorted IDs of all live peers, always including this peer.
    pub fn live_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.keys().cloned().collect();
        if !self.peers.contains_key(&self.id) {
            peers.push(self.id.clone());
        }
        peers.sort();
        peers
    }

    /// The latest assignment observed for the given instance.
    pub fn assignment(&self, fname: &str, id: u32) -> Option<&Instance> {
        self.assignments.get(&(fname.to_string(), id))
    }

    /// Update the leadership state of this peer.
    pub fn set_leader(&mut self, state: &LeaderState) {
        match state {
            LeaderState::Leading { term } if self.term == Some(*term) => (),
            LeaderState::Leading { term } => {
                tracing::debug!(peer = %self.id, term, "manager is now leading");
                self.term = Some(*term);
                self.last_plan = None;
                self.seq = 0;
            }
            _ => {
                self.term = None;
                self.last_plan = None;
            }
        }
    }

    /// Observe the next entry of the command log.
    pub fn observe(&mut self, msg: &CmdMsg, now: Instant) -> Vec<InstanceTask> {
        if let Some(author) = msg.author() {
            self.peers.insert(author.to_string(), now);
        }
        if let Some(Entry::Ping(ping)) = &msg.entry {
            self.observe_incarnation(&ping.peer, &ping.incarnation);
        }
        let inst = match &msg.entry {
            Some(Entry::Assignment(inst)) => inst,
            _ => return vec![],
        };
        if self.term == Some(inst.term) {
            self.seq = self.seq.max(inst.seq);
        }

        let key = inst.key();
        if let Some(current) = self.assignments.get(&key) {
            if !inst.supersedes(current) {
                return vec![];
            }
        }
        let previous = self.assignments.insert(key, inst.clone());
        let mut tasks = vec![];
        match previous {
            Some(previous) if previous.peer == self.id && inst.peer != self.id => tasks.push(InstanceTask::Stop(previous)),
            _ => (),
        }
        if inst.peer == self.id {
            tasks.push(InstanceTask::Start(inst.clone()));
        }
        tasks
    }

    /// Track the incarnation of a peer.
    ///
    /// A restarted peer has lost the assignments it was running, so a change of incarnation
    /// forces the whole plan to be emitted again.
    fn observe_incarnation(&mut self, peer: &str, incarnation: &str) {
        if incarnation.is_empty() {
            return;
        }
        let previous = self.incarnations.insert(peer.to_string(), incarnation.to_string());
        match previous {
            Some(previous) if previous != incarnation => {
                tracing::info!(peer = %self.id, restarted = peer, "peer restarted, assignments will be emitted again");
                self.last_plan = None;
            }
            _ => (),
        }
    }

    /// Expire silent peers &, if leading, emit a new plan when its input has changed.
    pub fn tick(&mut self, now: Instant, topology: &Topology) -> Vec<CmdMsg> {
        let timeout = self.peer_timeout;
        self.peers.retain(|_, last_seen| now.saturating_duration_since(*last_seen) < timeout);
        let peers = &self.peers;
        self.incarnations.retain(|peer, _| peers.contains_key(peer));

        let term = match self.term {
            Some(term) => term,
            None => return vec![],
        };
        let plan = plan(topology, &self.live_peers());
        if self.last_plan.as_ref() == Some(&plan) {
            return vec![];
        }
        tracing::info!(peer = %self.id, term, instances = plan.len(), "emitting assignments");
        let out = plan
            .iter()
            .cloned()
            .map(|mut inst| {
                self.seq += 1;
                inst.term = term;
                inst.seq = self.seq;
                CmdMsg::assignment(inst)
            })
            .collect();
        self.last_plan = Some(plan);
        out
    }
}

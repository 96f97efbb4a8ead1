use crate::models::proto::command::{cmd_msg::Entry, CmdMsg, Confirmation, Elected, Instance, Ping, Proposal};

impl CmdMsg {
    pub fn proposal(term: u64, candidate: impl Into<String>) -> Self {
        Self::from(Entry::Proposal(Proposal { term, candidate: candidate.into() }))
    }

    pub fn confirmation(term: u64, candidate: impl Into<String>, voter: impl Into<String>) -> Self {
        Self::from(Entry::Confirmation(Confirmation {
            term,
            candidate: candidate.into(),
            voter: voter.into(),
        }))
    }

    pub fn elected(term: u64, leader: impl Into<String>) -> Self {
        Self::from(Entry::Elected(Elected { term, leader: leader.into() }))
    }

    pub fn ping(term: u64, peer: impl Into<String>, incarnation: impl Into<String>, leading: bool) -> Self {
        Self::from(Entry::Ping(Ping {
            term,
            peer: peer.into(),
            leading,
            incarnation: incarnation.into(),
        }))
    }

    pub fn assignment(inst: Instance) -> Self {
        Self::from(Entry::Assignment(inst))
    }

    /// The ID of the peer which authored this entry, if known.
    pub fn author(&self) -> Option<&str> {
        match self.entry.as_ref()? {
            Entry::Proposal(val) => Some(&val.candidate),
            Entry::Confirmation(val) => Some(&val.voter),
            Entry::Elected(val) => Some(&val.leader),
            Entry::Ping(val) => Some(&val.peer),
            Entry::Assignment(_) => None,
        }
    }
}

impl From<Entry> for CmdMsg {
    fn from(entry: Entry) -> Self {
        Self { entry: Some(entry) }
    }
}

impl Instance {
    /// Check if this assignment places the same partitions on the same peer as `other`,
    /// ignoring the term & sequence number under which they were emitted.
    pub fn same_placement(&self, other: &Instance) -> bool {
        self.fname == other.fname && self.id == other.id && self.peer == other.peer && self.topic_slices == other.topic_slices
    }

    /// Check if this assignment supersedes `other`, which must be for the same instance.
    pub fn supersedes(&self, other: &Instance) -> bool {
        (self.term, self.seq) > (other.term, other.seq)
    }

    /// The key of this instance, unique within a grid.
    pub fn key(&self) -> (String, u32) {
        (self.fname.clone(), self.id)
    }
}

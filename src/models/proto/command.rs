//////////////////////////////////////////////////////////////////////////////
// Command Log ///////////////////////////////////////////////////////////////

/// An entry of a grid's command log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdMsg {
    #[prost(oneof = "cmd_msg::Entry", tags = "1, 2, 3, 4, 5")]
    pub entry: ::core::option::Option<cmd_msg::Entry>,
}
/// Nested message and enum types in `CmdMsg`.
pub mod cmd_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Entry {
        /// A peer proposing itself as leader of a term.
        #[prost(message, tag = "1")]
        Proposal(super::Proposal),
        /// A peer's vote for a proposal.
        #[prost(message, tag = "2")]
        Confirmation(super::Confirmation),
        /// A candidate announcing that it has been confirmed by a quorum.
        #[prost(message, tag = "3")]
        Elected(super::Elected),
        /// A periodic liveness entry.
        #[prost(message, tag = "4")]
        Ping(super::Ping),
        /// A partition assignment emitted by the leader.
        #[prost(message, tag = "5")]
        Assignment(super::Instance),
    }
}
/// A peer proposing itself as the leader of a term.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Proposal {
    /// The term being proposed.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The ID of the proposing peer.
    #[prost(string, tag = "2")]
    pub candidate: ::prost::alloc::string::String,
}
/// A vote cast by a peer for a proposal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Confirmation {
    /// The term of the proposal being confirmed.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The ID of the candidate being confirmed.
    #[prost(string, tag = "2")]
    pub candidate: ::prost::alloc::string::String,
    /// The ID of the voting peer.
    #[prost(string, tag = "3")]
    pub voter: ::prost::alloc::string::String,
}
/// A leadership announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Elected {
    /// The term of the leadership.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The ID of the leader.
    #[prost(string, tag = "2")]
    pub leader: ::prost::alloc::string::String,
}
/// A liveness entry.
///
/// Leaders emit these to hold their leadership, followers emit these to announce that they are
/// still members of the grid.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    /// The highest term known to the peer.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The ID of the peer.
    #[prost(string, tag = "2")]
    pub peer: ::prost::alloc::string::String,
    /// True if the peer is the leader of `term`.
    #[prost(bool, tag = "3")]
    pub leading: bool,
    /// A random ID chosen each time the peer starts, empty if unknown.
    #[prost(string, tag = "4")]
    pub incarnation: ::prost::alloc::string::String,
}
/// An assignment of topic partitions to an instance of an operator.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Instance {
    /// The term of the leader which emitted this assignment.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// The sequence number of this assignment within the leader's term.
    #[prost(uint64, tag = "2")]
    pub seq: u64,
    /// The name of the operator.
    #[prost(string, tag = "3")]
    pub fname: ::prost::alloc::string::String,
    /// The ID of this instance of the operator, in `[0, parallelism)`.
    #[prost(uint32, tag = "4")]
    pub id: u32,
    /// The ID of the peer which is to run this instance.
    #[prost(string, tag = "5")]
    pub peer: ::prost::alloc::string::String,
    /// The partitions assigned to this instance, sorted by topic.
    #[prost(message, repeated, tag = "6")]
    pub topic_slices: ::prost::alloc::vec::Vec<TopicSlice>,
}
/// The partitions of a topic assigned to an instance.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicSlice {
    #[prost(string, tag = "1")]
    pub topic: ::prost::alloc::string::String,
    /// The sorted partition IDs.
    #[prost(int32, repeated, tag = "2")]
    pub partitions: ::prost::alloc::vec::Vec<i32>,
}

//////////////////////////////////////////////////////////////////////////////
// Storage ///////////////////////////////////////////////////////////////////

/// A record as stored in a log partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    /// The partitioning key of the record.
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    /// The encoded message of the record.
    #[prost(bytes = "vec", tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

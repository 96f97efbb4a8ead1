//! Data models of the grid.

mod command_ext;
mod event;
pub mod proto {
    pub mod command;
}

pub use event::{Event, EventRx, EventTx, Message, MinMaxOffset, Payload};
pub use proto::command::{cmd_msg, CmdMsg, Confirmation, Elected, Instance, Ping, Proposal, Record, TopicSlice};

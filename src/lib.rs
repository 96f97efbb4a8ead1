//! A log-coordinated runtime for parallel data-flow operators.
//!
//! Peers of a grid share a partitioned log. They elect a leader through the grid's command topic,
//! the leader assigns the partitions of every operator's input topics to operator instances and
//! those instances to live peers, and each peer runs the instances assigned to it.

pub mod actor;
#[cfg(test)]
mod actor_test;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod error;
#[cfg(test)]
mod fixtures;
mod grid;
pub mod log;
pub mod manager;
pub mod meter;
pub mod models;
pub mod utils;
pub mod voter;

pub use crate::actor::{validate_actor_def, ActorDef};
pub use crate::config::Config;
pub use crate::error::{ActorError, GridError, GridResult};
pub use crate::grid::{merge, Actor, Grid, NewActor, ShutdownHandle};
pub use crate::log::{Decoder, Encoder, JsonCodec, Partitioner, ReadWriteLog, ReaderHandle, SledLog};
pub use crate::meter::{Meter, Registry};
pub use crate::models::{Event, EventRx, EventTx, Message, MinMaxOffset, Payload};
pub use crate::voter::LeaderState;

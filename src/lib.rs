extern crate bincode;
extern crate config;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate thiserror;
extern crate uuid;

pub mod configurations;
pub mod data;
pub mod executor;
pub mod map_phase;
pub mod master;
pub mod message;
pub mod node;
pub mod peer;
pub mod phase;
pub mod reduce_phase;
pub mod slave;
pub mod storage;
pub mod task;

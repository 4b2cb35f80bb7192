#![doc = include_str!("../README.md")]

mod audit;
mod config;
mod coordinator;
mod counter;
mod error;
mod gap;
mod request;
mod stats;
pub mod store;
mod time;

pub use crate::audit::*;
pub use crate::config::*;
pub use crate::coordinator::*;
pub use crate::counter::*;
pub use crate::error::*;
pub use crate::gap::*;
pub use crate::request::*;
pub use crate::stats::*;
pub use crate::store::{
    CasOutcome, CoordinationStore, HealthState, InMemoryStore, StoreClient, StoreError, Versioned,
};
pub use crate::time::*;

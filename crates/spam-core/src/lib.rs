pub mod actions;
pub mod api;
pub mod cloud;
pub mod config;
pub mod error;
pub mod keeper;
pub mod names;
pub mod pipeline;
pub mod simulator;
pub mod store;
pub mod subnet;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SpamError};

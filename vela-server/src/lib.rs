//! Vela server - HTTP surface, configuration and in-memory shard store for one peer
//!
//! The distributed read path lives in `vela_cluster`; this crate wires it to
//! an axum API, a TOML config file and [`storage::MemoryShards`].

pub mod api;
pub mod config;
pub mod node;
pub mod storage;

pub use config::Config;
pub use node::{Node, RunningNode};

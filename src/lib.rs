//! Convoy: a decentralized node daemon.
//!
//! Each node loads service definitions, reconciles them against the
//! containers running locally and pushes local changes to two buddy peers
//! chosen from the cluster membership.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gossip;
pub mod loader;
pub mod pull;
pub mod reconciler;
pub mod runtime;
pub mod store;
pub mod types;

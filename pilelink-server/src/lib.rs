//! # pilelink-server: charging-pile gateway service
//!
//! Long-running service that accepts TCP connections from charging
//! piles and runs the `pilelink-core` gateway on them: login, heartbeat
//! supervision, port tracking and command dispatch.
//!
//! Configuration comes from a TOML file (see [`config::ServerConfig`]),
//! with CLI flags and environment variables taking precedence.

pub mod config;
pub mod service;

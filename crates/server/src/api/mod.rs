//! # HTTP API

pub mod swarm;

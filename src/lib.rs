//! # Slate Gateway Library
//!
//! Ground-station gateway between a remote unit and operator consoles.
//!
//! The remote unit streams telemetry updates as UDP datagrams and accepts
//! commands over a TCP link. The gateway keeps the schema tree and a bounded
//! history of every telemetry point, fans live updates out to consoles, and
//! queues authorized operator commands to the remote unit, reconnecting and
//! refetching the schema whenever the link drops.

pub mod auth;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod heartbeat;
pub mod history;
pub mod schema;
pub mod server;
pub mod telemetry;
pub mod uplink;

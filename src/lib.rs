//! Field calculation agent
//!
//! Polls Modbus field devices, runs an operator-supplied formula script
//! over the converted readings every cycle and writes the results back.
//!
//! Architecture:
//! - `config`: YAML configuration and persistence
//! - `modbus`: register store over rodbus, plus an in-memory simulator
//! - `calc`: expression language, snapshot, smoothing and the cycle
//! - `guard`: shared state with the cycle/administration pause protocol
//! - `admin`: operator operations (configuration, manual access, dry run)
//! - `console`: diagnostic line sink
//! - `shutdown`: graceful task termination

pub mod admin;
pub mod calc;
pub mod config;
pub mod console;
pub mod error;
pub mod guard;
pub mod modbus;
pub mod shutdown;

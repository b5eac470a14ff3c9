//! Model Context Protocol message handling
//!
//! Provides JSON-RPC frame parsing and formatting, and the handler boundary the transports
//! dispatch parsed messages through.

pub mod handler;
pub mod rpc;

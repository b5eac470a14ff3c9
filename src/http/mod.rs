//! HTTP surface of the server
//!
//! Routes both wire transports, the health probe and the discovery document. The transports
//! are thin framing adapters over the shared session core in [`transport`] and [`writer`].

pub mod handlers;
pub mod sse;
pub mod streamable;
pub mod transport;
pub mod writer;

pub const HEALTH_PATH: &str = "/health";
pub const DISCOVERY_PATH: &str = "/.well-known/mcp";
pub const SSE_PATH: &str = "/sse";
pub const SSE_MESSAGES_PATH: &str = "/sse/messages";
pub const MCP_PATH: &str = "/mcp";

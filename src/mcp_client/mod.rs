//! MCP Client: JSON-RPC over stdio links to backend tool servers.
//!
//! This module handles:
//! - Resolving launch commands and spawning backend child processes
//! - Framing stdout into JSON-RPC messages and correlating responses by id
//! - The initialize / tools-list handshake
//! - Aggregating the tools of several links into one catalog
//!
//! The gateway's sessions own one `BackendLink` per enabled provider.

pub mod catalog;
pub mod errors;
pub mod framing;
pub mod launcher;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::ToolCatalog;
pub use errors::McpError;
pub use lifecycle::{BackendLink, LinkState};
pub use types::{McpToolDefinition, ServerConfig};

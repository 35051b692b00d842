//! MCP client transports

pub mod stdio;

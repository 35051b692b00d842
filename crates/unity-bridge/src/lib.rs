//! Direct-socket bridge to Unity editors
//!
//! Used when no plugin hub is running: each editor listens on a TCP port and
//! advertises it through status files in `~/.unity-mcp`.
//!
//! Protocol: 8-byte big-endian length-prefixed frames after a
//! `WELCOME UNITY-MCP ... FRAMING=1` greeting.

pub mod connection;
pub mod discovery;
pub mod framing;
pub mod pool;
pub mod port_registry;

pub use connection::{ConnectionSettings, UnityConnection};
pub use discovery::{InstanceSource, PortDiscovery, StatusFile};
pub use pool::ConnectionPool;
pub use port_registry::PortRegistry;

//! ee-ipc Library
//!
//! This library provides the client side of the IPC boundary between a
//! language runtime and an external execution engine process:
//!
//! - `ipc` - UNIX-domain socket transport, message framing, connect retry
//! - `config` - socket path resolution and timeouts
//!
//! # IPC Module
//!
//! ```ignore
//! use ee_ipc::config::TransportConfig;
//! use ee_ipc::ipc::{Framed, Transport};
//!
//! let config = TransportConfig::from_env()?;
//! let mut framed = Framed::new(config.connect()?);
//! framed.write_frame(b"payload")?;
//! let reply = framed.read_frame()?;
//! ```

pub mod config;
pub mod ipc;

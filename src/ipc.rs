//! IPC transport between a language runtime and the execution engine.
//!
//! This module provides the client side of the engine boundary: a blocking
//! UNIX-domain socket transport plus the optional layers callers stack on it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         Unix Socket          ┌─────────────────────┐
//! │    Runtime      │  ◄──────────────────────────►│  Execution engine   │
//! │    (Client)     │   opaque bytes (+ framing)   │     (external)      │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! # Layers
//!
//! - `client` - `Client` and the `Transport` trait: open, connect, read,
//!   write_all, close
//! - `framing` - Content-Length frames on top of any `Transport`
//! - `retry` - caller-side connect retry with exponential backoff
//!
//! # Usage
//!
//! ```ignore
//! use ee_ipc::ipc::{Client, Framed, Transport};
//!
//! let mut client = Client::open()?;
//! client.connect("/tmp/ee.sock".as_ref())?;
//!
//! let mut framed = Framed::new(client);
//! framed.write_frame(b"payload")?;
//! let reply = framed.read_frame()?;
//! ```

mod client;
mod framing;
mod retry;

pub use client::{
    buffer_view, Client, ClientReader, ClientWriter, ConnectionState, Transport, TransportError,
};
pub use framing::{encode_frame, FrameError, Framed, DEFAULT_MAX_FRAME_SIZE};
pub use retry::{connect_with_retry, RetryPolicy};

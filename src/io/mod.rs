//! I/O layer - Child process plumbing for line-delimited JSON-RPC
//!
//! This module provides the pieces between a child process and the protocol session:
//!
//! - **Process**: launching and reaping the server under test
//! - **Reader**: background tasks draining stdout and stderr
//! - **Buffer**: ordered hand-off of stdout lines, end of stream included
//! - **Framing**: one JSON message per line
//! - **Transport**: the request/response client built on top of them

pub mod buffer;
pub mod framing;
pub mod process;
pub mod reader;
pub mod transport;

// Re-export main types for convenience
pub use process::ProcessSpec;
pub use transport::{ClientConfig, StdioClient, Transport};

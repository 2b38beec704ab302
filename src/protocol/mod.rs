//! Protocol layer - JSON-RPC 2.0 messages and the MCP payloads carried in them

pub mod jsonrpc;
pub mod mcp;

pub use jsonrpc::{JsonRpcMessage, RequestId};

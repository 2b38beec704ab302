//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and scripted mock servers.

use serde_json::{Value, json};
use std::time::Duration;

use crate::io::{ClientConfig, ProcessSpec};

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer.
    ///
    /// ```bash
    /// RUST_LOG=mcp_probe::io=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }

    #[ctor::ctor]
    unsafe fn init_test_logging() {
        init();
    }
}

/// Stop grace used for mock children; they all exit promptly on SIGTERM
pub const MOCK_STOP_GRACE: Duration = Duration::from_millis(500);

/// Client configuration whose child is `sh -c <script>`
///
/// Scripts that must stay alive after answering end with `exec sleep 30`
/// so the child holds stdout open until it is stopped.
pub fn mock_server(script: &str) -> ClientConfig {
    ClientConfig::new(ProcessSpec::new("sh").with_args(["-c", script]))
        .with_stop_grace(MOCK_STOP_GRACE)
}

/// One compact JSON-RPC success response line, without the newline
pub fn response_line(id: i64, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_line_is_single_line_json() {
        let line = response_line(3, json!({"serverInfo": {"name": "mock"}}));
        assert!(!line.contains('\n'));
        assert!(!line.contains('\''));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], json!(3));
        assert_eq!(value["result"]["serverInfo"]["name"], "mock");
    }
}

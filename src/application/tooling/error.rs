use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolingError {
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: io::Error,
    },
    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("tool server '{server}' timed out waiting for {phase}")]
    Timeout { server: String, phase: String },
    #[error("tool server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("tool server '{server}' sent a malformed {detail}")]
    Protocol { server: String, detail: String },
    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("tool '{tool}' on server '{server}' reported failure: {message}")]
    Failed {
        server: String,
        tool: String,
        message: String,
    },
}

impl ToolingError {
    /// Connection-class failures: the process or its transport was
    /// unreachable. Eligible for one retry per call.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ToolingError::Spawn { .. }
                | ToolingError::Transport { .. }
                | ToolingError::Timeout { .. }
                | ToolingError::Terminated { .. }
        )
    }

}

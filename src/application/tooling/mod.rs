mod connection;
mod error;
mod process;

pub use connection::{NO_CONTENT_SENTINEL, StdioConnection, ToolServerConnection};
pub use error::ToolingError;

//! Tools exposed to the chat loop: built-in, and remote via MCP.

pub mod builtin;
pub mod mcp;
pub mod registry;

pub use builtin::{CalculatorTool, CurrentTimeTool};
pub use mcp::{McpConnection, McpManager};
pub use registry::{SharedTool, Tool, ToolDyn, ToolFailure, ToolRegistry};

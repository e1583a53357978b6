pub mod builtin_tools;
pub mod model_client;
pub mod tools;

pub use builtin_tools::{EchoTool, WaitTool};
pub use model_client::{ChatMessage, ChatRole, ModelClient, ModelError, ModelErrorKind, NoModel};
pub use tools::{ParamType, Tool, ToolCallContext, ToolDescriptor, ToolError, ToolParam, ToolRegistry};

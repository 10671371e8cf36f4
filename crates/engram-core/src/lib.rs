pub mod config;
pub mod context;
pub mod engine;
pub mod memory_tools;
pub mod session_lock;
pub mod tool;

pub use config::EngineConfig;
pub use engine::{AgentEngine, CreateAgentRequest, MemoryBlockSeed};
pub use memory_tools::{register_builtin_tools, BUILTIN_TOOL_NAMES};
pub use session_lock::SessionLockManager;
pub use tool::{ToolContext, ToolExecutor, ToolOutput, ToolRegistry};

pub mod builtin;
pub mod envelope;
pub mod executor;
pub mod func;
pub mod group;
pub mod registry;
pub mod schema;

pub use builtin::{install_discovery, register_session_tools};
pub use envelope::{error_envelope, ok_envelope, ToolOutcome};
pub use executor::{CallOutcome, ToolExecutor};
pub use func::FnTool;
pub use group::{RiskLevel, ToolGroup};
pub use registry::{GroupSummary, Tool, ToolDescriptor, ToolListListener, ToolRegistry};
pub use schema::args_schema;

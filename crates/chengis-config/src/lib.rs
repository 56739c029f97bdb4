//! Workflow file parsing and system configuration for Chengis.

pub mod error;
pub mod system;
pub mod workflow;

pub use error::{ConfigError, ConfigResult};
pub use system::SystemConfig;
pub use workflow::{MAX_WORKFLOW_BYTES, WORKFLOW_FILE_CANDIDATES, parse_workflow};

pub mod catalog;
pub mod config;
pub mod manifest;
pub mod prompt;
pub mod types;
pub mod workflow;

pub use catalog::{ModuleCatalog, ModuleInfo};
pub use config::Config;
pub use manifest::RunManifest;
pub use types::*;
pub use workflow::{parse_workflow, Workflow, WorkflowError, WorkflowStep};

pub mod classify_types;
pub mod config_types;
pub mod workflow_types;

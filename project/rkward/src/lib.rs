pub mod cli;
pub mod config;
pub mod election;
pub mod probe;
pub mod runtime;
pub mod supervisor;
pub mod targets;

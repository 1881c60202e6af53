pub mod actions;
pub mod collaborators;
pub mod config;
pub mod diff;
pub mod error;
pub mod evolution;
pub mod fields;
pub mod record;
pub mod service;
pub mod template;
pub mod types;
pub mod utils;
pub mod value;
pub mod workflow;

// src/core/mod.rs — Recursive execution engine

pub mod budget;
pub mod cancel;
pub mod dispatcher;
pub mod inject;
pub mod orchestrator;
pub mod sandbox;
pub mod system_prompt;
pub mod tree;
pub mod types;

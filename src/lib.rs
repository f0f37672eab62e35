// src/lib.rs — Library root for rlm

pub mod cli;
pub mod core;
pub mod infra;
pub mod provider;
pub mod tools;
pub mod util;

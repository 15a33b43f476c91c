// src/lib.rs

pub mod analysis;
pub mod config;
pub mod pipeline;
pub mod smoother;
pub mod types;

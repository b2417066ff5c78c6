//! Demo handlers served behind the pipeline.

mod demo;
mod health;

pub use demo::{SlowParams, slow, whoami};
pub use health::{HealthResponse, health_check};

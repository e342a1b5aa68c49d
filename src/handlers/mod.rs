mod demo;
mod health;

pub use demo::{ContextResponse, SlowParams, SlowResponse, bad_request, context, fail, root, slow};
pub use health::{HealthResponse, health_check};

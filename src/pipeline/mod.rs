//! Configuration and the end-to-end retouching pipeline.

mod config;
mod diffusion;

pub use config::Config;
pub use diffusion::Pipeline;

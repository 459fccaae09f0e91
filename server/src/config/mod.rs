//! Engine configuration, loaded from the environment.

pub mod engine;

pub use engine::EngineConfig;

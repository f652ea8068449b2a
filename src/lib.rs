pub mod config;
pub mod drivers;
pub mod engine;
pub mod types;

pub use config::ScopeConfig;
pub use engine::ScopeController;

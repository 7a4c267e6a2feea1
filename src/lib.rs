pub mod config;
pub mod delegation;
pub mod engine;
pub mod scenario;

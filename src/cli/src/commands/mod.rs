pub mod aggregate;
pub mod config;
pub mod publish;
pub mod queue;

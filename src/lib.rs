pub mod collectors;
pub mod config;
pub mod health;
pub mod http;
pub mod indicator;
pub mod metrics;
pub mod notify;
pub mod parser;
pub mod scheduler;
pub mod state;
pub mod telegram;

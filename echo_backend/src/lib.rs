pub mod config;
pub mod database;
pub mod llm_client;
pub mod proactive;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod signals;

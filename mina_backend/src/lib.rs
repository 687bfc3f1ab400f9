pub mod agent;
pub mod config;
pub mod conversation;
pub mod database;
pub mod emotion;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod persistence;
pub mod persona;
pub mod runtime;
pub mod server;

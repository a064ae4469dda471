pub mod agent;
pub mod config;
pub mod db;
pub mod llm;
pub mod speech;

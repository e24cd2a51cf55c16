//! ollamamux - a multiplexing gateway and process supervisor for ollama
//!
//! This library provides the pieces behind the `ollamamux` CLI:
//! - A single gateway per public address, shared by every concurrent invocation
//! - Transparent, streaming HTTP forwarding to a privately bound backend
//! - A health endpoint that proves a gateway is ours, not an unrelated listener
//! - Backend processes that die with the process that started them
//! - Command classification deciding how backend output reaches the user

pub mod config;
pub mod coordinator;
pub mod error;
pub mod headers;
pub mod health;
pub mod lock;
pub mod output;
pub mod pool;
pub mod process;
pub mod process_group;
pub mod proxy;
pub mod router;

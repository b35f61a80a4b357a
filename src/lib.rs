pub mod access_log;
pub mod blacklist;
pub mod cache;
pub mod config;
pub mod constants;
pub mod handler;
pub mod logging;
pub mod message;
pub mod net;
pub mod runtime;
pub mod scheduler;
pub mod server;

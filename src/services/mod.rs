pub mod auth;
pub mod config;
pub mod logger;
pub mod oracle;
pub mod planner;
pub mod prompt;
pub mod request;
pub mod retry;
pub mod security;
pub mod transport;
pub mod validation;
pub mod vault;

pub mod auth;
pub mod avatars;
pub mod config;
pub mod logging;
pub mod provision;
pub mod teardown;
pub mod trace;
pub mod workflow;

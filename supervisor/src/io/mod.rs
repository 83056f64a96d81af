//! I/O helpers for supervisor commands.

pub mod attempt_log;
pub mod config;
pub mod init;
pub mod process;
pub mod replace;
pub mod report;
pub mod validator;
pub mod version_store;

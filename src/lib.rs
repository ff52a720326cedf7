pub mod clean;
pub mod config;
pub mod console;
pub mod error;
pub mod health;
pub mod port;
pub mod prereq;
pub mod process;
pub mod prompt;
pub mod session;
pub mod supervisor;

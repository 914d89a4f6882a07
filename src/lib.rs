pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod manager;
pub mod notify;
pub mod probe;
pub mod restart;
pub mod state;
pub mod supervisor;

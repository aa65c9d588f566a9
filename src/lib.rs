pub mod args;
pub mod config;
pub mod errors;
pub mod peers;
pub mod raft;
pub mod rpc;

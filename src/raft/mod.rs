pub mod election;
pub mod interval;
pub mod log;
pub mod raft_server;
pub mod replica;
pub mod state;
pub mod sync;

#[cfg(test)]
mod mock;

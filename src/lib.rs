// Library exports for the resbench benchmark harness
pub mod backend;
pub mod config;
pub mod monitor;
pub mod network;
pub mod session;
pub mod stun;

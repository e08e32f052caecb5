pub mod cli;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod pipeline;
pub mod server;
pub mod source;
pub mod storage;

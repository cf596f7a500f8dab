pub mod cli;
pub mod client;
pub mod config;
pub mod marker;
pub mod wal;
pub mod web;

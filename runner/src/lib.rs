pub mod config;
pub mod database;
pub mod grid;
pub mod remote;
pub mod retrieve;
pub mod scheduler;
pub mod template;

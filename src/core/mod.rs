pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod registry;
pub mod runner;
pub mod session;
pub mod task;

#[cfg(test)]
mod testing;

pub mod cli;
pub mod committer;
pub mod session;

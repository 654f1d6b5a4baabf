pub mod archive;
pub mod http;
pub mod installer;
pub mod registry;
pub mod runtime;

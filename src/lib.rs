pub mod app;
pub mod batch;
pub mod cli;
pub mod collection;
pub mod config;
pub mod loader;
pub mod logging;
pub mod utils;

pub mod arrays;
pub mod batch;
pub mod cli;
pub mod collector;
pub mod commands;
pub mod config;
pub mod elapsed;
pub mod executors;
pub mod merge;
pub mod model_config;
pub mod monitor;
pub mod process;
pub mod runmask;
pub mod scratch;
pub mod split;
pub mod status;

pub mod catalog;
pub mod cli;
pub mod load_config;
pub mod logging;
pub mod session;
pub mod transport;

pub use cli::{run, Cli, Commands};

pub mod cli;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod pipeline;
pub mod process;

pub(crate) type Result<T, E = Box<dyn std::error::Error + Send + Sync + 'static>> =
    std::result::Result<T, E>;

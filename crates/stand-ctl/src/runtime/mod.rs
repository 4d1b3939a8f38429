mod app;
mod config;
mod logging;
mod operator;
mod stand;
mod telemetry;

pub use app::run_from_args;

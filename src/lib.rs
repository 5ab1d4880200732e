pub mod classify;
pub mod config;
pub mod hide;
pub mod monitor;
pub mod trace;
pub mod util;

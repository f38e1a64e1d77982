pub mod config;
pub mod error;
pub mod io;
pub mod progress;
pub mod state;

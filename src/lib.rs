pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod shutdown;
pub mod tally;
pub mod tasks;
pub mod transport;

pub use error::{Error, Result};

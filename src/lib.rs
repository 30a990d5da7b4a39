pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod model;
pub mod mqtt;
pub mod recipe;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use error::{DriverError, DriverResult};

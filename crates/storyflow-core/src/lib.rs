pub mod agents;
pub mod config;
pub mod controller;
pub mod driver;
pub mod epic;
pub mod error;
pub mod io;
pub mod paths;
pub mod runlog;
pub mod sdk;
pub mod status;
pub mod store;
pub mod story;
pub mod sync;
pub mod tools;

pub use error::{FlowError, Result};

pub mod config;
pub mod errors;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod stages;
pub mod store;
pub mod upload;

pub use gavel_common as common;

pub mod config;
pub mod error;
pub mod faces;
pub mod layout;
pub mod ledger;
pub mod schema;
pub mod store;

pub use config::RollConfig;
pub use error::{Result, StoreError};
pub use layout::{DataDir, default_base_dir};
pub use store::{DEFAULT_CONNECTIONS, Store};

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod record;
pub mod store;
pub mod warehouse;

pub use config::Config;
pub use error::{EtlError, Result};
pub use record::RecordSet;

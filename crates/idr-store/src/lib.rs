pub mod error;
pub mod paths;
pub mod records;
pub mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use paths::{default_base_dir, default_db_path};
pub use records::SqliteRecords;
pub use store::{Store, StoreStats};

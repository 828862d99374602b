pub mod businesses;
pub mod connection;
pub mod migrations;
pub mod repositories;

pub use businesses::{load_business_directory, BusinessLoadError};
pub use connection::{connect, connect_with_settings, ping, DbPool};
pub use repositories::{
    CallRecordRepository, InMemoryCallRecordRepository, RepositoryError, SqlCallRecordRepository,
};

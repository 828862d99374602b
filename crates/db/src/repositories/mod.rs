use async_trait::async_trait;
use thiserror::Error;

use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::SessionId;

pub mod call_record;
pub mod memory;

pub use call_record::SqlCallRecordRepository;
pub use memory::InMemoryCallRecordRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Outcomes of finished calls, one row per session.
#[async_trait]
pub trait CallRecordRepository: Send + Sync {
    /// Inserts or replaces the record for `record.session_id`.
    async fn save(&self, record: &CallRecord) -> Result<(), RepositoryError>;

    async fn find_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CallRecord>, RepositoryError>;

    /// Most recently ended calls first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<CallRecord>, RepositoryError>;
}

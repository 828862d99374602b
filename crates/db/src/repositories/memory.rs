use std::collections::HashMap;

use tokio::sync::RwLock;

use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::SessionId;

use super::{CallRecordRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryCallRecordRepository {
    records: RwLock<HashMap<String, CallRecord>>,
}

#[async_trait::async_trait]
impl CallRecordRepository for InMemoryCallRecordRepository {
    async fn save(&self, record: &CallRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.session_id.0.clone(), record.clone());
        Ok(())
    }

    async fn find_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CallRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&session_id.0).cloned())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<CallRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut recent: Vec<CallRecord> = records.values().cloned().collect();
        recent.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        recent.truncate(limit as usize);
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use callquote_core::domain::call::CallRecord;
    use callquote_core::domain::session::{Session, SessionId, SessionStatus};
    use callquote_core::rollout::StrategyKind;
    use chrono::{Duration, Utc};

    use crate::repositories::{CallRecordRepository, InMemoryCallRecordRepository};

    fn record(id: &str, minutes_ago: i64) -> CallRecord {
        let mut session =
            Session::new(SessionId(id.to_string()), "piano_moving_001", "+1555", "+1229", StrategyKind::Keyword);
        session.transition_to(SessionStatus::Abandoned).expect("abandon");
        let mut record = CallRecord::from_session(&session, None);
        record.ended_at = Utc::now() - Duration::minutes(minutes_ago);
        record
    }

    #[tokio::test]
    async fn in_memory_repo_round_trip_and_recency_order() {
        let repo = InMemoryCallRecordRepository::default();
        repo.save(&record("CA-old", 30)).await.expect("save old");
        repo.save(&record("CA-new", 1)).await.expect("save new");

        let found = repo.find_by_session(&SessionId("CA-old".to_string())).await.expect("find");
        assert_eq!(found.map(|record| record.session_id.0), Some("CA-old".to_string()));

        let recent = repo.list_recent(1).await.expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].session_id.0, "CA-new");
    }
}

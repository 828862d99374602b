use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};

use callquote_core::domain::call::CallRecord;
use callquote_core::domain::session::{SessionId, SessionStatus};
use callquote_core::rollout::StrategyKind;

use super::{CallRecordRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT session_id, business_id, caller, strategy, status, fields_json,
        transcript_json, escalation_reason, quote_json, started_at, ended_at
 FROM call_record";

pub struct SqlCallRecordRepository {
    pool: DbPool,
}

impl SqlCallRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_err(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| RepositoryError::Encode(error.to_string()))
}

fn decode<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| decode_err(format!("{column}: {error}")))
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| decode_err(format!("{column}: {error}")))
}

fn row_to_record(row: &SqliteRow) -> Result<CallRecord, RepositoryError> {
    let session_id: String = row.try_get("session_id").map_err(decode_err)?;
    let business_id: String = row.try_get("business_id").map_err(decode_err)?;
    let caller: String = row.try_get("caller").map_err(decode_err)?;
    let strategy: String = row.try_get("strategy").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    let fields_json: String = row.try_get("fields_json").map_err(decode_err)?;
    let transcript_json: String = row.try_get("transcript_json").map_err(decode_err)?;
    let escalation_reason: Option<String> = row.try_get("escalation_reason").map_err(decode_err)?;
    let quote_json: Option<String> = row.try_get("quote_json").map_err(decode_err)?;
    let started_at: String = row.try_get("started_at").map_err(decode_err)?;
    let ended_at: String = row.try_get("ended_at").map_err(decode_err)?;

    Ok(CallRecord {
        session_id: SessionId(session_id),
        business_id,
        caller,
        strategy: StrategyKind::parse(&strategy)
            .ok_or_else(|| decode_err(format!("unknown strategy `{strategy}`")))?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown status `{status}`")))?,
        fields: decode("fields_json", &fields_json)?,
        transcript: decode("transcript_json", &transcript_json)?,
        escalation_reason,
        quote: quote_json.as_deref().map(|raw| decode("quote_json", raw)).transpose()?,
        started_at: parse_timestamp("started_at", &started_at)?,
        ended_at: parse_timestamp("ended_at", &ended_at)?,
    })
}

#[async_trait::async_trait]
impl CallRecordRepository for SqlCallRecordRepository {
    async fn save(&self, record: &CallRecord) -> Result<(), RepositoryError> {
        let quote_json = record.quote.as_ref().map(encode).transpose()?;
        let quote_total = record.quote.as_ref().map(|quote| quote.total.to_string());

        sqlx::query(
            "INSERT INTO call_record (session_id, business_id, caller, strategy, status, fields_json,
                                      transcript_json, escalation_reason, quote_json, quote_total,
                                      started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                 status = excluded.status,
                 fields_json = excluded.fields_json,
                 transcript_json = excluded.transcript_json,
                 escalation_reason = excluded.escalation_reason,
                 quote_json = excluded.quote_json,
                 quote_total = excluded.quote_total,
                 ended_at = excluded.ended_at",
        )
        .bind(&record.session_id.0)
        .bind(&record.business_id)
        .bind(&record.caller)
        .bind(record.strategy.as_str())
        .bind(record.status.as_str())
        .bind(encode(&record.fields)?)
        .bind(encode(&record.transcript)?)
        .bind(&record.escalation_reason)
        .bind(&quote_json)
        .bind(&quote_total)
        .bind(record.started_at.to_rfc3339())
        .bind(record.ended_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CallRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE session_id = ?"))
            .bind(&session_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<CallRecord>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY ended_at DESC LIMIT ?"))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::call::CallRecord;
    use callquote_core::domain::field::FieldValue;
    use callquote_core::domain::session::{Session, SessionId, SessionStatus};
    use callquote_core::pricing::{compute_breakdown, DistanceSource};
    use callquote_core::rollout::StrategyKind;
    use sqlx::Row;

    use super::SqlCallRecordRepository;
    use crate::migrations::run_pending;
    use crate::repositories::CallRecordRepository;
    use crate::{connect_with_settings, DbPool};

    async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        pool
    }

    fn completed_record(id: &str) -> CallRecord {
        let profile = piano_moving_profile().expect("profile");
        let mut session =
            Session::new(SessionId(id.to_string()), &profile.business_id, "+1555", "+1229", StrategyKind::Agent);
        session.push_customer("a baby grand");
        session.push_agent("Got it.");
        session.fields.insert("piano_type".to_string(), FieldValue::Text("baby_grand".to_string()));
        session.fields.insert("stairs_count".to_string(), FieldValue::Integer(2));
        session.fields.insert("has_insurance".to_string(), FieldValue::Boolean(false));
        session.transition_to(SessionStatus::Complete).expect("complete");
        let quote = compute_breakdown(&session.fields, &profile.pricing, 12.0, DistanceSource::Measured)
            .expect("quote");
        CallRecord::from_session(&session, Some(quote))
    }

    #[tokio::test]
    async fn saves_and_reloads_a_completed_call() {
        let pool = migrated_pool().await;
        let repo = SqlCallRecordRepository::new(pool.clone());
        let record = completed_record("CA-sql-1");

        repo.save(&record).await.expect("save");
        let loaded = repo
            .find_by_session(&SessionId("CA-sql-1".to_string()))
            .await
            .expect("find")
            .expect("record present");

        assert_eq!(loaded, record);
        let total: String = sqlx::query("SELECT quote_total FROM call_record WHERE session_id = ?")
            .bind("CA-sql-1")
            .fetch_one(&pool)
            .await
            .expect("row")
            .try_get("quote_total")
            .expect("quote_total");
        assert_eq!(Some(total), record.quote.as_ref().map(|quote| quote.total.to_string()));
    }

    #[tokio::test]
    async fn saving_twice_replaces_the_outcome() {
        let repo = SqlCallRecordRepository::new(migrated_pool().await);
        let mut record = completed_record("CA-sql-2");
        repo.save(&record).await.expect("first save");

        record.status = SessionStatus::Escalated;
        record.quote = None;
        record.escalation_reason = Some("caller asked for a person".to_string());
        repo.save(&record).await.expect("second save");

        let recent = repo.list_recent(10).await.expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, SessionStatus::Escalated);
        assert!(recent[0].quote.is_none());
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let repo = SqlCallRecordRepository::new(migrated_pool().await);
        let found = repo.find_by_session(&SessionId("CA-nope".to_string())).await.expect("find");
        assert!(found.is_none());
    }
}

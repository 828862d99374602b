use std::sync::Arc;

use axum::Router;
use callquote_agent::{engine_from_config, AgentRuntime, RuntimeParts, RuntimeSettings};
use callquote_core::audit::{AuditSink, TracingAuditSink};
use callquote_core::business::StaticSchemaSource;
use callquote_core::config::{AppConfig, ConfigError, LoadOptions};
use callquote_core::errors::ApplicationError;
use callquote_core::notify::{DisabledNotifier, QuoteNotifier};
use callquote_core::pricing::{DistanceLookup, NoDistanceLookup};
use callquote_db::{
    connect_with_settings, load_business_directory, migrations, BusinessLoadError, CallRecordRepository,
    DbPool, SqlCallRecordRepository,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::geocode::NominatimDistance;
use crate::health::{self, HealthState};
use crate::twilio::TwilioSms;
use crate::voice::{self, TwimlRenderer, TwimlSettings, VoiceState};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub records: Arc<dyn CallRecordRepository>,
    pub twiml: Arc<TwimlRenderer>,
}

impl Application {
    pub fn router(&self) -> Router {
        health::router(HealthState { db_pool: self.db_pool.clone(), sessions: self.runtime.store() }).merge(
            voice::router(VoiceState {
                runtime: self.runtime.clone(),
                records: self.records.clone(),
                twiml: self.twiml.clone(),
            }),
        )
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Businesses(#[from] BusinessLoadError),
    #[error("llm extractor setup failed: {0}")]
    Extractor(String),
    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("twiml template setup failed: {0}")]
    Twiml(#[source] tera::Error),
    #[error("agent runtime setup failed: {0}")]
    Runtime(#[from] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let businesses = load_business_directory(&config.businesses.directory)?;
    info!(
        event_name = "system.bootstrap.businesses_loaded",
        correlation_id = "bootstrap",
        businesses = businesses.len(),
        directory = %config.businesses.directory.display(),
        "business profiles loaded"
    );

    let runtime = build_runtime(&config, businesses, Arc::new(TracingAuditSink))?;
    let records: Arc<dyn CallRecordRepository> = Arc::new(SqlCallRecordRepository::new(db_pool.clone()));

    let twiml = TwimlRenderer::new(TwimlSettings::from_config(&config.telephony)).map_err(BootstrapError::Twiml)?;

    Ok(Application { config, db_pool, runtime: Arc::new(runtime), records, twiml: Arc::new(twiml) })
}

/// Wires the conversation runtime and its outbound adapters from config.
pub fn build_runtime(
    config: &AppConfig,
    businesses: StaticSchemaSource,
    audit: Arc<dyn AuditSink>,
) -> Result<AgentRuntime, BootstrapError> {
    let engine =
        engine_from_config(config, audit.clone()).map_err(|error| BootstrapError::Extractor(error.to_string()))?;

    let distance: Arc<dyn DistanceLookup> = if config.geocoding.enabled {
        Arc::new(NominatimDistance::from_config(&config.geocoding).map_err(BootstrapError::HttpClient)?)
    } else {
        info!(event_name = "system.bootstrap.geocoding_disabled", "quotes use the fallback distance");
        Arc::new(NoDistanceLookup)
    };

    let notifier: Arc<dyn QuoteNotifier> =
        match TwilioSms::from_config(&config.telephony).map_err(BootstrapError::HttpClient)? {
            Some(sms) => Arc::new(sms),
            None => {
                warn!(
                    event_name = "system.bootstrap.sms_disabled",
                    "telephony credentials incomplete, sms quotes will not be sent"
                );
                Arc::new(DisabledNotifier)
            }
        };

    Ok(AgentRuntime::new(RuntimeParts {
        engine,
        businesses: Arc::new(businesses),
        distance,
        notifier,
        audit,
        settings: RuntimeSettings::from_config(config),
    })?)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use callquote_core::business::piano_moving_profile;
    use callquote_core::config::{ConfigOverrides, LoadOptions};
    use tower::ServiceExt;

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn options(database_url: &str, directory: &std::path::Path) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                businesses_directory: Some(directory.to_path_buf()),
                agent_rollout_pct: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_an_empty_business_directory() {
        let dir = tempfile_dir();

        let result = bootstrap(options("sqlite::memory:", dir.path())).await;

        assert!(matches!(result, Err(BootstrapError::Businesses(_))));
    }

    #[tokio::test]
    async fn bootstrapped_router_serves_health_and_voice() {
        let dir = tempfile_dir();
        let profile = piano_moving_profile().expect("profile");
        fs::write(dir.path().join("piano.json"), serde_json::to_string(&profile).expect("json"))
            .expect("write profile");

        let app = bootstrap(options("sqlite::memory:", dir.path())).await.expect("bootstrap");
        let router = app.router();

        let health = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("health response");
        assert_eq!(health.status(), StatusCode::OK);
        let body = to_bytes(health.into_body(), usize::MAX).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["database"]["status"], "ready");

        let voice = router
            .oneshot(
                Request::post("/voice")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("CallSid=CA-boot&From=%2B15551230000&To=%2B12299223706"))
                    .expect("request"),
            )
            .await
            .expect("voice response");
        assert_eq!(voice.status(), StatusCode::OK);
        let twiml = String::from_utf8(to_bytes(voice.into_body(), usize::MAX).await.expect("body").to_vec())
            .expect("utf8");
        assert!(twiml.contains("PianoMove AI"));

        app.db_pool.close().await;
    }

    fn tempfile_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }
}

use callquote_core::config::{AppConfig, LlmProvider, LoadOptions};
use callquote_db::{connect_with_settings, load_business_directory, ping};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const CHECKS_AFTER_CONFIG: [&str; 4] =
    ["database_connectivity", "business_profiles", "extractor_readiness", "sms_delivery"];

pub fn run(json_output: bool) -> String {
    let report = build_report(AppConfig::load(LoadOptions::default()));

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(
    loaded: Result<AppConfig, callquote_core::config::ConfigError>,
) -> DoctorReport {
    let mut checks = Vec::new();

    match loaded {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_database_connectivity(&config));
            checks.push(check_business_profiles(&config));
            checks.push(check_extractor(&config));
            checks.push(check_sms(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in CHECKS_AFTER_CONFIG {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    // Skipped optional features do not fail the report.
    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        let pinged = ping(&pool).await.map_err(|error| format!("database query failed: {error}"));
        pool.close().await;
        pinged
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn check_business_profiles(config: &AppConfig) -> DoctorCheck {
    match load_business_directory(&config.businesses.directory) {
        Ok(source) => DoctorCheck {
            name: "business_profiles",
            status: CheckStatus::Pass,
            details: format!(
                "{} profile(s) loaded from `{}`: {}",
                source.len(),
                config.businesses.directory.display(),
                source.business_ids().join(", ")
            ),
        },
        Err(error) => {
            DoctorCheck { name: "business_profiles", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

fn check_extractor(config: &AppConfig) -> DoctorCheck {
    let rollout = config.conversation.agent_rollout_pct;
    if rollout == 0 {
        return DoctorCheck {
            name: "extractor_readiness",
            status: CheckStatus::Skipped,
            details: "agent rollout is 0%, every call uses keyword matching".to_string(),
        };
    }

    let endpoint = match config.llm.provider {
        LlmProvider::Ollama => config.llm.base_url.clone().unwrap_or_default(),
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            config.llm.base_url.clone().unwrap_or_else(|| "provider default".to_string())
        }
    };
    DoctorCheck {
        name: "extractor_readiness",
        status: CheckStatus::Pass,
        details: format!(
            "{} model `{}` at {endpoint} for {rollout}% of calls",
            config.llm.provider.as_str(),
            config.llm.model
        ),
    }
}

fn check_sms(config: &AppConfig) -> DoctorCheck {
    if config.telephony.sms_enabled() {
        DoctorCheck {
            name: "sms_delivery",
            status: CheckStatus::Pass,
            details: "telephony credentials present, quotes are texted to callers".to_string(),
        }
    } else {
        DoctorCheck {
            name: "sms_delivery",
            status: CheckStatus::Skipped,
            details: "account_sid, auth_token or from_number missing, sms quotes disabled".to_string(),
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use callquote_core::config::{AppConfig, ConfigError};

    use super::{build_report, render_human, CheckStatus};

    #[test]
    fn config_failure_skips_the_remaining_checks() {
        let report = build_report(Err(ConfigError::Validation("bad port".to_string())));

        assert_eq!(report.overall_status, CheckStatus::Fail);
        assert_eq!(report.checks.len(), 5);
        assert!(report.checks[1..].iter().all(|check| check.status == CheckStatus::Skipped));
    }

    #[test]
    fn missing_business_directory_fails_the_report() {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.businesses.directory = "/nonexistent/callquote-businesses".into();
        config.conversation.agent_rollout_pct = 0;

        let report = build_report(Ok(config));
        let rendered = render_human(&report);

        assert_eq!(report.overall_status, CheckStatus::Fail);
        assert!(rendered.contains("- [ok] database_connectivity"));
        assert!(rendered.contains("- [fail] business_profiles"));
        assert!(rendered.contains("- [skip] extractor_readiness"));
    }
}

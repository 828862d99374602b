//! SMS quote delivery through the Twilio Messages API.

use std::time::Duration;

use async_trait::async_trait;
use callquote_core::config::TelephonyConfig;
use callquote_core::notify::{NotificationError, QuoteDelivery, QuoteNotifier};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct MessageCreated {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct ApiFailure {
    message: String,
}

pub struct TwilioSms {
    client: reqwest::Client,
    messages_url: String,
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
}

impl TwilioSms {
    /// `None` unless the account sid, auth token and sender number are all set.
    pub fn from_config(config: &TelephonyConfig) -> Result<Option<Self>, reqwest::Error> {
        if !config.sms_enabled() {
            return Ok(None);
        }
        let (Some(account_sid), Some(auth_token), Some(from_number)) =
            (config.account_sid.clone(), config.auth_token.clone(), config.from_number.clone())
        else {
            return Ok(None);
        };

        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        let messages_url = format!(
            "{}/2010-04-01/Accounts/{account_sid}/Messages.json",
            config.api_base_url.trim_end_matches('/')
        );
        Ok(Some(Self { client, messages_url, account_sid, auth_token, from_number }))
    }
}

#[async_trait]
impl QuoteNotifier for TwilioSms {
    async fn deliver_quote(&self, delivery: &QuoteDelivery) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[
                ("To", delivery.destination.as_str()),
                ("From", self.from_number.as_str()),
                ("Body", delivery.body.as_str()),
            ])
            .send()
            .await
            .map_err(|error| NotificationError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiFailure>().await {
                Ok(failure) => failure.message,
                Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
            };
            return Err(NotificationError::Rejected { status: status.as_u16(), message });
        }

        let created: MessageCreated =
            response.json().await.map_err(|error| NotificationError::Transport(error.to_string()))?;
        info!(
            event_name = "notification.sms_accepted",
            message_sid = %created.sid,
            business = %delivery.display_name,
            "sms quote accepted by provider"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::post,
        Form, Json, Router,
    };
    use callquote_core::business::piano_moving_profile;
    use callquote_core::config::AppConfig;
    use callquote_core::domain::field::{FieldValue, FieldValues};
    use callquote_core::notify::{NotificationError, QuoteDelivery, QuoteNotifier};
    use callquote_core::pricing::{compute_breakdown, DistanceSource};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    use super::TwilioSms;

    type Captured = Arc<Mutex<Vec<(String, Option<String>, HashMap<String, String>)>>>;

    async fn create_message(
        State(captured): State<Captured>,
        Path(account): Path<String>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers.get("authorization").and_then(|value| value.to_str().ok()).map(str::to_string);
        let rejected = form.get("To").map(String::as_str) == Some("+10000000000");
        captured.lock().expect("capture lock").push((account, auth, form));
        if rejected {
            return (StatusCode::BAD_REQUEST, Json(json!({ "message": "invalid To number" })));
        }
        (StatusCode::CREATED, Json(json!({ "sid": "SM123" })))
    }

    async fn provider() -> (TwilioSms, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route("/2010-04-01/Accounts/{account}/Messages.json", post(create_message))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut telephony = AppConfig::default().telephony;
        telephony.account_sid = Some("AC-test".to_string());
        telephony.auth_token = Some("token".to_string().into());
        telephony.from_number = Some("+12299223706".to_string());
        telephony.api_base_url = format!("http://{address}");
        let sms = TwilioSms::from_config(&telephony).expect("client").expect("sms enabled");
        (sms, captured)
    }

    fn delivery(destination: &str) -> QuoteDelivery {
        let profile = piano_moving_profile().expect("profile");
        let fields = FieldValues::from([
            ("piano_type".to_string(), FieldValue::Text("upright".to_string())),
            ("stairs_count".to_string(), FieldValue::Integer(0)),
        ]);
        let quote = compute_breakdown(&fields, &profile.pricing, 10.0, DistanceSource::Measured).expect("quote");
        QuoteDelivery {
            destination: destination.to_string(),
            display_name: profile.display_name,
            quote,
            body: "PianoMove AI Quote\n\nTOTAL: $215.00".to_string(),
        }
    }

    #[test]
    fn missing_credentials_disable_sms() {
        let telephony = AppConfig::default().telephony;
        assert!(TwilioSms::from_config(&telephony).expect("build").is_none());
    }

    #[tokio::test]
    async fn posts_form_encoded_message_with_basic_auth() {
        let (sms, captured) = provider().await;

        sms.deliver_quote(&delivery("+15551230000")).await.expect("delivered");

        let captured = captured.lock().expect("capture lock");
        let (account, auth, form) = &captured[0];
        assert_eq!(account, "AC-test");
        assert!(auth.as_deref().is_some_and(|value| value.starts_with("Basic ")));
        assert_eq!(form.get("To").map(String::as_str), Some("+15551230000"));
        assert_eq!(form.get("From").map(String::as_str), Some("+12299223706"));
        assert!(form.get("Body").is_some_and(|body| body.contains("TOTAL: $215.00")));
    }

    #[tokio::test]
    async fn provider_rejection_carries_status_and_message() {
        let (sms, _) = provider().await;

        let error = sms.deliver_quote(&delivery("+10000000000")).await.expect_err("rejected");
        assert_eq!(
            error,
            NotificationError::Rejected { status: 400, message: "invalid To number".to_string() }
        );
    }
}

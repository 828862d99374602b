//! Per-business capability table: schema, pricing and conversational copy,
//! resolved once when a session is created.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::ApplicationError;
use crate::pricing::{CountSurcharge, PricingRules};
use crate::schema::{FieldSchema, FieldSpec, FieldType, SchemaError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub business_id: String,
    pub display_name: String,
    pub agent_name: String,
    /// Called numbers routed to this business.
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    pub greeting: String,
    #[serde(default = "default_closing_line")]
    pub closing_line: String,
    #[serde(default)]
    pub escalation_number: Option<String>,
    #[serde(default = "default_escalation_message")]
    pub escalation_message: String,
    /// Domain notes included in the extractor prompt.
    #[serde(default)]
    pub guidance: Option<String>,
    pub schema: FieldSchema,
    pub pricing: PricingRules,
    #[serde(default)]
    pub voice_quote_template: Option<String>,
    #[serde(default)]
    pub sms_quote_template: Option<String>,
}

fn default_closing_line() -> String {
    "Let me calculate that for you now.".to_string()
}

fn default_escalation_message() -> String {
    "Let me connect you with someone from our team who can help.".to_string()
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("business profile `{business_id}`: {reason}")]
    Invalid { business_id: String, reason: String },
    #[error("business profile `{business_id}`: {source}")]
    Schema { business_id: String, source: SchemaError },
    #[error("phone number `{number}` is routed to both `{first}` and `{second}`")]
    DuplicateRoute { number: String, first: String, second: String },
}

impl BusinessProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        let invalid = |reason: &str| ProfileError::Invalid {
            business_id: self.business_id.clone(),
            reason: reason.to_string(),
        };

        if self.business_id.trim().is_empty() {
            return Err(invalid("business_id must not be empty"));
        }
        if self.display_name.trim().is_empty() {
            return Err(invalid("display_name must not be empty"));
        }
        if self.greeting.trim().is_empty() {
            return Err(invalid("greeting must not be empty"));
        }
        if self.phone_numbers.iter().any(|number| normalize_phone(number).is_empty()) {
            return Err(invalid("phone_numbers must not contain blank entries"));
        }

        self.pricing.validate(&self.schema).map_err(|source| ProfileError::Schema {
            business_id: self.business_id.clone(),
            source,
        })
    }

    /// Escalation target, falling back to the deployment-wide number.
    pub fn transfer_target<'a>(&'a self, fallback: Option<&'a str>) -> Option<&'a str> {
        self.escalation_number
            .as_deref()
            .or(fallback)
            .map(str::trim)
            .filter(|number| !number.is_empty())
    }
}

/// Canonical routing key for a phone number: digits plus an optional leading `+`.
pub fn normalize_phone(number: &str) -> String {
    let trimmed = number.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Maps a called number to the business that owns it.
    async fn resolve_business(&self, called_number: &str) -> Result<String, ApplicationError>;
    async fn load_profile(&self, business_id: &str)
        -> Result<Arc<BusinessProfile>, ApplicationError>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticSchemaSource {
    profiles: HashMap<String, Arc<BusinessProfile>>,
    routes: HashMap<String, String>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a profile along with its phone routes.
    pub fn insert(&mut self, profile: BusinessProfile) -> Result<(), ProfileError> {
        profile.validate()?;

        for number in &profile.phone_numbers {
            let key = normalize_phone(number);
            match self.routes.get(&key) {
                Some(existing) if existing != &profile.business_id => {
                    return Err(ProfileError::DuplicateRoute {
                        number: key,
                        first: existing.clone(),
                        second: profile.business_id.clone(),
                    });
                }
                _ => {}
            }
        }
        for number in &profile.phone_numbers {
            self.routes.insert(normalize_phone(number), profile.business_id.clone());
        }
        self.profiles.insert(profile.business_id.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn with_profile(mut self, profile: BusinessProfile) -> Result<Self, ProfileError> {
        self.insert(profile)?;
        Ok(self)
    }

    pub fn business_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn routes(&self) -> BTreeMap<String, String> {
        self.routes.iter().map(|(number, id)| (number.clone(), id.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn resolve_business(&self, called_number: &str) -> Result<String, ApplicationError> {
        let key = normalize_phone(called_number);
        match self.routes.get(&key) {
            Some(business_id) => {
                debug!(
                    event_name = "business.resolved",
                    called = %key,
                    business_id = %business_id,
                    "business identified from called number"
                );
                Ok(business_id.clone())
            }
            None => {
                warn!(
                    event_name = "business.route_missing",
                    called = %key,
                    "no business is routed to the called number"
                );
                Err(ApplicationError::ConfigurationNotFound(format!(
                    "no business is routed to `{called_number}`"
                )))
            }
        }
    }

    async fn load_profile(
        &self,
        business_id: &str,
    ) -> Result<Arc<BusinessProfile>, ApplicationError> {
        self.profiles.get(business_id).cloned().ok_or_else(|| {
            ApplicationError::ConfigurationNotFound(format!(
                "business profile `{business_id}` is not loaded"
            ))
        })
    }
}

/// Reference piano-moving profile, mirrored by `businesses/piano_moving_001.json`.
pub fn piano_moving_profile() -> Result<BusinessProfile, SchemaError> {
    let fields = vec![
        FieldSpec::categorical("piano_type", ["upright", "baby_grand", "grand"])
            .with_prompt(
                "What type of piano are you moving? Is it an upright, baby grand, or grand piano?",
            )
            .with_synonyms("upright", ["upright", "vertical"])
            .with_synonyms("baby_grand", ["baby grand"])
            .with_synonyms("grand", ["grand", "concert grand"]),
        FieldSpec::new("pickup_address", FieldType::Address)
            .with_prompt("Where are we picking it up from? Please give me the full address."),
        FieldSpec::new("delivery_address", FieldType::Address)
            .with_prompt("And where's it going? What's the delivery address?"),
        FieldSpec::new("stairs_count", FieldType::Integer)
            .with_prompt("Are there any stairs at either location? If yes, how many?")
            .with_bounds(Some(0), Some(500)),
        FieldSpec::new("has_insurance", FieldType::Boolean).with_prompt(
            "Would you like piano insurance for the move? This covers any potential damage during transport.",
        ),
    ];

    let schema = FieldSchema::new(fields)?;

    Ok(BusinessProfile {
        business_id: "piano_moving_001".to_string(),
        display_name: "PianoMove AI".to_string(),
        agent_name: "Sandra".to_string(),
        phone_numbers: vec!["+12299223706".to_string()],
        greeting: "Hi! I'm Sandra from PianoMove AI. I can help you get an instant quote for moving your piano. First, what type of piano are you moving? Is it an upright, baby grand, or grand piano?".to_string(),
        closing_line: "Excellent. Let me calculate that for you now.".to_string(),
        escalation_number: None,
        escalation_message: default_escalation_message(),
        guidance: Some(
            "Pianos are heavy and fragile. Stairs at either end add labour, so always confirm the stair count.".to_string(),
        ),
        schema,
        pricing: PricingRules {
            currency: "USD".to_string(),
            category_field: "piano_type".to_string(),
            default_category: "upright".to_string(),
            base_by_category: BTreeMap::from([
                ("upright".to_string(), Decimal::new(20000, 2)),
                ("baby_grand".to_string(), Decimal::new(35000, 2)),
                ("grand".to_string(), Decimal::new(50000, 2)),
            ]),
            origin_field: "pickup_address".to_string(),
            destination_field: "delivery_address".to_string(),
            rate_per_km: Decimal::new(150, 2),
            fallback_distance_km: 50.0,
            count_surcharges: vec![CountSurcharge {
                field: "stairs_count".to_string(),
                label: "Stairs".to_string(),
                rate_per_unit: Decimal::new(1500, 2),
            }],
            insurance_field: Some("has_insurance".to_string()),
            insurance_rate: Decimal::new(15, 2),
        },
        voice_quote_template: None,
        sms_quote_template: None,
    })
}

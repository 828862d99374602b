//! Deterministic quote engine.
//!
//! Arithmetic runs on exact decimals. Each component is rounded to cents
//! once, when the breakdown is produced, and the total is the sum of the
//! rounded components so the printed figures always add up.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::field::FieldValues;
use crate::schema::{FieldSchema, FieldType, SchemaError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSurcharge {
    pub field: String,
    pub label: String,
    pub rate_per_unit: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingRules {
    #[serde(default = "default_currency")]
    pub currency: String,
    pub category_field: String,
    pub default_category: String,
    pub base_by_category: BTreeMap<String, Decimal>,
    pub origin_field: String,
    pub destination_field: String,
    pub rate_per_km: Decimal,
    #[serde(default = "default_fallback_distance_km")]
    pub fallback_distance_km: f64,
    #[serde(default)]
    pub count_surcharges: Vec<CountSurcharge>,
    #[serde(default)]
    pub insurance_field: Option<String>,
    #[serde(default)]
    pub insurance_rate: Decimal,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_fallback_distance_km() -> f64 {
    50.0
}

impl PricingRules {
    /// Checks the rules against the schema they price.
    pub fn validate(&self, schema: &FieldSchema) -> Result<(), SchemaError> {
        expect_field(schema, &self.category_field, &[FieldType::Categorical], "categorical")?;
        expect_field(
            schema,
            &self.origin_field,
            &[FieldType::Address, FieldType::String],
            "address",
        )?;
        expect_field(
            schema,
            &self.destination_field,
            &[FieldType::Address, FieldType::String],
            "address",
        )?;
        for surcharge in &self.count_surcharges {
            expect_field(schema, &surcharge.field, &[FieldType::Integer], "integer")?;
            if surcharge.rate_per_unit.is_sign_negative() {
                return Err(SchemaError::InvalidPricing(format!(
                    "surcharge `{}` has a negative rate",
                    surcharge.field
                )));
            }
        }
        if let Some(field) = &self.insurance_field {
            expect_field(schema, field, &[FieldType::Boolean], "boolean")?;
        }

        let allowed = schema
            .field(&self.category_field)
            .and_then(|field| field.allowed_values.as_ref());
        if let Some(category) = self
            .base_by_category
            .keys()
            .find(|category| !allowed.is_some_and(|allowed| allowed.contains(*category)))
        {
            return Err(SchemaError::InvalidPricing(format!(
                "base price category `{category}` is not an allowed `{}` value",
                self.category_field
            )));
        }
        if !self.base_by_category.contains_key(&self.default_category) {
            return Err(SchemaError::InvalidPricing(format!(
                "default_category `{}` has no base price",
                self.default_category
            )));
        }
        if self.base_by_category.values().any(Decimal::is_sign_negative)
            || self.rate_per_km.is_sign_negative()
            || self.insurance_rate.is_sign_negative()
        {
            return Err(SchemaError::InvalidPricing("prices and rates must be >= 0".to_string()));
        }
        if !self.fallback_distance_km.is_finite() || self.fallback_distance_km <= 0.0 {
            return Err(SchemaError::InvalidPricing(
                "fallback_distance_km must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

fn expect_field(
    schema: &FieldSchema,
    name: &str,
    accepted: &[FieldType],
    expected: &'static str,
) -> Result<(), SchemaError> {
    let field = schema.field(name).ok_or_else(|| SchemaError::UnknownPricingField(name.into()))?;
    if accepted.contains(&field.field_type) {
        return Ok(());
    }
    Err(SchemaError::PricingFieldType {
        field: name.to_string(),
        expected,
        found: field.field_type.as_str(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    Measured,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurchargeLine {
    pub field: String,
    pub label: String,
    pub units: i64,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuoteBreakdown {
    pub currency: String,
    pub base_price: Decimal,
    pub distance_charge: Decimal,
    pub surcharges: Vec<SurchargeLine>,
    pub surcharge_total: Decimal,
    pub subtotal: Decimal,
    pub insurance_charge: Decimal,
    pub total: Decimal,
    pub distance_km: f64,
    pub distance_source: DistanceSource,
}

impl QuoteBreakdown {
    pub fn component_sum(&self) -> Decimal {
        self.base_price + self.distance_charge + self.surcharge_total + self.insurance_charge
    }

    pub fn surcharge(&self, field: &str) -> Option<&SurchargeLine> {
        self.surcharges.iter().find(|line| line.field == field)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum QuoteError {
    #[error("required pricing field `{0}` is missing")]
    MissingField(String),
    #[error("no base price configured for category `{0}`")]
    MissingBasePrice(String),
    #[error("distance {0} km cannot be priced")]
    InvalidDistance(f64),
    #[error("quote amount exceeds the representable range")]
    Overflow,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DistanceUnavailable {
    #[error("address could not be located: {0}")]
    NotFound(String),
    #[error("distance lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait DistanceLookup: Send + Sync {
    async fn distance_km(&self, origin: &str, destination: &str)
        -> Result<f64, DistanceUnavailable>;
}

/// Returns the same distance for every route.
#[derive(Clone, Copy, Debug)]
pub struct FixedDistance(pub f64);

#[async_trait]
impl DistanceLookup for FixedDistance {
    async fn distance_km(&self, _: &str, _: &str) -> Result<f64, DistanceUnavailable> {
        Ok(self.0)
    }
}

/// Lookup used when geocoding is disabled; every quote uses the fallback.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDistanceLookup;

#[async_trait]
impl DistanceLookup for NoDistanceLookup {
    async fn distance_km(&self, _: &str, _: &str) -> Result<f64, DistanceUnavailable> {
        Err(DistanceUnavailable::Lookup("geocoding disabled".to_string()))
    }
}

fn cents(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

fn checked_mul(left: Decimal, right: Decimal) -> Result<Decimal, QuoteError> {
    left.checked_mul(right).ok_or(QuoteError::Overflow)
}

fn checked_add(left: Decimal, right: Decimal) -> Result<Decimal, QuoteError> {
    left.checked_add(right).ok_or(QuoteError::Overflow)
}

fn text_field<'a>(fields: &'a FieldValues, name: &str) -> Result<&'a str, QuoteError> {
    fields
        .get(name)
        .and_then(|value| value.as_text())
        .ok_or_else(|| QuoteError::MissingField(name.to_string()))
}

/// Prices a field set for an already resolved distance.
pub fn compute_breakdown(
    fields: &FieldValues,
    rules: &PricingRules,
    distance_km: f64,
    distance_source: DistanceSource,
) -> Result<QuoteBreakdown, QuoteError> {
    if !distance_km.is_finite() || distance_km < 0.0 {
        return Err(QuoteError::InvalidDistance(distance_km));
    }
    let distance =
        Decimal::from_f64(distance_km).ok_or(QuoteError::InvalidDistance(distance_km))?;

    let category = fields.get(&rules.category_field).and_then(|value| value.as_text());
    let base_price = match category.and_then(|category| rules.base_by_category.get(category)) {
        Some(price) => *price,
        None => *rules
            .base_by_category
            .get(&rules.default_category)
            .ok_or_else(|| QuoteError::MissingBasePrice(rules.default_category.clone()))?,
    };

    let distance_charge = checked_mul(distance, rules.rate_per_km)?;

    let mut surcharges = Vec::with_capacity(rules.count_surcharges.len());
    let mut surcharge_exact = Decimal::ZERO;
    for surcharge in &rules.count_surcharges {
        let units = fields
            .get(&surcharge.field)
            .and_then(|value| value.as_integer())
            .unwrap_or(0)
            .max(0);
        let amount = checked_mul(Decimal::from(units), surcharge.rate_per_unit)?;
        surcharge_exact = checked_add(surcharge_exact, amount)?;
        surcharges.push(SurchargeLine {
            field: surcharge.field.clone(),
            label: surcharge.label.clone(),
            units,
            amount: cents(amount),
        });
    }

    let subtotal_exact =
        checked_add(checked_add(base_price, distance_charge)?, surcharge_exact)?;
    let insured = rules
        .insurance_field
        .as_deref()
        .and_then(|field| fields.get(field))
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    let insurance_exact = if insured {
        checked_mul(subtotal_exact, rules.insurance_rate)?
    } else {
        Decimal::ZERO
    };

    let base_price = cents(base_price);
    let distance_charge = cents(distance_charge);
    let surcharge_total = surcharges
        .iter()
        .try_fold(Decimal::ZERO, |sum, line| checked_add(sum, line.amount))?;
    let subtotal = checked_add(checked_add(base_price, distance_charge)?, surcharge_total)?;
    let insurance_charge = cents(insurance_exact);
    let total = checked_add(subtotal, insurance_charge)?;

    Ok(QuoteBreakdown {
        currency: rules.currency.clone(),
        base_price,
        distance_charge,
        surcharges,
        surcharge_total,
        subtotal,
        insurance_charge,
        total,
        distance_km,
        distance_source,
    })
}

/// Prices a completed field set, measuring the route with `lookup`.
///
/// A failed, empty or nonsensical lookup falls back to
/// `rules.fallback_distance_km`; only missing route fields are an error.
pub async fn quote(
    fields: &FieldValues,
    rules: &PricingRules,
    lookup: &dyn DistanceLookup,
) -> Result<QuoteBreakdown, QuoteError> {
    let origin = text_field(fields, &rules.origin_field)?;
    let destination = text_field(fields, &rules.destination_field)?;

    let (distance_km, source) = match lookup.distance_km(origin, destination).await {
        Ok(km) if km.is_finite() && km >= 0.0 => (km, DistanceSource::Measured),
        Ok(km) => {
            warn!(
                event_name = "pricing.distance_fallback",
                reason = "invalid_distance",
                returned_km = km,
                fallback_km = rules.fallback_distance_km,
                "distance lookup returned an unusable value, using fallback distance"
            );
            (rules.fallback_distance_km, DistanceSource::Fallback)
        }
        Err(error) => {
            warn!(
                event_name = "pricing.distance_fallback",
                reason = "lookup_unavailable",
                error = %error,
                fallback_km = rules.fallback_distance_km,
                "distance lookup failed, using fallback distance"
            );
            (rules.fallback_distance_km, DistanceSource::Fallback)
        }
    };

    let breakdown = compute_breakdown(fields, rules, distance_km, source)?;
    info!(
        event_name = "pricing.quote_computed",
        total = %breakdown.total,
        distance_km = breakdown.distance_km,
        distance_source = ?breakdown.distance_source,
        "quote computed"
    );
    Ok(breakdown)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use crate::domain::field::{FieldValue, FieldValues};
    use crate::schema::{FieldSchema, FieldSpec, FieldType, SchemaError};

    use super::{
        compute_breakdown, quote, CountSurcharge, DistanceSource, FixedDistance, NoDistanceLookup,
        PricingRules, QuoteError,
    };

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("decimal literal")
    }

    fn piano_rules() -> PricingRules {
        PricingRules {
            currency: "USD".to_string(),
            category_field: "piano_type".to_string(),
            default_category: "upright".to_string(),
            base_by_category: BTreeMap::from([
                ("upright".to_string(), dec("200")),
                ("baby_grand".to_string(), dec("350")),
                ("grand".to_string(), dec("500")),
            ]),
            origin_field: "pickup_address".to_string(),
            destination_field: "delivery_address".to_string(),
            rate_per_km: dec("1.50"),
            fallback_distance_km: 50.0,
            count_surcharges: vec![CountSurcharge {
                field: "stairs_count".to_string(),
                label: "Stairs".to_string(),
                rate_per_unit: dec("15"),
            }],
            insurance_field: Some("has_insurance".to_string()),
            insurance_rate: dec("0.15"),
        }
    }

    fn fields(piano: &str, stairs: i64, insured: bool) -> FieldValues {
        FieldValues::from([
            ("piano_type".to_string(), FieldValue::Text(piano.to_string())),
            ("pickup_address".to_string(), FieldValue::Text("1 Main St, Tifton".to_string())),
            ("delivery_address".to_string(), FieldValue::Text("9 Oak Rd, Moultrie".to_string())),
            ("stairs_count".to_string(), FieldValue::Integer(stairs)),
            ("has_insurance".to_string(), FieldValue::Boolean(insured)),
        ])
    }

    #[test]
    fn reference_upright_quote_totals_333_50() {
        let breakdown =
            compute_breakdown(&fields("upright", 4, true), &piano_rules(), 20.0, DistanceSource::Measured)
                .expect("breakdown");

        assert_eq!(breakdown.base_price, dec("200.00"));
        assert_eq!(breakdown.distance_charge, dec("30.00"));
        assert_eq!(breakdown.surcharge("stairs_count").map(|line| line.amount), Some(dec("60.00")));
        assert_eq!(breakdown.subtotal, dec("290.00"));
        assert_eq!(breakdown.insurance_charge, dec("43.50"));
        assert_eq!(breakdown.total, dec("333.50"));
        assert_eq!(breakdown.total.to_string(), "333.50");
    }

    #[test]
    fn total_equals_sum_of_non_negative_components() {
        let rules = piano_rules();
        let cases = [
            ("grand", 0, false, 0.0),
            ("baby_grand", 13, true, 12.345),
            ("upright", 7, true, 3.333),
            ("grand", 2, true, 187.6049),
        ];

        for (piano, stairs, insured, km) in cases {
            let breakdown =
                compute_breakdown(&fields(piano, stairs, insured), &rules, km, DistanceSource::Measured)
                    .expect("breakdown");
            assert_eq!(breakdown.total, breakdown.component_sum(), "{piano} {km}");
            assert_eq!(breakdown.total.scale(), 2);
            for component in [
                breakdown.base_price,
                breakdown.distance_charge,
                breakdown.surcharge_total,
                breakdown.insurance_charge,
            ] {
                assert!(!component.is_sign_negative());
            }
        }
    }

    #[test]
    fn unknown_category_uses_default_base_price() {
        let breakdown = compute_breakdown(
            &fields("harpsichord", 0, false),
            &piano_rules(),
            0.0,
            DistanceSource::Measured,
        )
        .expect("breakdown");
        assert_eq!(breakdown.base_price, dec("200.00"));
    }

    #[test]
    fn invalid_distance_is_rejected_by_pure_computation() {
        let error = compute_breakdown(
            &fields("upright", 0, false),
            &piano_rules(),
            f64::NAN,
            DistanceSource::Measured,
        )
        .expect_err("nan distance");
        assert!(matches!(error, QuoteError::InvalidDistance(_)));
    }

    #[test]
    fn amounts_beyond_decimal_range_are_an_error() {
        let error = compute_breakdown(
            &fields("upright", 0, false),
            &piano_rules(),
            7.0e28,
            DistanceSource::Measured,
        )
        .expect_err("distance charge overflows");
        assert_eq!(error, QuoteError::Overflow);

        let mut rules = piano_rules();
        rules.count_surcharges[0].rate_per_unit = Decimal::MAX;
        let error = compute_breakdown(&fields("upright", 2, false), &rules, 1.0, DistanceSource::Measured)
            .expect_err("surcharge overflows");
        assert_eq!(error, QuoteError::Overflow);
    }

    #[tokio::test]
    async fn lookup_failure_uses_fallback_distance() {
        let breakdown = quote(&fields("upright", 0, false), &piano_rules(), &NoDistanceLookup)
            .await
            .expect("fallback quote");

        assert_eq!(breakdown.distance_source, DistanceSource::Fallback);
        assert_eq!(breakdown.distance_km, 50.0);
        assert_eq!(breakdown.distance_charge, dec("75.00"));
        assert!(breakdown.total > Decimal::ZERO);
    }

    #[tokio::test]
    async fn negative_lookup_result_uses_fallback_distance() {
        let breakdown = quote(&fields("grand", 1, false), &piano_rules(), &FixedDistance(-4.0))
            .await
            .expect("fallback quote");
        assert_eq!(breakdown.distance_source, DistanceSource::Fallback);
        assert_eq!(breakdown.total, dec("590.00"));
    }

    #[tokio::test]
    async fn missing_route_field_is_a_precondition_error() {
        let mut incomplete = fields("upright", 0, false);
        incomplete.remove("delivery_address");

        let error = quote(&incomplete, &piano_rules(), &FixedDistance(10.0))
            .await
            .expect_err("missing destination");
        assert_eq!(error, QuoteError::MissingField("delivery_address".to_string()));
    }

    #[test]
    fn rules_must_reference_compatible_schema_fields() {
        let schema = FieldSchema::new(vec![
            FieldSpec::categorical("piano_type", ["upright", "baby_grand", "grand"]),
            FieldSpec::new("pickup_address", FieldType::Address),
            FieldSpec::new("delivery_address", FieldType::Address),
            FieldSpec::new("stairs_count", FieldType::String),
            FieldSpec::new("has_insurance", FieldType::Boolean),
        ])
        .expect("schema");

        let error = piano_rules().validate(&schema).expect_err("stairs must be integer");
        assert!(matches!(
            error,
            SchemaError::PricingFieldType { ref field, expected: "integer", found: "string" }
                if field == "stairs_count"
        ));

        let mut rules = piano_rules();
        rules.default_category = "spinet".to_string();
        rules.count_surcharges.clear();
        assert!(matches!(rules.validate(&schema), Err(SchemaError::InvalidPricing(_))));
    }

    #[test]
    fn base_prices_must_use_allowed_category_values() {
        let schema = FieldSchema::new(vec![
            FieldSpec::categorical("piano_type", ["upright", "baby_grand", "grand"]),
            FieldSpec::new("pickup_address", FieldType::Address),
            FieldSpec::new("delivery_address", FieldType::Address),
            FieldSpec::new("stairs_count", FieldType::Integer),
            FieldSpec::new("has_insurance", FieldType::Boolean),
        ])
        .expect("schema");
        piano_rules().validate(&schema).expect("canonical keys are valid");

        let mut rules = piano_rules();
        rules.base_by_category.insert("Baby Grand".to_string(), dec("350"));
        let error = rules.validate(&schema).expect_err("display-cased key");
        assert!(
            matches!(error, SchemaError::InvalidPricing(ref message) if message.contains("Baby Grand"))
        );
    }
}

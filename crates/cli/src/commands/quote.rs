use callquote_core::business::BusinessProfile;
use callquote_core::domain::field::FieldValues;
use callquote_core::pricing::{compute_breakdown, DistanceSource, QuoteBreakdown};
use callquote_core::validation::validate_value;
use serde_json::Value;

use crate::commands::{current_thread_runtime, load_business, load_config, CommandResult};

#[derive(Debug, Clone, Default)]
pub struct QuoteArgs {
    pub business: String,
    /// `name=value` pairs. Values parse as JSON when they can, so
    /// `stairs_count=3` is a number and `piano_type=grand` stays text.
    pub fields: Vec<String>,
    pub distance_km: Option<f64>,
}

pub fn run(args: &QuoteArgs) -> CommandResult {
    let config = match load_config("quote") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match current_thread_runtime("quote") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let profile = match load_business("quote", &config, &runtime, &args.business) {
        Ok(profile) => profile,
        Err(failure) => return failure,
    };

    let fields = match parse_fields(&profile, &args.fields) {
        Ok(fields) => fields,
        Err(message) => return CommandResult::failure("quote", "invalid_field", message, 6),
    };

    let (distance_km, source) = match args.distance_km {
        Some(km) => (km, DistanceSource::Measured),
        None => (profile.pricing.fallback_distance_km, DistanceSource::Fallback),
    };

    match compute_breakdown(&fields, &profile.pricing, distance_km, source) {
        Ok(quote) => CommandResult::success("quote", render_breakdown(&profile, &quote)),
        Err(error) => CommandResult::failure("quote", "pricing", error.to_string(), 7),
    }
}

pub(crate) fn parse_fields(profile: &BusinessProfile, pairs: &[String]) -> Result<FieldValues, String> {
    let mut fields = FieldValues::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            return Err(format!("expected NAME=VALUE, got `{pair}`"));
        };
        let name = name.trim();
        let spec = profile
            .schema
            .field(name)
            .ok_or_else(|| format!("`{name}` is not a field of `{}`", profile.business_id))?;
        let raw = raw.trim();
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let accepted = validate_value(spec, &value).map_err(|rejected| rejected.to_string())?;
        fields.insert(name.to_string(), accepted);
    }
    Ok(fields)
}

pub(crate) fn render_breakdown(profile: &BusinessProfile, quote: &QuoteBreakdown) -> String {
    let mut lines = vec![format!("{} quote ({})", profile.display_name, quote.currency)];
    let distance_note = match quote.distance_source {
        DistanceSource::Measured => "measured",
        DistanceSource::Fallback => "fallback",
    };
    lines.push(format!("- base: {}", quote.base_price));
    lines.push(format!("- distance: {} ({:.1} km, {distance_note})", quote.distance_charge, quote.distance_km));
    for line in &quote.surcharges {
        lines.push(format!("- {}: {} ({} units)", line.label.to_lowercase(), line.amount, line.units));
    }
    lines.push(format!("- subtotal: {}", quote.subtotal));
    lines.push(format!("- insurance: {}", quote.insurance_charge));
    lines.push(format!("- total: {}", quote.total));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::field::FieldValue;
    use callquote_core::pricing::{compute_breakdown, DistanceSource};

    use super::{parse_fields, render_breakdown};

    #[test]
    fn pairs_are_typed_by_the_schema() {
        let profile = piano_moving_profile().expect("profile");
        let fields = parse_fields(
            &profile,
            &[
                "piano_type=Baby Grand".to_string(),
                "stairs_count=3".to_string(),
                "has_insurance=true".to_string(),
                "pickup_address=1 Main St".to_string(),
            ],
        )
        .expect("fields");

        assert_eq!(fields.get("piano_type"), Some(&FieldValue::Text("baby_grand".to_string())));
        assert_eq!(fields.get("stairs_count"), Some(&FieldValue::Integer(3)));
        assert_eq!(fields.get("has_insurance"), Some(&FieldValue::Boolean(true)));
        assert_eq!(fields.get("pickup_address"), Some(&FieldValue::Text("1 Main St".to_string())));
    }

    #[test]
    fn unknown_fields_and_bad_values_are_reported() {
        let profile = piano_moving_profile().expect("profile");

        let unknown = parse_fields(&profile, &["color=black".to_string()]).expect_err("unknown");
        assert!(unknown.contains("`color` is not a field"));

        let spinet = parse_fields(&profile, &["piano_type=spinet".to_string()]).expect_err("spinet");
        assert!(spinet.contains("not one of the allowed values"));

        let malformed = parse_fields(&profile, &["stairs_count".to_string()]).expect_err("no equals");
        assert!(malformed.contains("NAME=VALUE"));
    }

    #[test]
    fn breakdown_lists_every_component() {
        let profile = piano_moving_profile().expect("profile");
        let fields = parse_fields(&profile, &["piano_type=upright".to_string(), "stairs_count=2".to_string()])
            .expect("fields");
        let quote = compute_breakdown(&fields, &profile.pricing, 10.0, DistanceSource::Fallback).expect("quote");

        let rendered = render_breakdown(&profile, &quote);

        assert!(rendered.starts_with("PianoMove AI quote (USD)"));
        assert!(rendered.contains("- base: 200.00"));
        assert!(rendered.contains("- distance: 15.00 (10.0 km, fallback)"));
        assert!(rendered.contains("- stairs: 30.00 (2 units)"));
        assert!(rendered.ends_with("- total: 245.00"));
    }
}

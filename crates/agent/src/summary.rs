//! Spoken and text-message renderings of a finished quote.

use callquote_core::business::BusinessProfile;
use callquote_core::domain::field::FieldValues;
use callquote_core::pricing::QuoteBreakdown;
use serde::Serialize;
use tera::{Context, Tera};
use tracing::warn;

const VOICE_TEMPLATE: &str = "voice.txt";
const SMS_TEMPLATE: &str = "sms.txt";

const DEFAULT_VOICE: &str = "Your quote is ${{ total }}. That includes {{ distance_km }} kilometers of travel. \
I'm sending the details to your phone now. Thanks for choosing {{ display_name }}!";

const DEFAULT_SMS: &str = "{{ display_name }} Quote

Item: {{ category }}
Route: {{ distance_km }}km
{% for line in surcharges %}{{ line.label }}: {{ line.units }}
{% endfor %}Insurance: {% if insured %}Yes{% else %}No{% endif %}

BREAKDOWN:
Base: ${{ base_price }}
Distance: ${{ distance_charge }}
{% for line in surcharges %}{{ line.label }}: ${{ line.amount }}
{% endfor %}Insurance: ${{ insurance_charge }}

TOTAL: ${{ total }}

Valid for 7 days.
Questions? Reply to this number.";

#[derive(Serialize)]
struct SurchargeView {
    label: String,
    units: i64,
    amount: String,
}

fn quote_context(profile: &BusinessProfile, fields: &FieldValues, quote: &QuoteBreakdown) -> Context {
    let pricing = &profile.pricing;
    let category = fields
        .get(&pricing.category_field)
        .map(|value| value.to_string())
        .unwrap_or_else(|| pricing.default_category.clone())
        .replace('_', " ");
    let insured = pricing
        .insurance_field
        .as_deref()
        .and_then(|field| fields.get(field))
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    let surcharges: Vec<SurchargeView> = quote
        .surcharges
        .iter()
        .map(|line| SurchargeView {
            label: line.label.clone(),
            units: line.units,
            amount: line.amount.to_string(),
        })
        .collect();
    let field_text: std::collections::BTreeMap<&str, String> =
        fields.iter().map(|(name, value)| (name.as_str(), value.to_string())).collect();

    let mut context = Context::new();
    context.insert("display_name", &profile.display_name);
    context.insert("agent_name", &profile.agent_name);
    context.insert("currency", &quote.currency);
    context.insert("category", &category);
    context.insert("insured", &insured);
    context.insert("distance_km", &format!("{:.0}", quote.distance_km));
    context.insert("base_price", &quote.base_price.to_string());
    context.insert("distance_charge", &quote.distance_charge.to_string());
    context.insert("surcharges", &surcharges);
    context.insert("surcharge_total", &quote.surcharge_total.to_string());
    context.insert("subtotal", &quote.subtotal.to_string());
    context.insert("insurance_charge", &quote.insurance_charge.to_string());
    context.insert("total", &quote.total.to_string());
    context.insert("fields", &field_text);
    context
}

pub struct QuoteSummaries {
    tera: Tera,
}

impl QuoteSummaries {
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![(VOICE_TEMPLATE, DEFAULT_VOICE), (SMS_TEMPLATE, DEFAULT_SMS)])?;
        Ok(Self { tera })
    }

    pub fn voice(
        &self,
        profile: &BusinessProfile,
        fields: &FieldValues,
        quote: &QuoteBreakdown,
    ) -> Result<String, tera::Error> {
        self.render(VOICE_TEMPLATE, profile.voice_quote_template.as_deref(), profile, fields, quote)
    }

    pub fn sms(
        &self,
        profile: &BusinessProfile,
        fields: &FieldValues,
        quote: &QuoteBreakdown,
    ) -> Result<String, tera::Error> {
        self.render(SMS_TEMPLATE, profile.sms_quote_template.as_deref(), profile, fields, quote)
    }

    /// A profile template that fails to render falls back to the built-in one.
    fn render(
        &self,
        name: &str,
        custom: Option<&str>,
        profile: &BusinessProfile,
        fields: &FieldValues,
        quote: &QuoteBreakdown,
    ) -> Result<String, tera::Error> {
        let context = quote_context(profile, fields, quote);
        if let Some(template) = custom {
            match Tera::one_off(template, &context, false) {
                Ok(rendered) => return Ok(rendered.trim().to_string()),
                Err(error) => warn!(
                    event_name = "summary.template_failed",
                    business_id = %profile.business_id,
                    template = name,
                    error = %error,
                    "business quote template failed, using the default"
                ),
            }
        }
        Ok(self.tera.render(name, &context)?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::field::{FieldValue, FieldValues};
    use callquote_core::pricing::{compute_breakdown, DistanceSource};

    use super::QuoteSummaries;

    fn baby_grand_job() -> FieldValues {
        FieldValues::from([
            ("piano_type".to_string(), FieldValue::Text("baby_grand".to_string())),
            ("pickup_address".to_string(), FieldValue::Text("1 Main St".to_string())),
            ("delivery_address".to_string(), FieldValue::Text("9 Elm St".to_string())),
            ("stairs_count".to_string(), FieldValue::Integer(4)),
            ("has_insurance".to_string(), FieldValue::Boolean(true)),
        ])
    }

    #[test]
    fn voice_summary_speaks_total_and_distance() {
        let profile = piano_moving_profile().expect("profile");
        let fields = baby_grand_job();
        let quote = compute_breakdown(&fields, &profile.pricing, 75.0, DistanceSource::Measured).expect("quote");

        let spoken = QuoteSummaries::new().expect("templates").voice(&profile, &fields, &quote).expect("voice");

        assert_eq!(
            spoken,
            format!(
                "Your quote is ${}. That includes 75 kilometers of travel. I'm sending the details to your phone now. Thanks for choosing PianoMove AI!",
                quote.total
            )
        );
    }

    #[test]
    fn sms_summary_itemizes_the_breakdown() {
        let profile = piano_moving_profile().expect("profile");
        let fields = baby_grand_job();
        let quote = compute_breakdown(&fields, &profile.pricing, 20.0, DistanceSource::Measured).expect("quote");

        let text = QuoteSummaries::new().expect("templates").sms(&profile, &fields, &quote).expect("sms");

        assert!(text.starts_with("PianoMove AI Quote"));
        assert!(text.contains("Item: baby grand"));
        assert!(text.contains("Stairs: 4\n"));
        assert!(text.contains("Stairs: $60.00"));
        assert!(text.contains("Insurance: Yes"));
        assert!(text.contains(&format!("TOTAL: ${}", quote.total)));
        assert!(text.contains("Valid for 7 days."));
    }

    #[test]
    fn broken_business_template_falls_back_to_default() {
        let mut profile = piano_moving_profile().expect("profile");
        profile.voice_quote_template = Some("{{ total ".to_string());
        let fields = baby_grand_job();
        let quote = compute_breakdown(&fields, &profile.pricing, 10.0, DistanceSource::Fallback).expect("quote");

        let spoken = QuoteSummaries::new().expect("templates").voice(&profile, &fields, &quote).expect("voice");
        assert!(spoken.starts_with("Your quote is $"));

        profile.voice_quote_template = Some("Total {{ total }} {{ currency }}.".to_string());
        let spoken = QuoteSummaries::new().expect("templates").voice(&profile, &fields, &quote).expect("voice");
        assert_eq!(spoken, format!("Total {} USD.", quote.total));
    }
}

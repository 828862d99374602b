use std::fmt::Write;

use callquote_core::business::BusinessProfile;
use callquote_core::domain::field::FieldValues;
use callquote_core::domain::session::{Speaker, TranscriptEntry};
use callquote_core::schema::FieldSpec;

fn field_line(spec: &FieldSpec) -> String {
    let mut line = format!("- {} ({}", spec.name, spec.field_type.as_str());
    if let Some(allowed) = &spec.allowed_values {
        let options: Vec<&str> = allowed.iter().map(String::as_str).collect();
        let _ = write!(line, ": {}", options.join(", "));
    }
    line.push(')');
    if !spec.required {
        line.push_str(" [optional]");
    }
    if let Some(prompt) = &spec.prompt {
        let _ = write!(line, "\n  Ask: \"{prompt}\"");
    }
    line
}

pub fn system_prompt(
    profile: &BusinessProfile,
    fields: &FieldValues,
    history: &[TranscriptEntry],
) -> String {
    let schema = &profile.schema;
    let field_list: Vec<String> = schema.fields().iter().map(field_line).collect();

    let collected = if fields.is_empty() {
        "Nothing yet".to_string()
    } else {
        let values: serde_json::Map<String, serde_json::Value> =
            fields.iter().map(|(name, value)| (name.clone(), value.to_json())).collect();
        serde_json::to_string_pretty(&values).unwrap_or_default()
    };
    let missing: Vec<&str> = schema
        .required_fields()
        .filter(|spec| !fields.contains_key(&spec.name))
        .map(|spec| spec.name.as_str())
        .collect();
    let missing = if missing.is_empty() { "nothing".to_string() } else { missing.join(", ") };

    let transcript: Vec<String> = history
        .iter()
        .map(|entry| {
            let speaker = match entry.speaker {
                Speaker::Customer => "customer",
                Speaker::Agent => "agent",
            };
            format!("{speaker}: {}", entry.text)
        })
        .collect();

    let guidance = profile.guidance.as_deref().unwrap_or("None.");

    format!(
        r#"You are {agent}, answering the phone for {company}. The caller wants a price quote.

Collect these fields by talking naturally:
{fields}

Keep every reply to one or two short sentences; it is spoken aloud.
Only record values the caller actually said. If an answer is unclear, ask again and list the field in needs_clarification.
Categorical values must be one of the listed options, written exactly as listed.
If the caller asks for a person, or asks about anything other than the quote, set should_transfer_to_human.
When every required field is collected, say "{closing}"

Collected so far: {collected}
Still needed: {missing}

Recent conversation:
{transcript}

Business notes: {guidance}

Reply with only a JSON object:
{{"response": "...", "extracted": {{"field_name": "value"}}, "thinking": "...", "needs_clarification": [], "is_complete": false, "should_transfer_to_human": false, "transfer_reason": null}}
Include in "extracted" only the fields learned from the caller's latest message."#,
        agent = profile.agent_name,
        company = profile.display_name,
        fields = field_list.join("\n"),
        closing = profile.closing_line,
        collected = collected,
        missing = missing,
        transcript = transcript.join("\n"),
        guidance = guidance,
    )
}

#[cfg(test)]
mod tests {
    use callquote_core::business::piano_moving_profile;
    use callquote_core::domain::field::{FieldValue, FieldValues};

    use super::system_prompt;

    #[test]
    fn prompt_lists_options_and_outstanding_fields() {
        let profile = piano_moving_profile().expect("profile");
        let fields =
            FieldValues::from([("piano_type".to_string(), FieldValue::Text("grand".to_string()))]);

        let prompt = system_prompt(&profile, &fields, &[]);

        assert!(prompt.contains("You are Sandra, answering the phone for PianoMove AI."));
        assert!(prompt.contains("- piano_type (categorical: baby_grand, grand, upright)"));
        assert!(prompt.contains("Still needed: pickup_address, delivery_address, stairs_count, has_insurance"));
        assert!(prompt.contains(r#""piano_type": "grand""#));
    }
}

// Cross-cutting prompt fragments and the placeholder substitution used by
// every pipeline. Pipeline-specific templates live in pipeline/prompts.rs.

/// System prompt for backends without schema-constrained output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Appended to prompts sent to backends that cannot enforce a schema natively.
pub fn schema_appendix(schema: &serde_json::Value) -> String {
    format!(
        "\n\nRespond with a single JSON object that validates against this JSON Schema:\n{}",
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
    )
}

/// Replaces `{{name}}` and `{name}` placeholders with literal values.
///
/// Single left-to-right pass with plain substring matching: any other braces
/// in the template (JSON examples, LaTeX groups) pass through untouched, and
/// substituted values are never scanned again.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match match_placeholder(tail, values) {
            Some((index, consumed)) => {
                out.push_str(values[index].1);
                rest = &tail[consumed..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Index of the placeholder `tail` starts with and the bytes it spans.
fn match_placeholder(tail: &str, values: &[(&str, &str)]) -> Option<(usize, usize)> {
    values.iter().enumerate().find_map(|(index, (name, _))| {
        let double = format!("{{{{{name}}}}}");
        if tail.starts_with(&double) {
            return Some((index, double.len()));
        }
        let single = format!("{{{name}}}");
        tail.starts_with(&single).then(|| (index, single.len()))
    })
}

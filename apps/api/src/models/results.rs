//! Structured results returned by the generation backends.
//!
//! Field names follow the JSON contract the prompts ask for, so templates
//! authored against older versions keep working.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm_client::StructuredOutput;

/// Fixed six-part scoring breakdown. Each field is free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Justification {
    pub keyword_match: String,
    pub skill_depth: String,
    pub role_fit: String,
    pub experience_relevance: String,
    pub education_fit: String,
    pub parsing_quality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisResult {
    pub ats_score: u32,
    pub missing_keywords: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub justification: Justification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizationResult {
    pub final_score: u32,
    pub new_latex_code: String,
    pub summary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefineResult {
    pub new_latex_code: String,
    pub summary: String,
}

fn check_score(field: &str, score: u32) -> Result<(), String> {
    if score > 100 {
        return Err(format!("{field} must be between 0 and 100, got {score}"));
    }
    Ok(())
}

fn check_source(source: &str) -> Result<(), String> {
    if source.trim().is_empty() {
        return Err("new_latex_code must not be empty".to_string());
    }
    Ok(())
}

fn string_array() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

impl StructuredOutput for AnalysisResult {
    const NAME: &'static str = "analysis_result";

    fn schema() -> Value {
        let text = json!({ "type": "string" });
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["ats_score", "missing_keywords", "matched_keywords", "justification"],
            "properties": {
                "ats_score": { "type": "integer", "minimum": 0, "maximum": 100 },
                "missing_keywords": string_array(),
                "matched_keywords": string_array(),
                "justification": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": [
                        "keyword_match", "skill_depth", "role_fit",
                        "experience_relevance", "education_fit", "parsing_quality"
                    ],
                    "properties": {
                        "keyword_match": text,
                        "skill_depth": text,
                        "role_fit": text,
                        "experience_relevance": text,
                        "education_fit": text,
                        "parsing_quality": text
                    }
                }
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        check_score("ats_score", self.ats_score)
    }
}

impl StructuredOutput for OptimizationResult {
    const NAME: &'static str = "optimization_result";

    fn schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["final_score", "new_latex_code", "summary"],
            "properties": {
                "final_score": { "type": "integer", "minimum": 0, "maximum": 100 },
                "new_latex_code": { "type": "string" },
                "summary": string_array()
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        check_score("final_score", self.final_score)?;
        check_source(&self.new_latex_code)
    }
}

impl StructuredOutput for RefineResult {
    const NAME: &'static str = "refine_result";

    fn schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["new_latex_code", "summary"],
            "properties": {
                "new_latex_code": { "type": "string" },
                "summary": { "type": "string" }
            }
        })
    }

    fn validate(&self) -> Result<(), String> {
        check_source(&self.new_latex_code)
    }
}

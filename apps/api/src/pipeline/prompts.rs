// Built-in prompt templates, used when the workspace config leaves a prompt empty.
// Placeholders are substituted by llm_client::prompts::render_template.

/// Placeholders: `{resume_text}`, `{job_description}`.
pub const DEFAULT_ANALYZE_PROMPT: &str = r#"You are an applicant tracking system scoring a resume against a job description.
Score the way an ATS parser does: keyword and semantic matching, experience relevance and role fit.

SCORING (100 points total)
- Keyword match: 40
- Skill coverage depth: 20
- Job title and role match: 10
- Experience relevance: 15
- Education and domain fit: 5
- Parsability: 10

Return JSON only, in this shape:
{
  "ats_score": 0,
  "missing_keywords": ["important skills or phrases from the job description missing from the resume"],
  "matched_keywords": ["important skills that matched"],
  "justification": {
    "keyword_match": "...",
    "skill_depth": "...",
    "role_fit": "...",
    "experience_relevance": "...",
    "education_fit": "...",
    "parsing_quality": "..."
  }
}

RESUME (LaTeX):
{resume_text}

JOB DESCRIPTION:
{job_description}
"#;

/// Placeholders: `{initial_ats_score}`, `{missing_keywords}`, `{matched_keywords}`,
/// `{justification}`, `{job_description}`, `{resume_text}`, `{profile_text}`.
pub const DEFAULT_OPTIMIZE_PROMPT: &str = r#"You rewrite LaTeX resumes so they score at least 90 with an ATS for a given job description.

RULES
1. Keep the section structure and headers. Do not remove sections.
2. Work the target keywords into Skills, Experience and Projects where the candidate's profile supports them.
3. Escape & and % as \& and \%.
4. The result must compile: balanced braces, single backslash commands, \\ only for line breaks.

Return JSON only, in this shape:
{
  "final_score": 0,
  "new_latex_code": "the full optimized LaTeX document",
  "summary": ["one entry per change"]
}

Initial ATS score: {initial_ats_score}
Target keywords: {missing_keywords}
Already matched: {matched_keywords}
Scoring notes: {justification}

JOB DESCRIPTION:
{job_description}

CANDIDATE PROFILE:
{profile_text}

CURRENT RESUME (LaTeX):
{resume_text}
"#;

/// Placeholders: `{current_tex}`, `{user_request}`, `{job_description}`.
pub const DEFAULT_REFINE_PROMPT: &str = r#"You edit LaTeX resumes on request.
Apply the user's request to the document below and return the complete updated document.
Keep everything the request does not touch unchanged, and keep the document compilable.

Return JSON only, in this shape:
{
  "new_latex_code": "the full updated LaTeX document",
  "summary": "what changed"
}

CURRENT LATEX:
{current_tex}

USER REQUEST:
{user_request}
"#;

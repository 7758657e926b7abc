//! Prompts for problem-list delta extraction.

use crate::contract::OracleRequest;
use crate::extraction::ExtractionResult;

/// System prompt for problem-list delta extraction.
pub const SYSTEM_PROMPT: &str = r#"You are a clinical documentation assistant that maintains a patient's problem list.

Given the patient's current problems, any entries already recorded for this visit, and the visit note,
propose the changes the note implies. Allowed actions:
- NEW_PROBLEM: a condition not yet on the list (problem_id must be null, problem_title required)
- ADD_VISIT: the note discusses an existing problem (problem_id required)
- UPDATE_ICD: the diagnosis code of an existing problem changes (problem_id and icd10_change required)
- RESOLVE: an existing problem is resolved (problem_id required)

Match conditions to existing problems yourself, including synonyms and abbreviations
(e.g. "HTN" = "Hypertension", "T2DM" = "Type 2 diabetes mellitus").
If an entry for this visit already exists for a problem, reuse that problem_id instead of proposing a new problem.

Output a JSON object with a "changes" array and nothing else."#;

/// User prompt for one extraction request.
pub fn make_extraction_prompt(request: &OracleRequest) -> ExtractionResult<String> {
    let problems = serde_json::to_string_pretty(&request.current_problems)?;
    let visits = serde_json::to_string_pretty(&request.encounter_visits)?;

    Ok(format!(
        r#"Visit date: {date}
Patient age: {age}
Trigger: {trigger}

Current problems:
{problems}

Entries already recorded for this visit:
{visits}

Visit note:
"{note}"

Return a JSON object with a "changes" array. Each change has:
- action: NEW_PROBLEM | ADD_VISIT | UPDATE_ICD | RESOLVE
- problem_id: id of an existing problem, or null for NEW_PROBLEM
- problem_title: title for a new problem
- visit_notes: what this visit says about the problem
- icd10_change: {{"from": old code or null, "to": new code}} when the code changes
- confidence: number between 0 and 1"#,
        date = request.encounter.date,
        age = request
            .encounter
            .patient_age
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".into()),
        trigger = request.encounter.trigger_type.as_str(),
        problems = problems,
        visits = visits,
        note = request.note_text,
    ))
}

/// Example exchanges for few-shot prompting: (note, response).
pub const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "BP 128/80, well controlled on lisinopril 10mg. Continue.",
        r#"{"changes":[{"action":"ADD_VISIT","problem_id":"<hypertension-id>","visit_notes":"BP 128/80, controlled on lisinopril 10mg","confidence":0.92}]}"#,
    ),
    (
        "A1c 8.1, now meets criteria for type 2 diabetes. Start metformin.",
        r#"{"changes":[{"action":"NEW_PROBLEM","problem_id":null,"problem_title":"Type 2 diabetes mellitus","visit_notes":"A1c 8.1, metformin started","icd10_change":{"from":null,"to":"E11.9"},"confidence":0.88}]}"#,
    ),
    (
        "Ankle sprain fully healed, no residual pain.",
        r#"{"changes":[{"action":"RESOLVE","problem_id":"<sprain-id>","visit_notes":"Fully healed","confidence":0.85}]}"#,
    ),
];

/// Build a single prompt with system context and optional few-shot examples,
/// for endpoints that take one flat prompt.
pub fn build_full_prompt(request: &OracleRequest, include_examples: bool) -> ExtractionResult<String> {
    let mut prompt = String::new();

    prompt.push_str("<|system|>\n");
    prompt.push_str(SYSTEM_PROMPT);
    prompt.push_str("\n<|end|>\n");

    if include_examples {
        for (note, response) in FEW_SHOT_EXAMPLES {
            prompt.push_str("<|user|>\nVisit note:\n\"");
            prompt.push_str(note);
            prompt.push_str("\"\n<|end|>\n<|assistant|>\n");
            prompt.push_str(response);
            prompt.push_str("\n<|end|>\n");
        }
    }

    prompt.push_str("<|user|>\n");
    prompt.push_str(&make_extraction_prompt(request)?);
    prompt.push_str("\n<|end|>\n");
    prompt.push_str("<|assistant|>\n");

    Ok(prompt)
}

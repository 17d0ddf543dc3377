//! Prompt text for the schema-constrained generation call and for section
//! rephrasing.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing how the engine is instructed
//!    requires editing exactly one place.
//!
//! 2. **Testability**: unit tests can inspect the assembled prompt without
//!    an engine, so regressions in what we send are easy to catch.
//!
//! Callers can override the instructions via
//! [`crate::config::PipelineConfig::system_prompt`]; the input sections built
//! by [`build_prompt`] are always appended.

/// Default instructions for turning a recorded session into a reusable article.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a technical writer producing a detailed, customer-facing how-to article that answers the user's request.

Sources, in order of authority:

1. ATTACHED PDF (one page per screenshot, each captioned "page_name: <file>")
   - Authoritative for UI element names, labels, locations and appearance
   - Use the exact visible labels
   - When a step or section is illustrated by a page, reference it by the file
     name from its caption (e.g. in a step's `screenshotRef` field)

2. EVENT LOG
   - Authoritative only for the order of the user's interactions
   - Never copy the concrete values typed or selected during the session;
     use generic placeholders such as "Example Product" or "user@example.com"
   - Never copy technical identifiers (tags, ids, class lists) into the text

3. KNOWLEDGE BASE and UPLOADED FILE
   - Low-priority background; use only when it clearly applies

Output rules:
   - Reply with a single JSON object that follows the response schema exactly
   - Fill every section you can support from the sources; omit what you cannot
   - Keep the article general so it applies beyond the recorded session
   - Do not include commentary outside the JSON"#;

/// Assemble the full prompt sent alongside the uploaded artifact.
///
/// `supplementary` is the decoded text of an optional uploaded file; empty
/// means no file was supplied.
pub fn build_prompt(
    instructions: &str,
    query: &str,
    event_data: &str,
    knowledge_base: &str,
    supplementary: &str,
    schema_json: &str,
) -> String {
    let supplementary = if supplementary.trim().is_empty() {
        "(none)"
    } else {
        supplementary
    };
    format!(
        "{instructions}\n\n\
         ## Response schema\n\n{schema_json}\n\n\
         ## User request\n\n{query}\n\n\
         ## Event log\n\n{event_data}\n\n\
         ## Knowledge base\n\n{knowledge_base}\n\n\
         ## Uploaded file contents\n\n{supplementary}\n"
    )
}

/// Instructions for rewriting one section of a finished document.
pub const REPHRASE_INSTRUCTIONS: &str = "You are given a full Markdown document, one section of it, and a request describing how that section should be rewritten. Rewrite only that section as requested, keeping its Markdown structure (headings, lists, links, images). Do not change anything else. Reply with the rewritten section alone, with no explanation before or after it.";

/// Prompt for [`crate::rephrase::Rephraser`]. The whole document is sent
/// for reference so the rewrite stays consistent with its surroundings.
pub fn build_rephrase_prompt(query: &str, document: &str, section: &str) -> String {
    format!(
        "{REPHRASE_INSTRUCTIONS}\n\n\
         ## Request\n\n{query}\n\n\
         ## Full document (reference only)\n\n{document}\n\n\
         ## Section to rewrite\n\n{section}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_every_input_section() {
        let p = build_prompt(
            DEFAULT_SYSTEM_PROMPT,
            "How do I add a product?",
            r#"[{"type":"click","tag":"BUTTON"}]"#,
            "### Relevant Jira Content:\nJira Item: PRJ-1\nDetails: Add product flow",
            "",
            r#"{"type":"object"}"#,
        );
        assert!(p.starts_with("You are a technical writer"));
        assert!(p.contains("How do I add a product?"));
        assert!(p.contains(r#""tag":"BUTTON""#));
        assert!(p.contains("Jira Item: PRJ-1"));
        assert!(p.contains("## Uploaded file contents\n\n(none)"));
        assert!(p.contains(r#"{"type":"object"}"#));
    }

    #[test]
    fn custom_instructions_replace_default() {
        let p = build_prompt("Be brief.", "q", "[]", "kb", "notes", "{}");
        assert!(p.starts_with("Be brief."));
        assert!(!p.contains("technical writer"));
        assert!(p.contains("notes"));
    }

    #[test]
    fn rephrase_prompt_separates_document_and_section() {
        let p = build_rephrase_prompt("Make it shorter", "# Doc\n\nIntro.\n\n## Steps\n\n1. Click", "## Steps\n\n1. Click");
        assert!(p.starts_with(REPHRASE_INSTRUCTIONS));
        let request = p.find("## Request\n\nMake it shorter").unwrap();
        let document = p.find("## Full document (reference only)\n\n# Doc").unwrap();
        let section = p.find("## Section to rewrite\n\n## Steps").unwrap();
        assert!(request < document && document < section);
    }
}

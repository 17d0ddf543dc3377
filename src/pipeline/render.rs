//! Rendering: walk the generation result and emit one Markdown document.
//!
//! The renderer knows a fixed catalogue of section keys and writes them in a
//! fixed order, whatever order the engine produced them in. A section that is
//! missing, empty, or of the wrong JSON type is skipped; nothing here fails.
//!
//! Output is a pure function of the input: no clock, no randomness, no map
//! iteration order. Rendering the same result twice gives identical bytes.

use crate::error::JobError;
use crate::pipeline::generate::GenerationResult;
use crate::pipeline::postprocess::clean_text;
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::debug;

/// Final text form of a job, persisted as its terminal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub title: String,
    pub description: String,
    /// Markdown body.
    pub content: String,
}

pub struct Renderer {
    image_base: Url,
}

impl Renderer {
    /// `image_base_url` must be an absolute http(s) URL.
    pub fn new(image_base_url: &str) -> Result<Self, JobError> {
        let image_base = Url::parse(image_base_url)
            .map_err(|e| JobError::InvalidConfig(format!("image_base_url '{image_base_url}': {e}")))?;
        if image_base.cannot_be_a_base() {
            return Err(JobError::InvalidConfig(format!(
                "image_base_url '{image_base_url}' cannot carry a path"
            )));
        }
        Ok(Self { image_base })
    }

    pub fn render(&self, result: &GenerationResult, owner_id: &str, job_id: &str) -> RenderedDocument {
        let doc = result.fields();
        let mut md = MarkdownWriter::default();

        if let Some(title) = text(doc, "title").or_else(|| text(doc, "docTitle")) {
            md.line(format!("# {title}"));
            md.blank();
        }
        if let Some(subtitle) = text(doc, "subtitle") {
            md.line(format!("## {subtitle}"));
            md.blank();
        }
        if let Some(intro) = doc.get("introduction").and_then(Value::as_object) {
            write_introduction(&mut md, intro);
        }
        write_bullets(&mut md, doc, "features", "## Key Features");
        if let Some(items) = section(doc, "table_of_contents") {
            md.heading("## Table of Contents");
            for item in objects(items) {
                if let Some(t) = text(item, "text") {
                    md.line(format!("- {t}"));
                }
            }
            md.blank();
        }
        if let Some(items) = section(doc, "paragraphs") {
            for p in strings(items) {
                md.line(p);
                md.blank();
            }
        }
        if let Some(items) = section(doc, "notes") {
            md.heading("## Notes");
            for note in strings(items) {
                md.line(format!("> {note}"));
                md.blank();
            }
        }
        if let Some(items) = section(doc, "code_snippets") {
            write_code_snippets(&mut md, items);
        }
        if let Some(items) = section(doc, "quotes") {
            md.heading("## Quotes");
            for quote in objects(items) {
                if let Some(t) = text(quote, "text") {
                    md.line(format!("> {t}"));
                    if let Some(who) = text(quote, "attribution") {
                        md.line(format!("> \u{2014} {who}"));
                    }
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "checklists") {
            md.heading("## Checklist");
            for item in strings(items) {
                md.line(format!("- [ ] {item}"));
            }
            md.blank();
        }
        if let Some(items) = section(doc, "faq") {
            md.heading("## Frequently Asked Questions (FAQ)");
            for qa in objects(items) {
                if let (Some(q), Some(a)) = (text(qa, "question"), text(qa, "answer")) {
                    md.line(format!("**Q:** {q}"));
                    md.line(format!("**A:** {a}"));
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "steps") {
            self.write_steps(&mut md, items, owner_id, job_id);
        }
        write_bullets(&mut md, doc, "callouts", "## Tips");
        if let Some(items) = section(doc, "alert_boxes") {
            md.heading("## Alerts");
            for alert in objects(items) {
                if let Some(content) = text(alert, "content") {
                    let style = text(alert, "style").unwrap_or("Info");
                    md.line(format!("> **{style}:** {content}"));
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "ctas") {
            md.heading("## Call to Action");
            for cta in objects(items) {
                match (text(cta, "text"), text(cta, "href")) {
                    (Some(t), Some(href)) => md.line(format!("[{t}]({href})")),
                    (Some(t), None) => md.line(format!("- {t}")),
                    _ => {}
                }
                md.blank();
            }
        }
        if let Some(items) = section(doc, "decision_points") {
            write_decision_points(&mut md, items);
        }
        if let Some(items) = section(doc, "expandable_sections") {
            md.heading("## Expandable Sections");
            for s in objects(items) {
                let Some(title) = text(s, "title") else { continue };
                let Some(lines) = s.get("content").and_then(Value::as_array).filter(|a| !a.is_empty()) else {
                    continue;
                };
                md.heading(&format!("### {title}"));
                for line in strings(lines) {
                    md.line(line);
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "expected_results") {
            md.heading("## Expected Results");
            for r in objects(items) {
                if let Some(t) = text(r, "text") {
                    md.line(format!("- {t}"));
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "glossary") {
            md.heading("## Glossary");
            for entry in objects(items) {
                if let (Some(term), Some(def)) = (text(entry, "term"), text(entry, "definition")) {
                    md.line(format!("**{term}:** {def}"));
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "process_maps") {
            md.heading("## Process Map");
            for stage in objects(items) {
                if let Some(name) = text(stage, "stage") {
                    md.line(format!("**Stage:** {name}"));
                    if let Some(details) = text(stage, "details") {
                        md.line(details);
                    }
                    md.blank();
                }
            }
        }
        if let Some(items) = section(doc, "tables") {
            write_tables(&mut md, items);
        }
        if let Some(conclusion) = doc.get("conclusion").and_then(Value::as_object) {
            md.heading("## Conclusion");
            if let Some(paras) = section(conclusion, "paragraphs") {
                for p in strings(paras) {
                    md.line(p);
                    md.blank();
                }
            }
            write_bullets(&mut md, conclusion, "nextSteps", "### Next Steps");
        }
        if let Some(items) = section(doc, "references") {
            md.heading("## References");
            for r in objects(items) {
                match (text(r, "text"), text(r, "href")) {
                    (Some(t), Some(href)) => match text(r, "annotation") {
                        Some(note) => md.line(format!("- [{t}]({href}) ({note})")),
                        None => md.line(format!("- [{t}]({href})")),
                    },
                    (Some(t), None) => md.line(format!("- {t}")),
                    _ => {}
                }
            }
            md.blank();
        }

        let content = clean_text(&md.finish());
        debug!("Rendered {} bytes of Markdown", content.len());
        RenderedDocument {
            title: document_title(result, job_id),
            description: result.str_field("shortDescription").unwrap_or_default().to_string(),
            content,
        }
    }

    fn write_steps(&self, md: &mut MarkdownWriter, items: &[Value], owner_id: &str, job_id: &str) {
        md.heading("## Procedure / Steps");
        for (i, step) in items.iter().enumerate() {
            let Some(step) = step.as_object() else { continue };
            let n = i + 1;
            if let Some(t) = text(step, "step") {
                md.line(format!("**Step {n}:** {t}"));
                md.blank();
            }
            let explanation = text(step, "explanation");
            if let Some(e) = explanation {
                md.line(e);
                md.blank();
            }
            let Some(url) = text(step, "screenshotRef").and_then(|r| self.image_url(owner_id, job_id, r)) else {
                continue;
            };
            let alt = match explanation {
                Some(e) => sanitize_alt(e),
                None => format!("Screenshot for Step {n}"),
            };
            md.line(format!("![{alt}]({url})"));
            md.blank();
        }
    }

    /// `<base>/<owner>/<job>/screenshots/<file>`, or `None` for a reference
    /// without a file name.
    pub fn image_url(&self, owner_id: &str, job_id: &str, reference: &str) -> Option<String> {
        let file = reference.rsplit(['/', '\\']).next().unwrap_or(reference).trim();
        if file.is_empty() {
            return None;
        }
        let mut url = self.image_base.clone();
        {
            let mut segments = url.path_segments_mut().ok()?;
            segments
                .pop_if_empty()
                .extend([owner_id, job_id, "screenshots", file]);
        }
        Some(url.to_string())
    }
}

/// `docTitle`, then `title`, then a generated fallback.
fn document_title(result: &GenerationResult, job_id: &str) -> String {
    result
        .str_field("docTitle")
        .or_else(|| result.str_field("title"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Generated SOP for job {job_id}"))
}

fn write_introduction(md: &mut MarkdownWriter, intro: &Map<String, Value>) {
    md.heading("## Introduction");
    if let Some(paras) = section(intro, "paragraphs") {
        for p in strings(paras) {
            md.line(p);
            md.blank();
        }
    }
    write_bullets(md, intro, "prerequisites", "### Prerequisites");
    write_bullets(md, intro, "outcomes", "### Learning Outcomes");
}

fn write_code_snippets(md: &mut MarkdownWriter, items: &[Value]) {
    md.heading("## Code Snippets");
    for snippet in objects(items) {
        let Some(code) = text(snippet, "content") else { continue };
        let language = text(snippet, "language").unwrap_or("plaintext");
        if let Some(caption) = text(snippet, "caption") {
            md.heading(&format!("### {caption}"));
        }
        md.line(format!("*Language: {language}*"));
        md.blank();
        md.line(format!("```{language}"));
        md.line(code);
        md.line("```");
        md.blank();
    }
}

fn write_decision_points(md: &mut MarkdownWriter, items: &[Value]) {
    md.heading("## Decision Points");
    for dp in objects(items) {
        let Some(condition) = text(dp, "if_condition") else { continue };
        md.line(format!("**If:** {condition}"));
        md.blank();
        for (key, label) in [("then_steps", "**Then:**"), ("else_steps", "**Else:**")] {
            if let Some(branch) = section(dp, key) {
                md.line(label);
                for s in strings(branch) {
                    md.line(format!("- {s}"));
                }
                md.blank();
            }
        }
    }
}

fn write_tables(md: &mut MarkdownWriter, items: &[Value]) {
    md.heading("## Tables");
    for table in objects(items) {
        let (Some(headers), Some(rows)) = (section(table, "headers"), section(table, "rows")) else {
            continue;
        };
        let header_cells: Vec<String> = headers.iter().map(cell_text).collect();
        md.line(table_row(&header_cells));
        md.line(table_row(&vec!["---".to_string(); header_cells.len()]));
        for row in rows.iter().filter_map(Value::as_array) {
            let mut cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.len() < header_cells.len() {
                cells.resize(header_cells.len(), String::new());
            }
            md.line(table_row(&cells));
        }
        md.blank();
    }
}

/// Any JSON value as one table cell; pipes are escaped so columns stay put.
fn cell_text(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    raw.replace('|', "\\|")
}

fn table_row(cells: &[String]) -> String {
    format!("| {} |", cells.join(" | "))
}

fn write_bullets(md: &mut MarkdownWriter, parent: &Map<String, Value>, key: &str, heading: &str) {
    if let Some(items) = section(parent, key) {
        md.heading(heading);
        for item in strings(items) {
            md.line(format!("- {item}"));
        }
        md.blank();
    }
}

fn sanitize_alt(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '[' | ']' | '(' | ')')).collect()
}

// ── JSON accessors ───────────────────────────────────────────────────────────

/// Non-empty array under `key`.
fn section<'a>(parent: &'a Map<String, Value>, key: &str) -> Option<&'a [Value]> {
    parent
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .filter(|a| !a.is_empty())
}

/// Trimmed, non-blank string under `key`.
fn text<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn strings(items: &[Value]) -> impl Iterator<Item = &str> {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn objects(items: &[Value]) -> impl Iterator<Item = &Map<String, Value>> {
    items.iter().filter_map(Value::as_object)
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MarkdownWriter {
    lines: Vec<String>,
}

impl MarkdownWriter {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Blank separator, never doubled.
    fn blank(&mut self) {
        if self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(String::new());
        }
    }

    fn heading(&mut self, heading: &str) {
        self.line(heading);
        self.blank();
    }

    fn finish(self) -> String {
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::generate::parse_response;
    use crate::schema::GenerationSchema;
    use serde_json::json;

    const BASE: &str = "https://example.supabase.co/storage/v1/object/public/log_dataa";

    fn result(value: Value) -> GenerationResult {
        let schema = GenerationSchema::from_value(json!({ "type": "object", "properties": {} })).unwrap();
        parse_response(&value.to_string(), &schema, false).unwrap()
    }

    fn renderer() -> Renderer {
        Renderer::new(BASE).unwrap()
    }

    fn sample() -> GenerationResult {
        result(json!({
            "docTitle": "Adding a product",
            "title": "Adding a product to the catalogue",
            "shortDescription": "Create a product from the admin panel.",
            "introduction": {
                "paragraphs": ["This guide covers product creation."],
                "prerequisites": ["Admin account"],
                "outcomes": []
            },
            "steps": [
                { "step": "Open Products", "explanation": "Click [Products] (sidebar)", "screenshotRef": "001.png" },
                { "step": "Click New", "screenshotRef": "user/j/screenshots/002.png" },
                { "step": "Save" }
            ],
            "faq": [{ "question": "Can I undo?", "answer": "Yes." }, { "question": "Orphan" }],
            "tables": [{ "headers": ["Field", "Required"], "rows": [["Name", "yes"], ["SKU", "no"]] }],
            "conclusion": { "paragraphs": ["Done."], "nextSteps": ["Publish it"] }
        }))
    }

    #[test]
    fn table_cells_of_any_type_keep_columns_aligned() {
        let doc = renderer().render(
            &result(json!({
                "tables": [{
                    "headers": ["Field", "Qty", "Active"],
                    "rows": [["SKU", 5, true], ["Price", 9.5], ["Note", null, "a|b"]]
                }]
            })),
            "u1",
            "j1",
        );
        let c = &doc.content;
        assert!(c.contains("| Field | Qty | Active |\n| --- | --- | --- |\n"), "{c}");
        assert!(c.contains("| SKU | 5 | true |"), "{c}");
        assert!(c.contains("| Price | 9.5 |  |"), "{c}");
        assert!(c.contains("| Note |  | a\\|b |"), "{c}");
    }

    #[test]
    fn renders_sections_in_fixed_order() {
        let doc = renderer().render(&sample(), "u1", "j1");
        let c = &doc.content;
        assert!(c.starts_with("# Adding a product to the catalogue\n\n## Introduction\n"), "{c}");
        assert!(c.contains("### Prerequisites\n\n- Admin account\n"));
        assert!(!c.contains("Learning Outcomes"));
        let faq = c.find("## Frequently Asked Questions (FAQ)").unwrap();
        let steps = c.find("## Procedure / Steps").unwrap();
        let tables = c.find("## Tables").unwrap();
        let conclusion = c.find("## Conclusion").unwrap();
        assert!(faq < steps && steps < tables && tables < conclusion);
        assert!(c.contains("**Q:** Can I undo?\n**A:** Yes."));
        assert!(!c.contains("Orphan"));
        assert!(c.contains("| Field | Required |\n| --- | --- |\n| Name | yes |\n| SKU | no |"));
        assert!(c.ends_with("### Next Steps\n\n- Publish it\n"));
    }

    #[test]
    fn step_images_use_absolute_urls() {
        let doc = renderer().render(&sample(), "u1", "j1");
        assert!(doc.content.contains(&format!(
            "![Click Products sidebar]({BASE}/u1/j1/screenshots/001.png)"
        )));
        assert!(doc
            .content
            .contains(&format!("![Screenshot for Step 2]({BASE}/u1/j1/screenshots/002.png)")));
        assert_eq!(doc.content.matches("![").count(), 2);
    }

    #[test]
    fn image_url_encodes_segments() {
        let url = renderer().image_url("u 1", "j#1", "../shot 1.png").unwrap();
        assert_eq!(url, format!("{BASE}/u%201/j%231/screenshots/shot%201.png"));
        let trailing = Renderer::new(&format!("{BASE}/")).unwrap();
        assert_eq!(
            trailing.image_url("u1", "j1", "a.png").unwrap(),
            format!("{BASE}/u1/j1/screenshots/a.png")
        );
        assert!(renderer().image_url("u1", "j1", "dir/").is_none());
    }

    #[test]
    fn rendering_is_idempotent() {
        let r = renderer();
        let input = sample();
        assert_eq!(r.render(&input, "u1", "j1"), r.render(&input, "u1", "j1"));
    }

    #[test]
    fn title_and_description_fallbacks() {
        let doc = renderer().render(&sample(), "u1", "j1");
        assert_eq!(doc.title, "Adding a product");
        assert_eq!(doc.description, "Create a product from the admin panel.");

        let bare = renderer().render(&result(json!({ "title": "  " })), "u1", "j9");
        assert_eq!(bare.title, "Generated SOP for job j9");
        assert_eq!(bare.description, "");
        assert_eq!(bare.content, "\n");
    }

    #[test]
    fn ill_typed_sections_are_skipped() {
        let doc = renderer().render(
            &result(json!({
                "title": "T",
                "features": "not a list",
                "notes": [],
                "steps": [42, "text"],
                "callouts": [" Save often ", 3],
                "references": [{ "text": "Docs", "href": "https://d", "annotation": "official" }, { "text": "Wiki" }]
            })),
            "u1",
            "j1",
        );
        assert!(!doc.content.contains("Key Features"));
        assert!(!doc.content.contains("## Notes"));
        assert!(doc.content.contains("## Procedure / Steps"));
        assert!(doc.content.contains("## Tips\n\n- Save often\n"));
        assert!(doc.content.contains("- [Docs](https://d) (official)\n- Wiki\n"));
    }

    #[test]
    fn code_snippet_defaults_to_plaintext() {
        let doc = renderer().render(
            &result(json!({ "code_snippets": [{ "content": "echo hi", "caption": "Shell" }, { "language": "rust" }] })),
            "u1",
            "j1",
        );
        assert!(doc
            .content
            .contains("### Shell\n\n*Language: plaintext*\n\n```plaintext\necho hi\n```\n"));
        assert!(!doc.content.contains("```rust"));
    }

    #[test]
    fn rejects_relative_base() {
        assert!(Renderer::new("log_dataa/public").is_err());
        assert!(Renderer::new("mailto:ops@example.com").is_err());
    }
}

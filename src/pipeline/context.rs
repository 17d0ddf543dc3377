//! Context building: turn the user's query into a knowledge-base excerpt.
//!
//! This stage is advisory. Every failure (embedding error, search error,
//! timeout) degrades to a short marker string so generation still runs with
//! whatever the screenshots and event log provide.

use crate::clients::{SimilarityMatch, SimilarityService};
use crate::error::ClientError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ContextBuilder {
    similarity: Arc<dyn SimilarityService>,
    top_k: usize,
    timeout: Duration,
}

impl ContextBuilder {
    pub fn new(similarity: Arc<dyn SimilarityService>, top_k: usize, timeout: Duration) -> Self {
        Self {
            similarity,
            top_k,
            timeout,
        }
    }

    /// Knowledge-base text for `query`, scoped to `owner_id` and `integration_type`.
    pub async fn augment(&self, owner_id: &str, query: &str, integration_type: &str) -> String {
        let integration = integration_type.trim();
        if integration.is_empty() {
            return unavailable_marker(integration);
        }
        let lookup = async {
            let vector = self.similarity.embed(query).await?;
            let found = self
                .similarity
                .search(&vector, owner_id, integration, self.top_k)
                .await?;
            Ok::<_, ClientError>(found)
        };
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(matches)) => {
                debug!("Context: {} {} matches", matches.len(), integration);
                format_matches(integration, &matches)
            }
            Ok(Err(e)) => {
                warn!("Similarity lookup failed, continuing without context: {}", e);
                format!(
                    "Error fetching {} issues: {e} ({})",
                    integration.to_lowercase(),
                    unavailable_marker(integration)
                )
            }
            Err(_) => {
                warn!(
                    "Similarity lookup timed out after {}s, continuing without context",
                    self.timeout.as_secs()
                );
                format!(
                    "Error fetching {} issues: timed out after {}s ({})",
                    integration.to_lowercase(),
                    self.timeout.as_secs(),
                    unavailable_marker(integration)
                )
            }
        }
    }
}

fn unavailable_marker(integration: &str) -> String {
    if integration.is_empty() {
        "Context unavailable.".to_string()
    } else {
        format!("{} context unavailable.", capitalize(integration))
    }
}

fn format_matches(integration: &str, matches: &[SimilarityMatch]) -> String {
    if matches.is_empty() {
        return format!("No relevant {} items found.", integration.to_lowercase());
    }
    let title = capitalize(integration);
    let blocks: Vec<String> = matches
        .iter()
        .map(|m| format!("{title} Item: {}\nDetails: {}", m.id, m.text.trim()))
        .collect();
    format!("### Relevant {title} Content:\n{}", blocks.join("\n\n"))
}

/// `jira` → `Jira`, `GITHUB` → `Github`.
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemorySimilarityService;

    fn item(id: &str, text: &str) -> SimilarityMatch {
        SimilarityMatch {
            id: id.into(),
            text: text.into(),
            score: 0.8,
        }
    }

    fn builder(svc: MemorySimilarityService) -> (ContextBuilder, Arc<MemorySimilarityService>) {
        let svc = Arc::new(svc);
        (ContextBuilder::new(svc.clone(), 2, Duration::from_secs(5)), svc)
    }

    #[tokio::test]
    async fn formats_top_k_matches_under_header() {
        let (b, svc) = builder(MemorySimilarityService::new(vec![
            item("PRJ-1", "Create a product"),
            item("PRJ-2", "Edit pricing "),
            item("PRJ-3", "ignored beyond top_k"),
        ]));
        let ctx = b.augment("u1", "add product", "jira").await;
        assert_eq!(
            ctx,
            "### Relevant Jira Content:\nJira Item: PRJ-1\nDetails: Create a product\n\nJira Item: PRJ-2\nDetails: Edit pricing"
        );
        assert_eq!(svc.searches(), vec![("u1".to_string(), "jira".to_string(), 2)]);
    }

    #[tokio::test]
    async fn empty_result_has_marker() {
        let (b, _) = builder(MemorySimilarityService::new(vec![]));
        assert_eq!(b.augment("u1", "q", "Jira").await, "No relevant jira items found.");
    }

    #[tokio::test]
    async fn failure_degrades_to_unavailable_marker() {
        let (b, _) = builder(MemorySimilarityService::failing("connection reset"));
        let ctx = b.augment("u1", "q", "jira").await;
        assert!(ctx.starts_with("Error fetching jira issues:"), "{ctx}");
        assert!(ctx.contains("connection reset"));
        assert!(ctx.contains("Jira context unavailable."));
    }

    #[tokio::test]
    async fn missing_integration_type_skips_lookup() {
        let (b, svc) = builder(MemorySimilarityService::new(vec![item("1", "x")]));
        assert_eq!(b.augment("u1", "q", "  ").await, "Context unavailable.");
        assert!(svc.searches().is_empty());
    }

    #[test]
    fn capitalize_like_title_case_word() {
        assert_eq!(capitalize("jira"), "Jira");
        assert_eq!(capitalize("GITHUB"), "Github");
        assert_eq!(capitalize(""), "");
    }
}

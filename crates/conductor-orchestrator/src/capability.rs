use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Closed set of capability tags a worker can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum CapabilityTag {
    /// Writes new source code from a description.
    CodeGeneration,
    /// Inspects existing code for defects and style.
    CodeReview,
    /// Gathers information from the web.
    WebSearch,
    /// Produces or edits API specifications.
    ApiSpec,
    /// Evaluates and compares information.
    Analysis,
    /// Confirms claims or results.
    Verification,
    /// Condenses several inputs into a report.
    Summarization,
    /// Writes or runs tests.
    Testing,
    /// Writes prose documentation.
    Documentation,
}

impl CapabilityTag {
    /// Every tag, in declaration order.
    pub const ALL: [CapabilityTag; 9] = [
        CapabilityTag::CodeGeneration,
        CapabilityTag::CodeReview,
        CapabilityTag::WebSearch,
        CapabilityTag::ApiSpec,
        CapabilityTag::Analysis,
        CapabilityTag::Verification,
        CapabilityTag::Summarization,
        CapabilityTag::Testing,
        CapabilityTag::Documentation,
    ];

    /// Built-in keywords that imply this tag when found in an objective.
    pub fn default_keywords(self) -> &'static [&'static str] {
        match self {
            CapabilityTag::CodeGeneration => {
                &["generate", "implement", "code", "scaffold", "function", "class"]
            }
            CapabilityTag::CodeReview => &["review", "lint", "audit", "inspect", "refactor"],
            CapabilityTag::WebSearch => {
                &["search", "find", "lookup", "look up", "research", "browse"]
            }
            CapabilityTag::ApiSpec => &["api", "openapi", "endpoint", "swagger", "schema"],
            CapabilityTag::Analysis => &["analyze", "analyse", "evaluate", "compare", "assess"],
            CapabilityTag::Verification => &["verify", "validate", "confirm", "fact-check"],
            CapabilityTag::Summarization => &["summarize", "summarise", "synthesize", "report"],
            CapabilityTag::Testing => &["test", "coverage"],
            CapabilityTag::Documentation => &["document", "docs", "readme", "explain"],
        }
    }
}

impl std::fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CapabilityTag::CodeGeneration => "code_generation",
            CapabilityTag::CodeReview => "code_review",
            CapabilityTag::WebSearch => "web_search",
            CapabilityTag::ApiSpec => "api_spec",
            CapabilityTag::Analysis => "analysis",
            CapabilityTag::Verification => "verification",
            CapabilityTag::Summarization => "summarization",
            CapabilityTag::Testing => "testing",
            CapabilityTag::Documentation => "documentation",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CapabilityTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        CapabilityTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.to_string() == wanted)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

impl TryFrom<String> for CapabilityTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Maps capability tags to the keywords that route an objective to them.
///
/// Matching is a case-insensitive substring test against the objective text.
#[derive(Debug, Clone)]
pub struct CapabilityMatcher {
    keywords: BTreeMap<CapabilityTag, Vec<String>>,
}

impl CapabilityMatcher {
    /// Matcher with only the built-in keyword table.
    pub fn new() -> Self {
        let keywords = CapabilityTag::ALL
            .iter()
            .map(|tag| {
                let words = tag
                    .default_keywords()
                    .iter()
                    .map(|w| (*w).to_string())
                    .collect();
                (*tag, words)
            })
            .collect();
        Self { keywords }
    }

    /// Matcher with the built-in table plus `extra` keywords per tag.
    pub fn with_extra_keywords(extra: &HashMap<CapabilityTag, Vec<String>>) -> Self {
        let mut matcher = Self::new();
        for (tag, words) in extra {
            let entry = matcher.keywords.entry(*tag).or_default();
            for word in words {
                let word = word.trim().to_lowercase();
                if !word.is_empty() && !entry.contains(&word) {
                    entry.push(word);
                }
            }
        }
        matcher
    }

    /// Keywords registered for `tag`.
    pub fn keywords(&self, tag: CapabilityTag) -> &[String] {
        self.keywords.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any keyword of `tag` occurs in `objective`.
    pub fn matches(&self, tag: CapabilityTag, objective: &str) -> bool {
        let objective = objective.to_lowercase();
        self.matches_lowered(tag, &objective)
    }

    /// Whether any of `tags` is implied by `objective`.
    pub fn matches_any<'a>(
        &self,
        tags: impl IntoIterator<Item = &'a CapabilityTag>,
        objective: &str,
    ) -> bool {
        let objective = objective.to_lowercase();
        tags.into_iter()
            .any(|tag| self.matches_lowered(*tag, &objective))
    }

    /// All tags implied by `objective`.
    pub fn tags_for(&self, objective: &str) -> BTreeSet<CapabilityTag> {
        let objective = objective.to_lowercase();
        self.keywords
            .keys()
            .copied()
            .filter(|tag| self.matches_lowered(*tag, &objective))
            .collect()
    }

    fn matches_lowered(&self, tag: CapabilityTag, objective: &str) -> bool {
        self.keywords(tag)
            .iter()
            .any(|word| objective.contains(word.as_str()))
    }
}

impl Default for CapabilityMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        let matcher = CapabilityMatcher::new();
        assert!(matcher.matches(CapabilityTag::WebSearch, "SEARCH for Rust crates"));
        assert!(matcher.matches(CapabilityTag::CodeReview, "Please Review this PR"));
        assert!(!matcher.matches(CapabilityTag::Testing, "search the web"));
    }

    #[test]
    fn test_tags_for_objective() {
        let matcher = CapabilityMatcher::new();
        let tags = matcher.tags_for("Analyze the results and write a summary report");
        assert!(tags.contains(&CapabilityTag::Analysis));
        assert!(tags.contains(&CapabilityTag::Summarization));
        assert!(!tags.contains(&CapabilityTag::WebSearch));
    }

    #[test]
    fn test_matches_any() {
        let matcher = CapabilityMatcher::new();
        let tags = [CapabilityTag::Testing, CapabilityTag::ApiSpec];
        assert!(matcher.matches_any(&tags, "Draft the OpenAPI document"));
        assert!(!matcher.matches_any(&tags, "paint a fence"));
        assert!(!matcher.matches_any(&[] as &[CapabilityTag], "write tests"));
    }

    #[test]
    fn test_extra_keywords_merge() {
        let mut extra = HashMap::new();
        extra.insert(
            CapabilityTag::WebSearch,
            vec!["Crawl".to_string(), "  ".to_string(), "search".to_string()],
        );
        let matcher = CapabilityMatcher::with_extra_keywords(&extra);
        assert!(matcher.matches(CapabilityTag::WebSearch, "crawl the docs site"));
        let count = matcher
            .keywords(CapabilityTag::WebSearch)
            .iter()
            .filter(|w| *w == "search")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_tag_serde_and_display() {
        let json = serde_json::to_string(&CapabilityTag::ApiSpec).unwrap();
        assert_eq!(json, "\"api_spec\"");
        let parsed: CapabilityTag = serde_json::from_str("\"code_review\"").unwrap();
        assert_eq!(parsed, CapabilityTag::CodeReview);
        for tag in CapabilityTag::ALL {
            assert_eq!(serde_json::to_string(&tag).unwrap(), format!("\"{tag}\""));
            assert_eq!(tag.to_string().parse::<CapabilityTag>().unwrap(), tag);
        }
        assert_eq!("Web-Search".parse::<CapabilityTag>().unwrap(), CapabilityTag::WebSearch);
        assert!(serde_json::from_str::<CapabilityTag>("\"juggling\"").is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Expensive generation endpoints, matched exactly
const STORY_GENERATION_PATHS: &[&str] =
    &["/api/langchain", "/api/semantic-kernel", "/api/langgraph"];

/// List and query endpoints, matched by prefix
const LIST_OR_QUERY_PREFIXES: &[&str] = &["/api/stories", "/api/cost", "/api/context"];

/// Lightweight endpoints, matched exactly
const HEALTH_STATUS_PATHS: &[&str] = &["/health", "/status", "/metrics", "/docs", "/openapi.json"];

/// Coarse cost category an endpoint is bucketed into for the class tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    StoryGeneration,
    #[serde(rename = "list_endpoints")]
    ListOrQuery,
    HealthStatus,
    Default,
}

impl OperationClass {
    pub const ALL: [OperationClass; 4] = [
        OperationClass::StoryGeneration,
        OperationClass::ListOrQuery,
        OperationClass::HealthStatus,
        OperationClass::Default,
    ];

    /// Name used in counter keys and the `endpoint_<class>` limit type
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::StoryGeneration => "story_generation",
            OperationClass::ListOrQuery => "list_endpoints",
            OperationClass::HealthStatus => "health_status",
            OperationClass::Default => "default",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a request path to its operation class.
///
/// Exact generation matches win over prefix matches, which win over the
/// exact health/status list; anything else is `Default`.
pub fn classify(path: &str) -> OperationClass {
    if STORY_GENERATION_PATHS.contains(&path) {
        return OperationClass::StoryGeneration;
    }

    if LIST_OR_QUERY_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return OperationClass::ListOrQuery;
    }

    if HEALTH_STATUS_PATHS.contains(&path) {
        return OperationClass::HealthStatus;
    }

    OperationClass::Default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_generation_is_exact() {
        assert_eq!(classify("/api/langchain"), OperationClass::StoryGeneration);
        assert_eq!(
            classify("/api/semantic-kernel"),
            OperationClass::StoryGeneration
        );
        assert_eq!(classify("/api/langgraph"), OperationClass::StoryGeneration);

        assert_eq!(classify("/api/langchain/"), OperationClass::Default);
        assert_eq!(classify("/api/langgraph/extra"), OperationClass::Default);
    }

    #[test]
    fn test_list_endpoints_match_by_prefix() {
        assert_eq!(classify("/api/stories"), OperationClass::ListOrQuery);
        assert_eq!(classify("/api/stories/42"), OperationClass::ListOrQuery);
        assert_eq!(classify("/api/cost/summary"), OperationClass::ListOrQuery);
        assert_eq!(classify("/api/context/upload"), OperationClass::ListOrQuery);
    }

    #[test]
    fn test_health_status_is_exact() {
        for path in ["/health", "/status", "/metrics", "/docs", "/openapi.json"] {
            assert_eq!(classify(path), OperationClass::HealthStatus, "{}", path);
        }
        assert_eq!(classify("/healthz"), OperationClass::Default);
        assert_eq!(classify("/docs/oauth2-redirect"), OperationClass::Default);
    }

    #[test]
    fn test_fallback_is_default() {
        assert_eq!(classify("/"), OperationClass::Default);
        assert_eq!(classify(""), OperationClass::Default);
        assert_eq!(classify("/api/provider"), OperationClass::Default);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(
            OperationClass::StoryGeneration.to_string(),
            "story_generation"
        );
        assert_eq!(OperationClass::ListOrQuery.to_string(), "list_endpoints");
        assert_eq!(
            serde_json::to_string(&OperationClass::ListOrQuery).unwrap(),
            "\"list_endpoints\""
        );
        assert_eq!(
            serde_json::to_string(&OperationClass::HealthStatus).unwrap(),
            "\"health_status\""
        );
    }
}

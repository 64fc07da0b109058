//! Noise filtering for service output

use regex::{RegexSet, RegexSetBuilder};
use std::sync::LazyLock;

/// Output that is common and harmless across most projects
pub const BUILTIN_LOG_FILTERS: &[&str] = &[
    // Electron DevTools protocol
    r"Request Autofill\.enable failed",
    r"Request Autofill\.setAddresses failed",
    r"'Autofill\.\w+' wasn't found",
    // npm registry credentials
    r"npm warn Unknown env config",
    // Node.js inspector
    r"Debugger listening on ws://",
    r"Debugger attached",
    r"For help, see: https://nodejs.org/en/docs/inspector",
    // Vite/esbuild
    r"\[vite\] warning: .*node_modules",
    r"ExperimentalWarning:",
    r"DeprecationWarning:",
];

static BUILTIN: LazyLock<LogFilter> =
    LazyLock::new(|| LogFilter::new(BUILTIN_LOG_FILTERS).unwrap());

/// Case-insensitive patterns whose matching lines are dropped before they
/// reach a log buffer
#[derive(Debug, Clone)]
pub struct LogFilter {
    set: RegexSet,
    patterns: Vec<String>,
}

impl LogFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        let set = RegexSetBuilder::new(&patterns)
            .case_insensitive(true)
            .build()?;
        Ok(Self { set, patterns })
    }

    /// Only [`BUILTIN_LOG_FILTERS`]
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// [`BUILTIN_LOG_FILTERS`] followed by `custom`
    pub fn with_builtins<I, S>(custom: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let custom: Vec<String> = custom.into_iter().map(|p| p.as_ref().to_string()).collect();
        if custom.is_empty() {
            return Ok(Self::builtin());
        }
        Self::new(
            BUILTIN_LOG_FILTERS
                .iter()
                .copied()
                .chain(custom.iter().map(String::as_str)),
        )
    }

    pub fn should_filter(&self, message: &str) -> bool {
        self.set.is_match(message)
    }

    /// Raw pattern strings in the order they were given
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_patterns() {
        let filter = LogFilter::builtin();
        assert_eq!(filter.len(), BUILTIN_LOG_FILTERS.len());
        assert!(filter.should_filter("Debugger listening on ws://127.0.0.1:9229/abc"));
        assert!(filter.should_filter("(node:42) ExperimentalWarning: VM Modules"));
        assert!(filter.should_filter("NPM WARN Unknown env config \"registry\""));
        assert!(!filter.should_filter("Server listening on :3000"));
    }

    #[test]
    fn test_custom_patterns() {
        let filter = LogFilter::with_builtins(["^GET /health", r"heartbeat \d+"]).unwrap();
        assert_eq!(filter.len(), BUILTIN_LOG_FILTERS.len() + 2);
        assert!(filter.should_filter("get /health 200 1ms"));
        assert!(filter.should_filter("heartbeat 17"));
        assert!(!filter.should_filter("GET /api/users 200"));
        assert_eq!(filter.patterns().last().unwrap(), r"heartbeat \d+");

        let only = LogFilter::new(["heartbeat"]).unwrap();
        assert!(!only.should_filter("Debugger attached"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(LogFilter::new(["(unclosed"]).is_err());
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let filter = LogFilter::new(Vec::<String>::new()).unwrap();
        assert!(filter.is_empty());
        assert!(!filter.should_filter("anything"));
    }
}

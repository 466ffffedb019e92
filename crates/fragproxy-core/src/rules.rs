//! Per-domain rule overrides, matched in file order, first match wins.
//!
//! A malformed or missing rules file is never fatal — it just yields an
//! empty [`RuleSet`], and every domain falls through to the blacklist
//! oracle's decision untouched.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::fragment::FragmentMethod;

/// What a matching rule does to the blacklist oracle's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Defer to the oracle's decision, but still possibly override the method.
    Auto,
    /// Force fragmentation regardless of what the oracle said.
    Force,
    /// Never fragment, regardless of what the oracle said.
    Bypass,
}

impl Default for RuleAction {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::str::FromStr for RuleAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "force" => Ok(Self::Force),
            "bypass" => Ok(Self::Bypass),
            _ => Ok(Self::Auto),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRule {
    pattern: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    fragment_method: Option<String>,
}

/// A single ordered pattern rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    action: RuleAction,
    method: Option<FragmentMethod>,
}

impl Rule {
    fn matches(&self, domain: &str) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        if let Some(suffix) = self.pattern.strip_prefix('*') {
            return domain.ends_with(suffix);
        }
        domain == self.pattern || domain.ends_with(&format!(".{}", self.pattern))
    }
}

impl From<RawRule> for Rule {
    fn from(raw: RawRule) -> Self {
        let action = raw.action.to_lowercase().parse().unwrap_or_default();
        let method = raw
            .fragment_method
            .and_then(|m| m.to_lowercase().parse::<FragmentMethod>().ok());
        Self {
            pattern: raw.pattern.to_lowercase(),
            action,
            method,
        }
    }
}

/// An ordered list of domain rules, evaluated first-match-wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build an empty rule set, fragmenting nothing on its own.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Load rules from a JSON file. Any failure (missing file, malformed
    /// JSON) logs a warning and falls back to an empty rule set.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_json(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to parse rules file, ignoring");
                Self::empty()
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "rules file not readable, ignoring");
                Self::empty()
            }
        }
    }

    /// Parse rules from a JSON array of rule objects.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let raw: Vec<RawRule> = serde_json::from_str(content)?;
        Ok(Self {
            rules: raw.into_iter().map(Rule::from).collect(),
        })
    }

    /// Evaluate `domain` against the rule list. The first matching rule wins.
    ///
    /// Returns `(decision, method)`, where `decision` is `Some(true)` to force
    /// fragmentation, `Some(false)` to bypass it, or `None` to defer to the
    /// blacklist oracle. `method` overrides the configured fragment method
    /// when present, independent of `decision`.
    pub fn decide(&self, domain: &str) -> (Option<bool>, Option<FragmentMethod>) {
        let d = domain.to_lowercase();
        for rule in &self.rules {
            if !rule.matches(&d) {
                continue;
            }
            return match rule.action {
                RuleAction::Bypass => (Some(false), rule.method),
                RuleAction::Force => (Some(true), rule.method),
                RuleAction::Auto => (None, rule.method),
            };
        }
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ruleset_defers_everything() {
        let rules = RuleSet::empty();
        assert_eq!(rules.decide("example.com"), (None, None));
    }

    #[test]
    fn exact_pattern_matches() {
        let rules = RuleSet::from_json(
            r#"[{"pattern": "example.com", "action": "force"}]"#,
        )
        .unwrap();
        assert_eq!(rules.decide("example.com"), (Some(true), None));
        assert_eq!(rules.decide("other.com"), (None, None));
    }

    #[test]
    fn suffix_pattern_matches_subdomains() {
        let rules = RuleSet::from_json(
            r#"[{"pattern": "example.com", "action": "bypass"}]"#,
        )
        .unwrap();
        assert_eq!(rules.decide("api.example.com"), (Some(false), None));
    }

    #[test]
    fn wildcard_prefix_matches_any_subdomain_but_not_apex() {
        let rules = RuleSet::from_json(
            r#"[{"pattern": "*.example.com", "action": "force"}]"#,
        )
        .unwrap();
        assert_eq!(rules.decide("sub.example.com"), (Some(true), None));
        assert_eq!(rules.decide("example.com"), (None, None));
    }

    #[test]
    fn auto_action_carries_method_override_without_decision() {
        let rules = RuleSet::from_json(
            r#"[{"pattern": "example.com", "action": "auto", "fragment_method": "sni"}]"#,
        )
        .unwrap();
        assert_eq!(
            rules.decide("example.com"),
            (None, Some(FragmentMethod::Sni))
        );
    }

    #[test]
    fn first_match_wins() {
        let rules = RuleSet::from_json(
            r#"[
                {"pattern": "example.com", "action": "force"},
                {"pattern": "*.example.com", "action": "bypass"}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.decide("www.example.com"), (Some(true), None));
    }

    #[test]
    fn malformed_json_yields_empty_ruleset_not_an_error() {
        let result = RuleSet::from_json("not json");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_loads_as_empty_without_panicking() {
        let rules = RuleSet::load(Path::new("/nonexistent/fragproxy-rules.json"));
        assert_eq!(rules.decide("anything.com"), (None, None));
    }
}

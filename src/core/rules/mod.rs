// src/core/rules/mod.rs

//! The origin rule registry: path matchers compiled once at config load,
//! resolving request paths into prioritized source chains.

pub mod source;

pub use source::ResolvedSource;

use crate::config::{BucketConfig, Config, OriginRuleConfig, TtlByStatus};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One rule with its matcher compiled. A rule whose pattern failed to compile
/// is retained but never matches; the failure is diagnosed at load time.
#[derive(Debug)]
struct CompiledRule {
    config: OriginRuleConfig,
    matcher: Option<Regex>,
}

/// An immutable, shareable registry of compiled origin rules.
/// Rebuilt wholesale whenever the configuration document changes.
#[derive(Debug)]
pub struct RuleRegistry {
    rules: Vec<CompiledRule>,
    bucket: BucketConfig,
}

/// The outcome of resolving a request path against the registry.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_name: String,
    pub process_path: bool,
    pub ttl: TtlByStatus,
    pub captures: HashMap<String, String>,
    /// Sources rendered into concrete fetch targets, ascending priority.
    pub sources: Vec<ResolvedSource>,
}

impl RuleRegistry {
    /// Compiles every rule pattern in declaration order. Compile errors keep
    /// the rule in place, marked non-matching, with a load-time diagnostic.
    pub fn build(config: &Config) -> Arc<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let matcher = match Regex::new(&rule.pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!(
                            rule = %rule.name,
                            pattern = %rule.pattern,
                            "origin rule pattern failed to compile, rule disabled: {e}"
                        );
                        None
                    }
                };
                CompiledRule {
                    config: rule.clone(),
                    matcher,
                }
            })
            .collect();

        Arc::new(Self {
            rules,
            bucket: config.bucket.clone(),
        })
    }

    /// Resolves a request path against the rules in declaration order.
    /// The first rule whose matcher admits the path wins.
    pub fn resolve(&self, path: &str) -> Option<RuleMatch> {
        for rule in &self.rules {
            let Some(matcher) = &rule.matcher else {
                continue;
            };
            let Some(found) = matcher.captures(path) else {
                continue;
            };

            let mut captures = HashMap::new();
            for name in matcher.capture_names().flatten() {
                let value = found
                    .name(name)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                captures.insert(name.to_string(), value);
            }

            let mut sources: Vec<ResolvedSource> = rule
                .config
                .sources
                .iter()
                .map(|s| ResolvedSource::render(s, &captures, &self.bucket))
                .collect();
            sources.sort_by_key(|s| s.priority);

            return Some(RuleMatch {
                rule_name: rule.config.name.clone(),
                process_path: rule.config.process_path,
                ttl: rule.config.ttl,
                captures,
                sources,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, SourceKind};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.bucket.base_url = Some("https://bucket.internal".to_string());
        config.rules = vec![
            OriginRuleConfig {
                name: "broken".into(),
                pattern: "^/videos/(?P<path".into(),
                process_path: true,
                ttl: TtlByStatus::default(),
                sources: vec![],
            },
            OriginRuleConfig {
                name: "videos".into(),
                pattern: r"^/videos/(?P<path>.+)$".into(),
                process_path: true,
                ttl: TtlByStatus::default(),
                sources: vec![
                    SourceConfig {
                        kind: SourceKind::Remote,
                        priority: 2,
                        path_template: "https://media.example.com/{path}".into(),
                        auth: None,
                    },
                    SourceConfig {
                        kind: SourceKind::Bucket,
                        priority: 1,
                        path_template: "{path}".into(),
                        auth: None,
                    },
                ],
            },
            OriginRuleConfig {
                name: "catchall".into(),
                pattern: r"^/videos/(?P<path>special.+)$".into(),
                process_path: true,
                ttl: TtlByStatus::default(),
                sources: vec![],
            },
        ];
        config
    }

    #[test]
    fn first_matching_rule_wins_in_declaration_order() {
        let registry = RuleRegistry::build(&test_config());
        let matched = registry.resolve("/videos/special/a.mp4").unwrap();
        // "videos" is declared before "catchall" and also matches.
        assert_eq!(matched.rule_name, "videos");
    }

    #[test]
    fn broken_patterns_never_match() {
        let registry = RuleRegistry::build(&test_config());
        let matched = registry.resolve("/videos/a.mp4").unwrap();
        assert_eq!(matched.rule_name, "videos");
    }

    #[test]
    fn sources_come_back_in_priority_order() {
        let registry = RuleRegistry::build(&test_config());
        let matched = registry.resolve("/videos/clips/a.mp4").unwrap();
        assert_eq!(matched.sources.len(), 2);
        assert_eq!(matched.sources[0].kind, SourceKind::Bucket);
        assert_eq!(
            matched.sources[0].url,
            "https://bucket.internal/clips/a.mp4"
        );
        assert_eq!(
            matched.sources[1].url,
            "https://media.example.com/clips/a.mp4"
        );
    }

    #[test]
    fn unmatched_paths_resolve_to_none() {
        let registry = RuleRegistry::build(&test_config());
        assert!(registry.resolve("/images/a.jpg").is_none());
    }
}

// src/core/rules/source.rs

//! Renders a rule's source templates into concrete fetch targets.

use crate::config::{BucketConfig, SourceAuth, SourceConfig, SourceKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// One concrete fetch target produced from a source template and captures.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub kind: SourceKind,
    pub priority: u32,
    /// The fully rendered URL. Bucket keys are rendered under the configured
    /// bucket endpoint so the transformer can pull them like any other source.
    pub url: String,
    pub auth: Option<SourceAuth>,
}

impl ResolvedSource {
    /// Substitutes `{name}` placeholders with captures; missing captures
    /// substitute as empty strings.
    pub fn render(
        source: &SourceConfig,
        captures: &HashMap<String, String>,
        bucket: &BucketConfig,
    ) -> Self {
        let rendered = PLACEHOLDER.replace_all(&source.path_template, |caps: &regex::Captures| {
            captures
                .get(&caps[1])
                .cloned()
                .unwrap_or_default()
        });

        let url = match source.kind {
            SourceKind::Bucket => {
                let base = bucket.base_url.as_deref().unwrap_or_default();
                format!("{}/{}", base.trim_end_matches('/'), rendered.trim_start_matches('/'))
            }
            SourceKind::Remote | SourceKind::Fallback => rendered.into_owned(),
        };

        // Bucket sources inherit the bucket endpoint's auth unless they carry their own.
        let auth = source
            .auth
            .clone()
            .or_else(|| match source.kind {
                SourceKind::Bucket => bucket.auth.clone(),
                _ => None,
            });

        Self {
            kind: source.kind,
            priority: source.priority,
            url,
            auth,
        }
    }
}

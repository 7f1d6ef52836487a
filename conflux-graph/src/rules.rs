//! Connection policy: which `(source kind, target kind, handle)` triples may
//! form an edge.
//!
//! The allow-list is product configuration, not engine logic. The engine only
//! asks [`ConnectionPolicy::allows`]; callers may ship their own rule table
//! or extend [`ConnectionPolicy::standard`].

use crate::model::NodeKind;
use serde::{Deserialize, Serialize};

/// One allowed `(source, target, handle)` combination. A `None` handle
/// matches any target handle, including none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRule {
    pub source: NodeKind,
    pub target: NodeKind,
    pub target_handle: Option<String>,
}

impl ConnectionRule {
    pub fn any_handle(source: NodeKind, target: NodeKind) -> Self {
        Self {
            source,
            target,
            target_handle: None,
        }
    }

    pub fn on_handle(source: NodeKind, target: NodeKind, handle: impl Into<String>) -> Self {
        Self {
            source,
            target,
            target_handle: Some(handle.into()),
        }
    }

    fn matches(&self, source: NodeKind, target: NodeKind, target_handle: Option<&str>) -> bool {
        if self.source != source || self.target != target {
            return false;
        }
        match &self.target_handle {
            None => true,
            Some(required) => target_handle == Some(required.as_str()),
        }
    }
}

/// Immutable rule table consulted by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    rules: Vec<ConnectionRule>,
}

impl ConnectionPolicy {
    pub fn new(rules: Vec<ConnectionRule>) -> Self {
        Self { rules }
    }

    /// Policy with no rules; every typed connection is rejected. Useful as a
    /// base for building custom tables.
    pub fn deny_all() -> Self {
        Self { rules: Vec::new() }
    }

    /// The product default table.
    ///
    /// Shape of the table: text prompts feed every generator; images feed
    /// image/video generators; audio feeds transcription and soundtrack
    /// handles; file and tweet nodes are source-only; video nodes are
    /// sink-only; drop placeholders take no edges at all.
    pub fn standard() -> Self {
        use NodeKind::*;
        Self::new(vec![
            // Prompt text into generators.
            ConnectionRule::any_handle(Text, Text),
            ConnectionRule::any_handle(Text, Image),
            ConnectionRule::any_handle(Text, Audio),
            ConnectionRule::any_handle(Text, Video),
            ConnectionRule::any_handle(Text, Code),
            // Image-to-image and image-to-video pipelines.
            ConnectionRule::any_handle(Image, Image),
            ConnectionRule::on_handle(Image, Video, "frames"),
            // Audio feeds transcription and soundtrack inputs only.
            ConnectionRule::on_handle(Audio, Text, "transcript"),
            ConnectionRule::on_handle(Audio, Video, "audio"),
            // Code chains and code-to-text explanations.
            ConnectionRule::any_handle(Code, Code),
            ConnectionRule::any_handle(Code, Text),
            // Uploads and embedded tweets seed prompts; never targets.
            ConnectionRule::any_handle(File, Text),
            ConnectionRule::any_handle(File, Image),
            ConnectionRule::any_handle(File, Code),
            ConnectionRule::any_handle(Tweet, Text),
        ])
    }

    pub fn with_rule(mut self, rule: ConnectionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// True if some rule admits the triple.
    pub fn allows(&self, source: NodeKind, target: NodeKind, target_handle: Option<&str>) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.matches(source, target, target_handle))
    }

    pub fn rules(&self) -> &[ConnectionRule] {
        &self.rules
    }
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

// ===================================================================
// Tests
// ===================================================================

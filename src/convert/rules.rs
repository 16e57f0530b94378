//! Ordered key rewrite rules
//!
//! A [`RuleTable`] is plain data: a scope prefix plus an ordered list of
//! [`RewriteRule`]s. Rules are applied in sequence and each rule sees the
//! output of the previous one, so block-level renames come first and
//! segment-level renames follow.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a rule matches a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KeyPattern {
    /// Whole key equals the pattern
    Exact(String),
    /// Key starts with the pattern
    Prefix(String),
    /// Pattern occurs anywhere in the key (every occurrence is replaced)
    Substring(String),
    /// Key ends with the pattern
    Suffix(String),
}

/// Tensor layout change attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reshape {
    /// `[out, in, 1, 1]` 1x1 convolution weight to `[out, in]` linear weight.
    /// Lower-rank tensors (biases) pass through.
    SqueezeConv1x1,
}

impl Reshape {
    /// Apply the layout change to the tensor stored under `key`
    pub fn apply(self, key: &str, tensor: &Tensor) -> Result<Tensor> {
        match self {
            Reshape::SqueezeConv1x1 => match tensor.dims() {
                [out, inp, 1, 1] => Ok(tensor.reshape((*out, *inp))?),
                [_, _, _, _] => Err(Error::Conversion {
                    key: key.to_string(),
                    detail: format!(
                        "expected a 1x1 convolution weight, got shape {:?}",
                        tensor.dims()
                    ),
                }),
                _ => Ok(tensor.clone()),
            },
        }
    }
}

/// A single rewrite: `pattern` is replaced by `replacement`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: KeyPattern,
    pub replacement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reshape: Option<Reshape>,
}

impl RewriteRule {
    pub fn exact(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(KeyPattern::Exact(from.into()), to)
    }

    pub fn prefix(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(KeyPattern::Prefix(from.into()), to)
    }

    pub fn substring(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(KeyPattern::Substring(from.into()), to)
    }

    pub fn suffix(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(KeyPattern::Suffix(from.into()), to)
    }

    fn new(pattern: KeyPattern, to: impl Into<String>) -> Self {
        Self {
            pattern,
            replacement: to.into(),
            reshape: None,
        }
    }

    /// Attach a tensor reshape to this rule
    pub fn with_reshape(mut self, reshape: Reshape) -> Self {
        self.reshape = Some(reshape);
        self
    }

    /// Apply this rule to a key, returning the rewritten key if it matched
    pub fn apply(&self, key: &str) -> Option<String> {
        match &self.pattern {
            KeyPattern::Exact(from) => (key == from).then(|| self.replacement.clone()),
            KeyPattern::Prefix(from) => key
                .strip_prefix(from.as_str())
                .map(|rest| format!("{}{}", self.replacement, rest)),
            KeyPattern::Substring(from) => key
                .contains(from.as_str())
                .then(|| key.replace(from.as_str(), &self.replacement)),
            KeyPattern::Suffix(from) => key
                .strip_suffix(from.as_str())
                .map(|base| format!("{}{}", base, self.replacement)),
        }
    }
}

/// Result of running a key through a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub key: String,
    pub reshapes: Vec<Reshape>,
}

/// Scope prefix plus ordered rules for one target sub-model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    /// Keys outside this prefix belong to another sub-model
    pub scope: String,
    pub rules: Vec<RewriteRule>,
}

impl RuleTable {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            rules: Vec::new(),
        }
    }

    pub fn push(&mut self, rule: RewriteRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn in_scope(&self, key: &str) -> bool {
        key.starts_with(&self.scope)
    }

    /// Rewrite `key`, or `None` if it is out of scope
    pub fn apply(&self, key: &str) -> Option<Rewrite> {
        let mut current = key.strip_prefix(self.scope.as_str())?.to_string();
        let mut reshapes = Vec::new();

        for rule in &self.rules {
            if let Some(mapped) = rule.apply(&current) {
                current = mapped;
                if let Some(reshape) = rule.reshape {
                    reshapes.push(reshape);
                }
            }
        }

        Some(Rewrite {
            key: current,
            reshapes,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

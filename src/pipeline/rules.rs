//! Keyword rules used by the fallback classifier.
//!
//! Rules are checked in order against the subject, case-insensitively,
//! first match wins:
//! - billing words → "invoice"
//! - order words → "order" (positive sentiment)
//! - help words → "support"
//! - urgency words → "urgent"
//!
//! Anything else is "general" with neutral sentiment.

use regex::Regex;
use tracing::debug;

/// Category used when no rule matches.
pub const DEFAULT_CATEGORY: &str = "general";

/// Sentiment used when the matching rule does not set one.
pub const DEFAULT_SENTIMENT: &str = "neutral";

/// A single subject rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    /// Compiled, case-insensitive regex.
    pub regex: Regex,
    pub category: String,
    pub sentiment: String,
}

/// Outcome of evaluating the rules against a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub category: String,
    pub sentiment: String,
}

/// Ordered keyword rules.
pub struct KeywordRules {
    rules: Vec<KeywordRule>,
}

impl KeywordRules {
    /// The default rule set (English and French keywords).
    pub fn default_rules() -> Self {
        let rules = vec![
            KeywordRule {
                regex: Regex::new(r"(?i)(invoice|facture|bill)").unwrap(),
                category: "invoice".into(),
                sentiment: DEFAULT_SENTIMENT.into(),
            },
            KeywordRule {
                regex: Regex::new(r"(?i)(order|commande)").unwrap(),
                category: "order".into(),
                sentiment: "positive".into(),
            },
            KeywordRule {
                regex: Regex::new(r"(?i)(support|help|problème|problem)").unwrap(),
                category: "support".into(),
                sentiment: DEFAULT_SENTIMENT.into(),
            },
            KeywordRule {
                regex: Regex::new(r"(?i)(urgent|important)").unwrap(),
                category: "urgent".into(),
                sentiment: DEFAULT_SENTIMENT.into(),
            },
        ];
        Self { rules }
    }

    /// An empty rule set; everything is "general".
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a custom rule, evaluated after the existing ones.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        category: &str,
        sentiment: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(KeywordRule {
            regex: Regex::new(&format!("(?i){pattern}"))?,
            category: category.into(),
            sentiment: sentiment.into(),
        });
        Ok(())
    }

    /// Evaluate a subject. Always returns a match; unmatched subjects get
    /// the default category.
    pub fn evaluate(&self, subject: &str) -> RuleMatch {
        for rule in &self.rules {
            if rule.regex.is_match(subject) {
                debug!(subject, category = %rule.category, "Subject matched keyword rule");
                return RuleMatch {
                    category: rule.category.clone(),
                    sentiment: rule.sentiment.clone(),
                };
            }
        }

        RuleMatch {
            category: DEFAULT_CATEGORY.into(),
            sentiment: DEFAULT_SENTIMENT.into(),
        }
    }
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self::default_rules()
    }
}

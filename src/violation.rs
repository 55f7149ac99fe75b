//! Violation rules and matching.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

/// A detection must be strictly above this confidence to raise an alert.
pub const DEFAULT_RULE_CONFIDENCE: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(anyhow!("unknown priority '{}'", other)),
        }
    }
}

/// Alert template for one detection class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationRule {
    /// Detection class label this rule applies to.
    pub label: String,
    pub title: String,
    pub law_reference: String,
    pub priority: Priority,
}

impl ViolationRule {
    pub fn new(label: &str, title: &str, law_reference: &str, priority: Priority) -> Self {
        Self {
            label: label.to_string(),
            title: title.to_string(),
            law_reference: law_reference.to_string(),
            priority,
        }
    }
}

/// Built-in rule table.
pub fn default_rules() -> Vec<ViolationRule> {
    vec![
        ViolationRule::new(
            "car",
            "Неправильная парковка",
            "КоАП РФ Статья 12.19",
            Priority::Low,
        ),
        ViolationRule::new(
            "garbage",
            "Мусор в общественном месте",
            "КоАП РФ Статья 8.2",
            Priority::Medium,
        ),
        ViolationRule::new(
            "person",
            "Нарушение общественного порядка",
            "КоАП РФ Статья 20.1",
            Priority::Medium,
        ),
    ]
}

/// Read-only rule lookup keyed by class label.
#[derive(Clone, Debug)]
pub struct RuleTable {
    rules: HashMap<String, ViolationRule>,
}

impl RuleTable {
    /// Rejects empty or duplicate labels.
    pub fn new(rules: Vec<ViolationRule>) -> Result<Self> {
        let mut map = HashMap::with_capacity(rules.len());
        for rule in rules {
            if rule.label.trim().is_empty() {
                return Err(anyhow!("violation rule label cannot be empty"));
            }
            if rule.title.trim().is_empty() {
                return Err(anyhow!("violation rule '{}' has an empty title", rule.label));
            }
            let label = rule.label.clone();
            if map.insert(label.clone(), rule).is_some() {
                return Err(anyhow!("duplicate violation rule for '{}'", label));
            }
        }
        Ok(Self { rules: map })
    }

    pub fn get(&self, label: &str) -> Option<&ViolationRule> {
        self.rules.get(label)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        let rules = default_rules()
            .into_iter()
            .map(|rule| (rule.label.clone(), rule))
            .collect();
        Self { rules }
    }
}

/// A detection that qualified for an alert, with the rule it matched.
#[derive(Clone, Debug, PartialEq)]
pub struct ViolationMatch {
    pub rule: ViolationRule,
    pub detection: Detection,
}

/// Picks at most one violation per frame.
#[derive(Clone, Debug)]
pub struct ViolationMatcher {
    rules: RuleTable,
    min_confidence: f32,
}

impl ViolationMatcher {
    pub fn new(rules: RuleTable) -> Self {
        Self {
            rules,
            min_confidence: DEFAULT_RULE_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// First detection, in the given order, whose label has a rule and whose
    /// confidence is strictly above the gate. Later detections are not examined.
    pub fn find_match(&self, detections: &[Detection]) -> Option<ViolationMatch> {
        detections.iter().find_map(|detection| {
            let rule = self.rules.get(&detection.label)?;
            (detection.confidence > self.min_confidence).then(|| ViolationMatch {
                rule: rule.clone(),
                detection: detection.clone(),
            })
        })
    }
}

//! Validation outcome model.
//!
//! Validators (rule engines) live outside this crate; they all report through
//! [`ValidationOutcome`], which is what dispatchers and callers inspect. The
//! model is deliberately plain data so it can be rendered as field-level
//! feedback or serialized across a boundary unchanged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::value_object::ValueObject;

/// How serious a validation fault is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single rule violation against one property of the validated target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFault {
    /// Dotted path of the offending property (e.g. `lines[0].quantity`).
    pub property: String,
    pub message: String,
    pub severity: Severity,
    /// Value that was rejected, if the validator captured it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ValidationFault {
    /// Error-severity fault with no attempted value or code.
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
            severity: Severity::Error,
            attempted_value: None,
            error_code: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_attempted_value(mut self, value: impl Into<JsonValue>) -> Self {
        self.attempted_value = Some(value.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

impl core::fmt::Display for ValidationFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

impl ValueObject for ValidationFault {}

/// Result of running one or more validators against a target.
///
/// Validity is derived: an outcome is valid iff it carries no faults. Faults
/// keep the order in which validators reported them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    faults: Vec<ValidationFault>,
    rule_sets_executed: BTreeSet<String>,
}

impl ValidationOutcome {
    /// An empty (valid) outcome.
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn from_faults(faults: impl IntoIterator<Item = ValidationFault>) -> Self {
        Self {
            faults: faults.into_iter().collect(),
            rule_sets_executed: BTreeSet::new(),
        }
    }

    pub fn with_rule_set(mut self, rule_set: impl Into<String>) -> Self {
        self.rule_sets_executed.insert(rule_set.into());
        self
    }

    pub fn push(&mut self, fault: ValidationFault) {
        self.faults.push(fault);
    }

    pub fn record_rule_set(&mut self, rule_set: impl Into<String>) {
        self.rule_sets_executed.insert(rule_set.into());
    }

    pub fn is_valid(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn faults(&self) -> &[ValidationFault] {
        &self.faults
    }

    pub fn into_faults(self) -> Vec<ValidationFault> {
        self.faults
    }

    pub fn rule_sets_executed(&self) -> &BTreeSet<String> {
        &self.rule_sets_executed
    }

    /// Faults reported against one property path.
    pub fn faults_for<'a>(&'a self, property: &'a str) -> impl Iterator<Item = &'a ValidationFault> {
        self.faults.iter().filter(move |f| f.property == property)
    }

    /// Faults at or above the given severity (`Error` is the most severe).
    pub fn faults_at_least(&self, severity: Severity) -> impl Iterator<Item = &ValidationFault> {
        self.faults.iter().filter(move |f| f.severity <= severity)
    }

    /// Group messages by property path, preserving report order per property.
    pub fn to_dictionary(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for fault in &self.faults {
            out.entry(fault.property.clone())
                .or_default()
                .push(fault.message.clone());
        }
        out
    }

    /// Union with another outcome: faults are concatenated (self first) and the
    /// executed rule sets are merged without duplicates.
    pub fn merge(mut self, other: ValidationOutcome) -> Self {
        self.faults.extend(other.faults);
        self.rule_sets_executed.extend(other.rule_sets_executed);
        self
    }

    /// Convert into `Err` when any fault is present.
    pub fn into_result(self) -> Result<Self, ValidationError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ValidationError::new(self.faults))
        }
    }
}

impl FromIterator<ValidationOutcome> for ValidationOutcome {
    fn from_iter<I: IntoIterator<Item = ValidationOutcome>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ValidationOutcome::valid(), ValidationOutcome::merge)
    }
}

/// Structured validation failure carrying every fault that caused it.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("validation failed with {} fault(s): {}", .faults.len(), summarize(.faults))]
pub struct ValidationError {
    faults: Vec<ValidationFault>,
}

impl ValidationError {
    pub fn new(faults: Vec<ValidationFault>) -> Self {
        Self { faults }
    }

    pub fn faults(&self) -> &[ValidationFault] {
        &self.faults
    }

    pub fn into_faults(self) -> Vec<ValidationFault> {
        self.faults
    }
}

fn summarize(faults: &[ValidationFault]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_outcome_is_valid() {
        let outcome = ValidationOutcome::valid();
        assert!(outcome.is_valid());
        assert!(outcome.clone().into_result().is_ok());
    }

    #[test]
    fn union_of_two_outcomes_keeps_both_faults_and_dedupes_rule_sets() {
        let left = ValidationOutcome::from_faults([ValidationFault::new("name", "required")])
            .with_rule_set("default")
            .with_rule_set("create");
        let right = ValidationOutcome::from_faults([ValidationFault::new("qty", "must be positive")])
            .with_rule_set("default");

        let merged = left.merge(right);

        assert!(!merged.is_valid());
        let props: Vec<_> = merged.faults().iter().map(|f| f.property.as_str()).collect();
        assert_eq!(props, vec!["name", "qty"]);
        let sets: Vec<_> = merged.rule_sets_executed().iter().cloned().collect();
        assert_eq!(sets, vec!["create".to_string(), "default".to_string()]);
    }

    #[test]
    fn into_result_carries_exactly_the_faults() {
        let fault = ValidationFault::new("email", "invalid")
            .with_attempted_value("nope")
            .with_code("EmailValidator");
        let err = ValidationOutcome::from_faults([fault.clone()])
            .into_result()
            .unwrap_err();
        assert_eq!(err.faults(), &[fault]);
        assert!(err.to_string().contains("email: invalid"));
    }

    #[test]
    fn dictionary_groups_messages_by_property() {
        let outcome = ValidationOutcome::from_faults([
            ValidationFault::new("name", "required"),
            ValidationFault::new("name", "too short"),
            ValidationFault::new("qty", "must be positive").with_severity(Severity::Warning),
        ]);

        let dict = outcome.to_dictionary();
        assert_eq!(dict["name"], vec!["required", "too short"]);
        assert_eq!(outcome.faults_for("qty").count(), 1);
        assert_eq!(outcome.faults_at_least(Severity::Error).count(), 2);
    }

    fn build(props: &[String], sets: &BTreeSet<String>) -> ValidationOutcome {
        let mut o = ValidationOutcome::from_faults(
            props.iter().map(|p| ValidationFault::new(p.clone(), "bad")),
        );
        for s in sets {
            o.record_rule_set(s.clone());
        }
        o
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: merging never loses a fault and never duplicates a rule set.
        #[test]
        fn merge_preserves_fault_count_and_rule_set_union(
            left_faults in prop::collection::vec("[a-z]{1,6}", 0..5),
            right_faults in prop::collection::vec("[a-z]{1,6}", 0..5),
            left_sets in prop::collection::btree_set("[a-c]", 0..3),
            right_sets in prop::collection::btree_set("[a-c]", 0..3),
        ) {
            let merged = build(&left_faults, &left_sets).merge(build(&right_faults, &right_sets));

            prop_assert_eq!(merged.faults().len(), left_faults.len() + right_faults.len());
            let expected: BTreeSet<String> = left_sets.union(&right_sets).cloned().collect();
            prop_assert_eq!(merged.rule_sets_executed(), &expected);
            prop_assert_eq!(merged.is_valid(), left_faults.is_empty() && right_faults.is_empty());
        }
    }
}

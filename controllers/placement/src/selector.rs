//! Label selector evaluation.
//!
//! `LabelSelector` wire objects are compiled once into typed requirements so
//! the hot path never re-validates operator strings. Compilation is also
//! where malformed selectors are detected.

use crds::{LabelSelector, Placement};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Label map as carried in object metadata.
pub type Labels = BTreeMap<String, String>;

/// Reasons a selector cannot be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// Operator outside `In`, `NotIn`, `Exists`, `DoesNotExist`
    #[error("unknown operator {operator:?} for key {key:?}")]
    UnknownOperator {
        /// Label key
        key: String,
        /// Offending operator
        operator: String,
    },

    /// `In`/`NotIn` without values
    #[error("operator {operator} for key {key:?} requires at least one value")]
    MissingValues {
        /// Label key
        key: String,
        /// Operator name
        operator: &'static str,
    },

    /// `Exists`/`DoesNotExist` with values
    #[error("operator {operator} for key {key:?} must not have values")]
    UnexpectedValues {
        /// Label key
        key: String,
        /// Operator name
        operator: &'static str,
    },

    /// Requirement with an empty key
    #[error("label key must not be empty")]
    EmptyKey,

    /// Label key or value that is not valid Kubernetes label syntax
    #[error("invalid label {part} {value:?}: {reason}")]
    InvalidLabel {
        /// `key` or `value`
        part: &'static str,
        /// Offending text
        value: String,
        /// Violated rule
        reason: &'static str,
    },
}

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Alphanumeric at both ends, `-`, `_` or `.` in between, at most 63 characters.
fn qualified_name_error(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("name part must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Some("name part must be at most 63 characters");
    }
    let bytes = name.as_bytes();
    let alnum_ends = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let valid_chars = bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !(alnum_ends && valid_chars) {
        return Some("must consist of alphanumerics, '-', '_' or '.' and start and end with an alphanumeric");
    }
    None
}

/// Lowercase RFC 1123 subdomain, at most 253 characters.
fn dns_subdomain_error(prefix: &str) -> Option<&'static str> {
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
        return Some("prefix must be a DNS subdomain of 1 to 253 characters");
    }
    let label_ok = |label: &str| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes.iter().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || *b == b'-')
    };
    if prefix.split('.').all(label_ok) {
        None
    } else {
        Some("prefix must be a lowercase DNS subdomain")
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    if key.is_empty() {
        return Err(SelectorError::EmptyKey);
    }
    let reason = match key.split_once('/') {
        Some((prefix, name)) => dns_subdomain_error(prefix).or_else(|| qualified_name_error(name)),
        None => qualified_name_error(key),
    };
    match reason {
        Some(reason) => Err(SelectorError::InvalidLabel {
            part: "key",
            value: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn validate_value(value: &str) -> Result<(), SelectorError> {
    // Empty values are legal
    if value.is_empty() {
        return Ok(());
    }
    match qualified_name_error(value) {
        Some(reason) => Err(SelectorError::InvalidLabel {
            part: "value",
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => labels.get(&self.key).is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// Inverted-index entry a selector can be found under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    /// Objects carrying `key=value`
    Equals(String, String),
    /// Objects carrying `key` with any value
    HasKey(String),
}

/// A compiled label selector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Compiles a wire selector, rejecting malformed requirements.
    pub fn compile(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = Vec::with_capacity(
            selector.match_labels.len() + selector.match_expressions.len(),
        );

        for (key, value) in &selector.match_labels {
            validate_key(key)?;
            validate_value(value)?;
            requirements.push(Requirement {
                key: key.clone(),
                operator: Operator::In,
                values: BTreeSet::from([value.clone()]),
            });
        }

        for expr in &selector.match_expressions {
            validate_key(&expr.key)?;
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(SelectorError::UnknownOperator {
                        key: expr.key.clone(),
                        operator: other.to_string(),
                    });
                }
            };
            match operator {
                Operator::In | Operator::NotIn if expr.values.is_empty() => {
                    return Err(SelectorError::MissingValues {
                        key: expr.key.clone(),
                        operator: if operator == Operator::In { "In" } else { "NotIn" },
                    });
                }
                Operator::Exists | Operator::DoesNotExist if !expr.values.is_empty() => {
                    return Err(SelectorError::UnexpectedValues {
                        key: expr.key.clone(),
                        operator: if operator == Operator::Exists { "Exists" } else { "DoesNotExist" },
                    });
                }
                _ => {}
            }
            for value in &expr.values {
                validate_value(value)?;
            }
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
                values: expr.values.iter().cloned().collect(),
            });
        }

        Ok(Self { requirements })
    }

    /// True when every requirement holds for `labels`.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Terms under which this selector must be indexed.
    ///
    /// Any object this selector matches carries at least one of the returned
    /// terms. `None` means no positive requirement exists (empty selector, or
    /// only `NotIn`/`DoesNotExist`) and the selector must be consulted for
    /// every object.
    pub fn index_terms(&self) -> Option<Vec<Term>> {
        let narrowest_in = self
            .requirements
            .iter()
            .filter(|r| r.operator == Operator::In)
            .min_by_key(|r| r.values.len());
        if let Some(req) = narrowest_in {
            return Some(
                req.values
                    .iter()
                    .map(|v| Term::Equals(req.key.clone(), v.clone()))
                    .collect(),
            );
        }
        self.requirements
            .iter()
            .find(|r| r.operator == Operator::Exists)
            .map(|r| vec![Term::HasKey(r.key.clone())])
    }
}

/// How a set of selectors is registered in an inverted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRegistration {
    /// Never matches anything
    Nothing,
    /// Candidate only for objects carrying one of these terms
    Terms(BTreeSet<Term>),
    /// Candidate for every object in the cluster
    Fallback,
}

impl IndexRegistration {
    fn for_selectors<'a>(selectors: impl IntoIterator<Item = &'a Selector>) -> Self {
        let mut terms = BTreeSet::new();
        let mut any = false;
        for selector in selectors {
            any = true;
            match selector.index_terms() {
                Some(selector_terms) => terms.extend(selector_terms),
                None => return Self::Fallback,
            }
        }
        if any { Self::Terms(terms) } else { Self::Nothing }
    }
}

/// Both selectors of a Placement, compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSelectors {
    locations: Vec<Selector>,
    namespaces: Option<Selector>,
}

impl PlacementSelectors {
    /// Compiles the selectors of `placement`.
    pub fn compile(placement: &Placement) -> Result<Self, SelectorError> {
        let locations = placement
            .spec
            .location_selectors
            .iter()
            .map(Selector::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let namespaces = placement
            .spec
            .namespace_selector
            .as_ref()
            .map(Selector::compile)
            .transpose()?;
        Ok(Self { locations, namespaces })
    }

    /// True when any location selector matches.
    pub fn matches_location(&self, labels: &Labels) -> bool {
        self.locations.iter().any(|s| s.matches(labels))
    }

    /// True when the namespace selector is present and matches.
    pub fn matches_namespace(&self, labels: &Labels) -> bool {
        self.namespaces.as_ref().is_some_and(|s| s.matches(labels))
    }

    /// Location index registration.
    pub fn location_registration(&self) -> IndexRegistration {
        IndexRegistration::for_selectors(&self.locations)
    }

    /// Namespace index registration.
    pub fn namespace_registration(&self) -> IndexRegistration {
        IndexRegistration::for_selectors(self.namespaces.as_ref())
    }
}

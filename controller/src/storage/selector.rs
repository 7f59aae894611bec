//! Label selectors for list queries

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::OtaError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// Conjunction of label requirements, e.g. `vehicle=veh1,tier!=canary`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selects every record
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Equals(key.into(), value.into())],
        }
    }

    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Parse the comma separated form. An empty string selects everything.
    pub fn parse(input: &str) -> Result<Self, OtaError> {
        let mut requirements = Vec::new();
        if input.trim().is_empty() {
            return Ok(Self { requirements });
        }

        for term in input.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(OtaError::ValidationError(format!(
                    "empty term in selector {:?}",
                    input
                )));
            }

            let requirement = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(parse_key(k, input)?, parse_value(v, input)?)
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(parse_key(k, input)?, parse_value(v, input)?)
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(parse_key(k, input)?, parse_value(v, input)?)
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(parse_key(k, input)?)
            } else {
                Requirement::Exists(parse_key(term, input)?)
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

fn parse_key(raw: &str, input: &str) -> Result<String, OtaError> {
    let key = raw.trim();
    if key.is_empty() || !key.chars().all(is_label_char) {
        return Err(OtaError::ValidationError(format!(
            "invalid label key {:?} in selector {:?}",
            key, input
        )));
    }
    Ok(key.to_string())
}

fn parse_value(raw: &str, input: &str) -> Result<String, OtaError> {
    let value = raw.trim();
    if !value.chars().all(is_label_char) {
        return Err(OtaError::ValidationError(format!(
            "invalid label value {:?} in selector {:?}",
            value, input
        )));
    }
    Ok(value.to_string())
}

impl FromStr for Selector {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

//! Equality-based label selectors: `k=v`, `k==v`, `k!=v`, bare-key
//! existence, `!k` absence, joined by commas (conjunction). This is the
//! subset the platform actually uses; set-based expressions are not
//! supported.

use keel_core::Labels;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid selector requirement \"{requirement}\"")]
pub struct SelectorParseError {
    pub requirement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Exists(String),
    NotExists(String),
    Equals(String, String),
    NotEquals(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a selector string. An empty string selects everything.
    pub fn parse(input: &str) -> Result<Self, SelectorParseError> {
        let mut requirements = Vec::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                if input.trim().is_empty() {
                    continue;
                }
                return Err(SelectorParseError { requirement: part.to_string() });
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
            Requirement::Equals(k, v) => labels.get(k).map(|x| x == v).unwrap_or(false),
            Requirement::NotEquals(k, v) => labels.get(k).map(|x| x != v).unwrap_or(true),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

fn parse_requirement(part: &str) -> Result<Requirement, SelectorParseError> {
    let invalid = || SelectorParseError { requirement: part.to_string() };

    if let Some((key, value)) = part.split_once("!=") {
        let (key, value) = (key.trim(), value.trim());
        if !valid_key(key) || !valid_value(value) {
            return Err(invalid());
        }
        return Ok(Requirement::NotEquals(key.to_string(), value.to_string()));
    }
    if let Some((key, value)) = part.split_once("==").or_else(|| part.split_once('=')) {
        let (key, value) = (key.trim(), value.trim());
        if !valid_key(key) || !valid_value(value) {
            return Err(invalid());
        }
        return Ok(Requirement::Equals(key.to_string(), value.to_string()));
    }
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        if !valid_key(key) {
            return Err(invalid());
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if valid_key(part) {
        return Ok(Requirement::Exists(part.to_string()));
    }
    Err(invalid())
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn valid_value(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

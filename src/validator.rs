//! Declarative field validation.
//!
//! Rules are registered per table and per field; tables without rules are
//! not validated at all. Each operation returns a fresh [`ValidationReport`]
//! so validating twice with the same input yields the same errors.
use crate::config::FieldRuleTable;
use crate::core::{FieldErrors, Record, Result, TablekitError, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("email pattern compiles")
});

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://[^\s/?#]+[^\s]*$").expect("url pattern compiles")
});

/// Kind of operation the payload is validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A single field rule
#[derive(Debug, Clone)]
pub enum Rule {
    Required(bool),
    /// One of int, float, string, bool, email, url, ip, date, array
    Type(String),
    Min(f64),
    Max(f64),
    Pattern(Regex),
    Enum(Vec<String>),
}

impl Rule {
    /// Compiles a pattern rule. Patterns written as `/.../flags` have their
    /// delimiters stripped; an `i` flag turns on case-insensitive matching.
    pub fn pattern(pattern: &str) -> Result<Rule> {
        let source = match strip_delimiters(pattern) {
            Some((body, flags)) if flags.contains('i') => format!("(?i){}", body),
            Some((body, _)) => body.to_string(),
            None => pattern.to_string(),
        };
        Regex::new(&source)
            .map(Rule::Pattern)
            .map_err(|e| TablekitError::Config(format!("invalid pattern {}: {}", pattern, e)))
    }

    pub fn enumeration<I, S>(allowed: I) -> Rule
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Rule::Enum(allowed.into_iter().map(Into::into).collect())
    }

    /// Builds a rule from a config entry. Unknown kinds yield `None`.
    pub fn from_toml(kind: &str, parameter: &toml::Value) -> Result<Option<Rule>> {
        let bad = || TablekitError::Config(format!("invalid parameter for rule {}: {}", kind, parameter));
        let number = || match parameter {
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::Float(f) => Some(*f),
            _ => None,
        };
        let rule = match kind {
            "required" => Rule::Required(parameter.as_bool().ok_or_else(bad)?),
            "type" => Rule::Type(parameter.as_str().ok_or_else(bad)?.to_string()),
            "min" => Rule::Min(number().ok_or_else(bad)?),
            "max" => Rule::Max(number().ok_or_else(bad)?),
            "pattern" => Rule::pattern(parameter.as_str().ok_or_else(bad)?)?,
            "enum" => {
                let items = parameter.as_array().ok_or_else(bad)?;
                Rule::Enum(
                    items
                        .iter()
                        .map(|item| match item {
                            toml::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                )
            }
            _ => return Ok(None),
        };
        Ok(Some(rule))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Required(_) => "required",
            Rule::Type(_) => "type",
            Rule::Min(_) => "min",
            Rule::Max(_) => "max",
            Rule::Pattern(_) => "pattern",
            Rule::Enum(_) => "enum",
        }
    }

    /// Evaluation position of the rule kind.
    fn rank(&self) -> u8 {
        match self {
            Rule::Required(_) => 0,
            Rule::Type(_) => 1,
            Rule::Min(_) => 2,
            Rule::Max(_) => 3,
            Rule::Pattern(_) => 4,
            Rule::Enum(_) => 5,
        }
    }

    fn parameter(&self) -> String {
        match self {
            Rule::Required(b) => b.to_string(),
            Rule::Type(t) => t.clone(),
            Rule::Min(n) | Rule::Max(n) => format_number(*n),
            Rule::Pattern(re) => re.as_str().to_string(),
            Rule::Enum(items) => items.join(", "),
        }
    }

    /// Whether `value` (absent when `None`) violates this rule.
    fn is_violated(&self, value: Option<&Value>) -> bool {
        let present = value.filter(|v| !v.is_null());
        match self {
            Rule::Required(required) => *required && value.map_or(true, Value::is_blank),
            Rule::Type(kind) => present.map_or(false, |v| !matches_type(v, kind)),
            Rule::Min(limit) => present.map_or(false, |v| measure(v).map_or(false, |m| m < *limit)),
            Rule::Max(limit) => present.map_or(false, |v| measure(v).map_or(false, |m| m > *limit)),
            Rule::Pattern(re) => present.map_or(false, |v| !re.is_match(&v.to_string())),
            Rule::Enum(allowed) => present.map_or(false, |v| {
                let text = v.to_string();
                !allowed.iter().any(|a| *a == text)
            }),
        }
    }
}

fn strip_delimiters(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let flags = &rest[end + 1..];
    if flags.chars().all(|c| c.is_ascii_alphabetic()) {
        Some((&rest[..end], flags))
    } else {
        None
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Numbers and numeric text are measured by value, other text by byte
/// length.
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::Text(s) => Some(
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .unwrap_or(s.len() as f64),
        ),
        Value::Int(_) | Value::Float(_) => value.as_f64(),
        _ => None,
    }
}

fn matches_type(value: &Value, kind: &str) -> bool {
    if let Value::List(items) = value {
        return kind == "array" || (kind == "date" && parse_date(&join_date_parts(items)));
    }
    match kind {
        "int" | "integer" => match value {
            Value::Int(_) => true,
            Value::Float(f) => f.fract() == 0.0,
            Value::Text(s) => s.trim().parse::<i64>().is_ok(),
            _ => false,
        },
        "float" | "double" => match value {
            Value::Int(_) | Value::Float(_) => true,
            Value::Text(_) => value.is_numeric(),
            _ => false,
        },
        "string" => matches!(value, Value::Text(_) | Value::Int(_) | Value::Float(_)),
        "bool" | "boolean" => match value {
            Value::Bool(_) => true,
            Value::Int(i) => *i == 0 || *i == 1,
            Value::Text(s) => s == "0" || s == "1",
            _ => false,
        },
        "email" => EMAIL.is_match(&value.to_string()),
        "url" => URL.is_match(&value.to_string()),
        "ip" => IpAddr::from_str(&value.to_string()).is_ok(),
        "date" => parse_date(&value.to_string()),
        "array" => false,
        _ => true,
    }
}

fn join_date_parts(items: &[Value]) -> String {
    items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("-")
}

fn parse_date(text: &str) -> bool {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
        || DateTime::parse_from_rfc3339(text).is_ok()
        || NaiveDate::parse_from_str(text, "%d-%m-%Y").is_ok()
        || NaiveDate::parse_from_str(text, "%Y/%m/%d").is_ok()
}

/// Outcome of one validation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    errors: FieldErrors,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Field name to the messages produced for it
    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    /// Converts a failed report into `TablekitError::Validation`.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(TablekitError::Validation(self.errors))
        }
    }
}

/// Per-table, per-field rule registry
#[derive(Debug, Clone, Default)]
pub struct FieldValidator {
    rules: HashMap<String, Vec<(String, Vec<Rule>)>>,
    messages: HashMap<String, String>,
}

impl FieldValidator {
    pub fn new() -> Self {
        FieldValidator::default()
    }

    /// Registers the rules of `table`, replacing any previous set.
    pub fn add_rules<I, F>(&mut self, table: &str, field_rules: I)
    where
        I: IntoIterator<Item = (F, Vec<Rule>)>,
        F: Into<String>,
    {
        let fields = field_rules
            .into_iter()
            .map(|(field, mut rules)| {
                rules.sort_by_key(Rule::rank);
                (field.into(), rules)
            })
            .collect();
        self.rules.insert(table.to_string(), fields);
    }

    /// Registers rules read from the `[validation]` config section.
    pub fn add_config_rules<'a, I>(&mut self, table: &str, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a String, &'a FieldRuleTable)>,
    {
        let mut parsed = Vec::new();
        for (field, table_rules) in fields {
            let mut rules = Vec::new();
            for (kind, parameter) in table_rules {
                match Rule::from_toml(kind, parameter)? {
                    Some(rule) => rules.push(rule),
                    None => debug!(table, field = field.as_str(), kind = kind.as_str(), "ignoring unknown rule"),
                }
            }
            parsed.push((field.clone(), rules));
        }
        self.add_rules(table, parsed);
        Ok(())
    }

    /// Custom messages keyed `"<field>.<rule>"`; `:parameter` is replaced by
    /// the rule parameter.
    pub fn set_messages<I, K, V>(&mut self, messages: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.messages = messages
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
    }

    pub fn has_rules(&self, table: &str) -> bool {
        self.rules.contains_key(table)
    }

    /// Validates `data` for `operation` against the rules of `table`.
    ///
    /// Updates and deletes skip fields absent from `data`. Never mutates
    /// `data`.
    pub fn validate(&self, table: &str, data: &Record, operation: Operation) -> ValidationReport {
        let mut report = ValidationReport::default();
        let Some(fields) = self.rules.get(table) else {
            return report;
        };

        for (field, rules) in fields {
            let value = data.get(field);
            let partial = matches!(operation, Operation::Update | Operation::Delete);
            if partial && value.map_or(true, Value::is_null) {
                continue;
            }
            for rule in rules {
                if rule.is_violated(value) {
                    report
                        .errors
                        .entry(field.clone())
                        .or_default()
                        .push(self.message(field, rule));
                }
            }
        }

        if !report.is_valid() {
            debug!(table, %operation, fields = report.errors.len(), "validation failed");
        }
        report
    }

    fn message(&self, field: &str, rule: &Rule) -> String {
        let parameter = rule.parameter();
        if let Some(custom) = self.messages.get(&format!("{}.{}", field, rule.kind())) {
            return custom.replace(":parameter", &parameter);
        }
        match rule {
            Rule::Required(_) => format!("The field {} is required", field),
            Rule::Type(_) => format!("The field {} must be of type {}", field, parameter),
            Rule::Min(_) => format!("The field {} must be at least {}", field, parameter),
            Rule::Max(_) => format!("The field {} must be at most {}", field, parameter),
            Rule::Pattern(_) => format!("The field {} has an invalid format", field),
            Rule::Enum(_) => format!("The value of field {} is not allowed", field),
        }
    }
}

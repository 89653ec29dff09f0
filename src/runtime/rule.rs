//! Routing rules, escalations and their trigger conditions.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::filter::ObjectFilter;
use crate::core::{RuleId, Severity};
use crate::recipient::Recipient;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionParseError {
    #[error("empty condition operand")]
    EmptyOperand,

    #[error("unknown condition field '{0}'")]
    UnknownField(String),

    #[error("missing comparison operator in '{0}'")]
    MissingOperator(String),

    #[error("invalid duration '{0}'")]
    BadDuration(String),

    #[error("invalid severity '{0}'")]
    BadSeverity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
        };
        f.write_str(s)
    }
}

impl CmpOp {
    fn eval<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            CmpOp::Ge => left >= right,
            CmpOp::Gt => left > right,
        }
    }
}

/// Inputs an escalation condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EscalationContext {
    /// Time elapsed since the incident opened.
    pub age: Duration,
    /// Current aggregate severity of the incident.
    pub severity: Severity,
}

/// Escalation trigger condition: `age>=5m`, `severity>=crit`, or
/// combinations joined with `&` / `|`. The empty condition always
/// triggers.
#[derive(Debug, Clone)]
pub enum Condition {
    Always,
    Age(CmpOp, Duration),
    Severity(CmpOp, Severity),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Condition::Always);
        }

        // '|' binds weaker than '&'; neither nests in parentheses here.
        let alternatives: Vec<&str> = trimmed.split('|').collect();
        if alternatives.len() > 1 {
            let parsed = alternatives
                .into_iter()
                .map(Condition::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Condition::Any(parsed));
        }

        let conjuncts: Vec<&str> = trimmed.split('&').collect();
        if conjuncts.len() > 1 {
            let parsed = conjuncts
                .into_iter()
                .map(Condition::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Condition::All(parsed));
        }

        Self::parse_comparison(trimmed)
    }

    fn parse_comparison(input: &str) -> Result<Self, ConditionParseError> {
        let operators = [
            (">=", CmpOp::Ge),
            ("<=", CmpOp::Le),
            ("!=", CmpOp::Ne),
            (">", CmpOp::Gt),
            ("<", CmpOp::Lt),
            ("=", CmpOp::Eq),
        ];
        for (symbol, op) in operators {
            if let Some((field, value)) = input.split_once(symbol) {
                let field = field.trim();
                let value = value.trim();
                if value.is_empty() {
                    return Err(ConditionParseError::EmptyOperand);
                }
                return match field {
                    "age" => {
                        let duration = humantime::parse_duration(value)
                            .map_err(|_| ConditionParseError::BadDuration(value.to_string()))?;
                        let duration = Duration::from_std(duration)
                            .map_err(|_| ConditionParseError::BadDuration(value.to_string()))?;
                        Ok(Condition::Age(op, duration))
                    }
                    "severity" => {
                        let severity = Severity::from_str(value)
                            .map_err(|_| ConditionParseError::BadSeverity(value.to_string()))?;
                        Ok(Condition::Severity(op, severity))
                    }
                    other => Err(ConditionParseError::UnknownField(other.to_string())),
                };
            }
        }
        Err(ConditionParseError::MissingOperator(input.to_string()))
    }

    pub fn matches(&self, ctx: &EscalationContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::Age(op, threshold) => op.eval(ctx.age, *threshold),
            Condition::Severity(op, threshold) => op.eval(ctx.severity, *threshold),
            Condition::All(parts) => parts.iter().all(|c| c.matches(ctx)),
            Condition::Any(parts) => parts.iter().any(|c| c.matches(ctx)),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::Age(op, threshold) => {
                let std = threshold.to_std().unwrap_or_default();
                write!(f, "age{op}{}", humantime::format_duration(std))
            }
            Condition::Severity(op, threshold) => write!(f, "severity{op}{threshold}"),
            Condition::All(parts) => {
                let joined: Vec<String> = parts.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", joined.join(" & "))
            }
            Condition::Any(parts) => {
                let joined: Vec<String> = parts.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", joined.join(" | "))
            }
        }
    }
}

/// A recipient entry on an escalation, optionally pinned to a channel
/// that overrides the contact's default for this escalation only.
#[derive(Debug, Clone)]
pub struct EscalationRecipient {
    pub recipient: Recipient,
    pub channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub id: i64,
    pub rule_id: RuleId,
    pub name: String,
    pub condition: Condition,
    pub recipients: Vec<EscalationRecipient>,
}

/// Active window of a rule. A rule without a timeperiod is always in
/// effect.
#[derive(Debug, Clone)]
pub struct Timeperiod {
    pub id: i64,
    pub name: String,
    pub entries: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Timeperiod {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.entries.iter().any(|&(start, end)| start <= t && t < end)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub object_filter: ObjectFilter,
    pub timeperiod: Option<Arc<Timeperiod>>,
    pub escalations: Vec<Arc<Escalation>>,
}

impl Rule {
    /// Whether the rule applies to `tags` at time `t`.
    pub fn applies(&self, tags: &std::collections::BTreeMap<String, String>, t: DateTime<Utc>) -> bool {
        if let Some(tp) = &self.timeperiod {
            if !tp.contains(t) {
                return false;
            }
        }
        self.object_filter.matches(tags)
    }
}

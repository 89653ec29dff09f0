//! Object filter expressions.
//!
//! Rules select objects by their id tags with a small expression
//! language:
//!
//! ```text
//! host=web* & zone=prod
//! (host=db1 | host=db2) & !service=backup
//! service
//! ```
//!
//! `key=value` matches when the tag exists and its value matches;
//! `*` in a value is a wildcard. `key!=value` is the negation of
//! `key=value` (missing tags match). A bare `key` tests existence.
//! `&` binds tighter than `|`.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterParseError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,

    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("invalid wildcard pattern '{0}'")]
    BadPattern(String),
}

/// A value pattern: exact match or wildcard.
#[derive(Debug, Clone)]
enum TagPattern {
    Exact(String),
    Wildcard(Regex),
}

impl TagPattern {
    fn parse(value: &str) -> Result<Self, FilterParseError> {
        if !value.contains('*') {
            return Ok(TagPattern::Exact(value.to_string()));
        }
        let mut pattern = String::from("^");
        let mut first = true;
        for part in value.split('*') {
            if !first {
                pattern.push_str(".*");
            }
            pattern.push_str(&regex::escape(part));
            first = false;
        }
        pattern.push('$');
        let regex =
            Regex::new(&pattern).map_err(|_| FilterParseError::BadPattern(value.to_string()))?;
        Ok(TagPattern::Wildcard(regex))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            TagPattern::Exact(expected) => value == expected,
            TagPattern::Wildcard(regex) => regex.is_match(value),
        }
    }
}

/// A parsed, evaluable object filter.
#[derive(Debug, Clone)]
pub enum ObjectFilter {
    /// Matches every object; the filter of rules without one.
    All,
    Exists(String),
    Match(String, TagPatternBox),
    Not(Box<ObjectFilter>),
    And(Vec<ObjectFilter>),
    Or(Vec<ObjectFilter>),
}

/// Wrapper keeping `TagPattern` private while `ObjectFilter` stays
/// pattern-matchable.
#[derive(Debug, Clone)]
pub struct TagPatternBox(TagPattern);

impl ObjectFilter {
    pub fn parse(input: &str) -> Result<Self, FilterParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(ObjectFilter::All);
        }
        let mut parser = Parser {
            chars: trimmed.char_indices().collect(),
            pos: 0,
        };
        let filter = parser.parse_or()?;
        parser.skip_ws();
        if let Some(&(offset, c)) = parser.chars.get(parser.pos) {
            return Err(FilterParseError::UnexpectedChar(c, offset));
        }
        Ok(filter)
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            ObjectFilter::All => true,
            ObjectFilter::Exists(key) => tags.contains_key(key),
            ObjectFilter::Match(key, pattern) => {
                tags.get(key).is_some_and(|v| pattern.0.matches(v))
            }
            ObjectFilter::Not(inner) => !inner.matches(tags),
            ObjectFilter::And(parts) => parts.iter().all(|p| p.matches(tags)),
            ObjectFilter::Or(parts) => parts.iter().any(|p| p.matches(tags)),
        }
    }
}

impl fmt::Display for ObjectFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectFilter::All => write!(f, "*"),
            ObjectFilter::Exists(key) => write!(f, "{key}"),
            ObjectFilter::Match(key, pattern) => match &pattern.0 {
                TagPattern::Exact(v) => write!(f, "{key}={v}"),
                TagPattern::Wildcard(r) => write!(f, "{key}=~{}", r.as_str()),
            },
            ObjectFilter::Not(inner) => write!(f, "!({inner})"),
            ObjectFilter::And(parts) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", joined.join(" & "))
            }
            ObjectFilter::Or(parts) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", joined.join(" | "))
            }
        }
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn skip_ws(&mut self) {
        while self
            .chars
            .get(self.pos)
            .is_some_and(|&(_, c)| c.is_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn parse_or(&mut self) -> Result<ObjectFilter, FilterParseError> {
        let mut parts = vec![self.parse_and()?];
        while self.peek() == Some('|') {
            self.bump();
            parts.push(self.parse_and()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(ObjectFilter::Or(parts))
        }
    }

    fn parse_and(&mut self) -> Result<ObjectFilter, FilterParseError> {
        let mut parts = vec![self.parse_term()?];
        while self.peek() == Some('&') {
            self.bump();
            parts.push(self.parse_term()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("non-empty"))
        } else {
            Ok(ObjectFilter::And(parts))
        }
    }

    fn parse_term(&mut self) -> Result<ObjectFilter, FilterParseError> {
        match self.peek() {
            Some('!') => {
                self.bump();
                // "!key=value" negates the whole comparison.
                Ok(ObjectFilter::Not(Box::new(self.parse_term()?)))
            }
            Some('(') => {
                self.bump();
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(')') => Ok(inner),
                    Some(c) => {
                        let offset = self.chars[self.pos - 1].0;
                        Err(FilterParseError::UnexpectedChar(c, offset))
                    }
                    None => Err(FilterParseError::UnexpectedEnd),
                }
            }
            Some(_) => self.parse_comparison(),
            None => Err(FilterParseError::UnexpectedEnd),
        }
    }

    fn parse_comparison(&mut self) -> Result<ObjectFilter, FilterParseError> {
        let key = self.parse_word()?;
        self.skip_ws();

        let negated = matches!(self.chars.get(self.pos), Some(&(_, '!')))
            && matches!(self.chars.get(self.pos + 1), Some(&(_, '=')));
        if negated {
            self.pos += 2;
        } else if self.chars.get(self.pos).is_some_and(|&(_, c)| c == '=') {
            self.pos += 1;
        } else {
            return Ok(ObjectFilter::Exists(key));
        }

        let value = self.parse_word().unwrap_or_default();
        let filter = ObjectFilter::Match(key, TagPatternBox(TagPattern::parse(&value)?));
        if negated {
            Ok(ObjectFilter::Not(Box::new(filter)))
        } else {
            Ok(filter)
        }
    }

    fn parse_word(&mut self) -> Result<String, FilterParseError> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|&(_, c)| !matches!(c, '&' | '|' | '!' | '(' | ')' | '=') && !c.is_whitespace())
        {
            self.pos += 1;
        }
        if self.pos == start {
            match self.chars.get(self.pos) {
                Some(&(offset, c)) => Err(FilterParseError::UnexpectedChar(c, offset)),
                None => Err(FilterParseError::UnexpectedEnd),
            }
        } else {
            Ok(self.chars[start..self.pos].iter().map(|&(_, c)| c).collect())
        }
    }
}

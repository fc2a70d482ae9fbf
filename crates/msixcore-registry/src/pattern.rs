use anyhow::{Context, Result};
use regex::Regex;

/// Shell-style package pattern: `*` matches any run, `?` any single
/// character, case-insensitive. A bare `*` matches everything.
#[derive(Debug, Clone)]
pub enum PackagePattern {
    Any,
    Regex(Regex),
}

impl PackagePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Ok(Self::Any);
        }

        let mut expression = String::with_capacity(pattern.len() + 8);
        expression.push_str("(?i)^");
        let mut literal = [0_u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => expression.push_str(".*"),
                '?' => expression.push('.'),
                _ => expression.push_str(&regex::escape(ch.encode_utf8(&mut literal))),
            }
        }
        expression.push('$');

        let regex = Regex::new(&expression)
            .with_context(|| format!("invalid package search pattern '{pattern}'"))?;
        Ok(Self::Regex(regex))
    }

    pub fn matches(&self, full_name: &str, family_name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Regex(regex) => regex.is_match(full_name) || regex.is_match(family_name),
        }
    }
}

//! `Cache-Control` directive parsing.

use std::collections::HashMap;
use std::time::Duration;

use http::header::CACHE_CONTROL;
use http::HeaderMap;

use crate::error::{CacheError, Result};

/// Parsed `Cache-Control` directives.
///
/// Directive names are lowercased. A directive may appear more than once;
/// its arguments accumulate in order, so `private="Set-Cookie"` followed by
/// `private="X-User"` yields both arguments under `private`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: HashMap<String, Vec<String>>,
}

impl CacheControl {
    /// Parses a single raw header value.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut control = Self::default();
        control.extend_from(raw)?;
        Ok(control)
    }

    /// Parses every `Cache-Control` value in a header map into one
    /// directive set.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let mut control = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            let raw = value.to_str().map_err(|_| {
                CacheError::InvalidCacheControl("value is not valid UTF-8".into())
            })?;
            control.extend_from(raw)?;
        }
        Ok(control)
    }

    fn extend_from(&mut self, raw: &str) -> Result<()> {
        for token in split_directives(raw)? {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((name, value)) => {
                    let value = value.trim();
                    let value = value
                        .strip_prefix('"')
                        .and_then(|v| v.strip_suffix('"'))
                        .unwrap_or(value);
                    self.directives
                        .entry(name.trim().to_ascii_lowercase())
                        .or_default()
                        .push(value.to_string());
                }
                None => {
                    self.directives.entry(token.to_ascii_lowercase()).or_default();
                }
            }
        }
        Ok(())
    }

    /// True when the directive is present, regardless of arguments.
    pub fn has(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    /// First argument of the directive, if it has one.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.directives.get(name).and_then(|values| values.first()).map(String::as_str)
    }

    /// Every argument given for the directive, in order of appearance.
    pub fn values(&self, name: &str) -> &[String] {
        self.directives.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Interprets the directive's first argument as a non-negative whole
    /// number of seconds.
    pub fn duration(&self, name: &str) -> Result<Duration> {
        let value = self
            .get(name)
            .ok_or_else(|| CacheError::InvalidDirective(name.to_string()))?;
        let secs: u64 = value
            .parse()
            .map_err(|_| CacheError::InvalidDirective(name.to_string()))?;
        Ok(Duration::from_secs(secs))
    }

    /// True when no directives were present.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

// Splits on commas that sit outside quoted strings.
fn split_directives(raw: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in raw.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(CacheError::InvalidCacheControl(
            "unterminated quoted string".into(),
        ));
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_values() -> Result<()> {
        let control = CacheControl::parse("no-store, max-age=60, private")?;
        assert!(control.has("no-store"));
        assert!(control.has("private"));
        assert_eq!(control.get("max-age"), Some("60"));
        assert_eq!(control.get("no-store"), None);
        assert!(!control.has("no-cache"));
        Ok(())
    }

    #[test]
    fn names_are_lowercased() -> Result<()> {
        let control = CacheControl::parse("No-Cache, Max-Age=5")?;
        assert!(control.has("no-cache"));
        assert_eq!(control.get("max-age"), Some("5"));
        Ok(())
    }

    #[test]
    fn quoted_values_keep_commas() -> Result<()> {
        let control = CacheControl::parse("private=\"Set-Cookie, X-User\", max-age=10")?;
        assert_eq!(control.get("private"), Some("Set-Cookie, X-User"));
        assert_eq!(control.get("max-age"), Some("10"));
        Ok(())
    }

    #[test]
    fn repeated_directives_accumulate() -> Result<()> {
        let control = CacheControl::parse("private=\"A\", private=\"B\"")?;
        assert_eq!(control.values("private"), ["A", "B"]);
        assert_eq!(control.get("private"), Some("A"));
        Ok(())
    }

    #[test]
    fn duration_rejects_non_numeric() -> Result<()> {
        let control = CacheControl::parse("max-age=60, max-stale=abc, min-fresh=-5")?;
        assert_eq!(control.duration("max-age")?, Duration::from_secs(60));
        assert!(control.duration("max-stale").is_err());
        assert!(control.duration("min-fresh").is_err());
        assert!(control.duration("absent").is_err());
        Ok(())
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(CacheControl::parse("private=\"Set-Cookie").is_err());
    }

    #[test]
    fn merges_multiple_header_values() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.append(CACHE_CONTROL, "no-cache".parse().unwrap());
        headers.append(CACHE_CONTROL, "max-age=30".parse().unwrap());
        let control = CacheControl::from_headers(&headers)?;
        assert!(control.has("no-cache"));
        assert_eq!(control.get("max-age"), Some("30"));
        Ok(())
    }

    #[test]
    fn empty_header_parses_to_nothing() -> Result<()> {
        let control = CacheControl::parse("")?;
        assert!(control.is_empty());
        Ok(())
    }
}

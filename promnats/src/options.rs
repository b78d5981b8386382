//! Responder options: which subjects to answer on and under what identity.

use promnats_common::subject::{ROOT_SUBJECT, default_identity, targeted_subject, validate_part};

use crate::error::{ResponderError, Result};

/// How a responder names itself on the bus.
///
/// With parts `[a, b, c]` the responder answers on `metrics`, `metrics.a`,
/// `metrics.a.b` and `metrics.a.b.c`, so it can be reached by a broadcast,
/// by any prefix group, or individually. Its identity is the longest suffix,
/// `a.b.c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderOptions {
    root_subject: String,
    suffixes: Vec<String>,
    debug: bool,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self {
            root_subject: ROOT_SUBJECT.to_string(),
            suffixes: Vec::new(),
            debug: false,
        }
    }
}

impl ResponderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one subscription per identity prefix.
    pub fn with_parts<S: AsRef<str>>(mut self, parts: &[S]) -> Result<Self> {
        self.suffixes = suffixes(parts)?;
        Ok(self)
    }

    /// Split `id` at `.` and behave like [`with_parts`](Self::with_parts).
    pub fn with_id(self, id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('.').collect();
        self.with_parts(&parts)
    }

    pub fn with_root_subject(mut self, root: impl Into<String>) -> Self {
        self.root_subject = root.into();
        self
    }

    /// Log per-request timings and configured subjects at debug level.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn root_subject(&self) -> &str {
        &self.root_subject
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Subject suffixes, starting with the empty (broadcast) one. Falls back
    /// to `<executable>.<host>.<pid>` when no parts were given.
    pub fn suffixes(&self) -> Vec<String> {
        if self.suffixes.is_empty() {
            let id = default_identity();
            let parts: Vec<&str> = id.split('.').collect();
            suffixes(&parts).unwrap_or_else(|_| vec![String::new()])
        } else {
            self.suffixes.clone()
        }
    }

    /// Fully qualified subjects to subscribe to.
    pub fn subjects(&self) -> Vec<String> {
        self.suffixes()
            .iter()
            .map(|s| targeted_subject(&self.root_subject, s))
            .collect()
    }

    /// The identity announced in every reply.
    pub fn identity(&self) -> String {
        identity_of(&self.suffixes())
    }
}

fn suffixes<S: AsRef<str>>(parts: &[S]) -> Result<Vec<String>> {
    if parts.is_empty() {
        return Err(ResponderError::NoParts);
    }

    let mut out = vec![String::new()];
    let mut joined: Vec<&str> = Vec::with_capacity(parts.len());
    for part in parts {
        let part = part.as_ref();
        validate_part(part).map_err(|e| ResponderError::InvalidPart(e.to_string()))?;
        joined.push(part);
        out.push(joined.join(".").to_lowercase());
    }
    Ok(out)
}

fn identity_of(suffixes: &[String]) -> String {
    suffixes.last().map(|s| s.to_lowercase()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_parts() {
        let opts = ResponderOptions::new().with_parts(&["A", "B", "C"]).unwrap();

        assert_eq!(opts.suffixes(), vec!["", "a", "a.b", "a.b.c"]);
        assert_eq!(
            opts.subjects(),
            vec!["metrics", "metrics.a", "metrics.a.b", "metrics.a.b.c"]
        );
        assert_eq!(opts.identity(), "a.b.c");
    }

    #[test]
    fn test_with_id() {
        let opts = ResponderOptions::new().with_id("Svc.East.7").unwrap();
        assert_eq!(opts.identity(), "svc.east.7");
    }

    #[test]
    fn test_invalid_parts() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            ResponderOptions::new().with_parts(&empty),
            Err(ResponderError::NoParts)
        ));
        assert!(matches!(
            ResponderOptions::new().with_parts(&["a", "b c"]),
            Err(ResponderError::InvalidPart(_))
        ));
        assert!(ResponderOptions::new().with_id("a..b").is_err());
    }

    #[test]
    fn test_identity_of_last_suffix() {
        let suffixes = vec!["".to_string(), "A".to_string(), "A.B.C".to_string()];
        assert_eq!(identity_of(&suffixes), "a.b.c");
    }

    #[test]
    fn test_default_identity() {
        let opts = ResponderOptions::new().with_root_subject("stats");

        let subjects = opts.subjects();
        assert_eq!(subjects.len(), 4);
        assert_eq!(subjects[0], "stats");
        assert!(opts.identity().ends_with(&std::process::id().to_string()));
    }
}

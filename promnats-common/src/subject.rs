//! Subjects, instance identities and the path keys derived from them.

use std::fmt;

use crate::error::{Error, Result};

/// Root subject every responder listens on.
pub const ROOT_SUBJECT: &str = "metrics";

/// Prefix of anonymous reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Administrative namespace; requests there need system privileges.
pub const SYSTEM_PREFIX: &str = "$SYS";

/// Characters with a meaning in Zenoh key expressions.
const TRANSPORT_RESERVED: [char; 5] = ['/', '*', '$', '?', '#'];

/// Build the targeted subject `<root>.<identity>`.
///
/// # Example
/// ```
/// use promnats_common::subject::targeted_subject;
///
/// assert_eq!(targeted_subject("metrics", "app.c1.t1"), "metrics.app.c1.t1");
/// assert_eq!(targeted_subject("metrics", ""), "metrics");
/// ```
pub fn targeted_subject(root: &str, identity: &str) -> String {
    if identity.is_empty() {
        root.to_string()
    } else {
        format!("{}.{}", root, identity)
    }
}

/// Check that a single identity part is usable as a subject token.
pub fn validate_part(part: &str) -> Result<()> {
    let mut problems = Vec::new();
    if part.contains('.') || part.chars().any(char::is_whitespace) {
        problems.push("contains invalid chars");
    }
    if part.contains(TRANSPORT_RESERVED) {
        problems.push("contains chars reserved by the transport");
    }
    if part.is_empty() {
        problems.push("zero length");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::invalid_identity(part, problems.join(",")))
    }
}

/// Derive the HTTP path key of an identity: lowercase, dots become slashes.
///
/// # Example
/// ```
/// use promnats_common::subject::path_key;
///
/// assert_eq!(path_key("AppX.ClusterY.Task1"), "appx/clustery/task1");
/// ```
pub fn path_key(identity: &str) -> String {
    identity
        .split('.')
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a dot-delimited subject onto a slash-delimited Zenoh key expression.
pub fn subject_to_key(subject: &str) -> Result<String> {
    if subject.is_empty() {
        return Err(Error::invalid_subject(subject, "empty subject"));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(Error::invalid_subject(subject, "contains whitespace"));
    }
    if subject.contains(TRANSPORT_RESERVED) {
        return Err(Error::invalid_subject(
            subject,
            "contains characters reserved by the transport",
        ));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(Error::invalid_subject(subject, "empty token"));
    }
    Ok(subject.replace('.', "/"))
}

/// A validated, lowercased instance identity such as `app.cluster.task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    raw: String,
    parts: Vec<String>,
}

impl Identity {
    /// Parse an identity as received in a reply header.
    ///
    /// The value is trimmed and case-folded before validation so the same
    /// instance is recognised across rounds regardless of casing.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().to_lowercase();
        if raw.is_empty() {
            return Err(Error::invalid_identity(&raw, "zero length"));
        }

        let parts: Vec<String> = raw.split('.').map(str::to_string).collect();
        for part in &parts {
            validate_part(part).map_err(|_| {
                Error::invalid_identity(&raw, format!("invalid part '{}'", part))
            })?;
        }

        Ok(Self { raw, parts })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Logical group / job name (first part).
    pub fn group(&self) -> &str {
        &self.parts[0]
    }

    pub fn cluster(&self) -> Option<&str> {
        self.parts.get(1).map(String::as_str)
    }

    pub fn task(&self) -> Option<&str> {
        self.parts.get(2).map(String::as_str)
    }

    pub fn path_key(&self) -> String {
        self.parts.join("/")
    }

    /// Subject addressing exactly this instance under `root`.
    pub fn subject(&self, root: &str) -> String {
        targeted_subject(root, &self.raw)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Local host name, lowercased with dots replaced so it forms a single part.
pub fn host_part() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    sanitize_part(&host)
}

/// Current executable name without extension, as a single part.
pub fn exec_part() -> String {
    let name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());
    sanitize_part(&name)
}

pub fn pid_part() -> String {
    std::process::id().to_string()
}

/// Default identity of a responder: `<executable>.<host>.<pid>`.
pub fn default_identity() -> String {
    format!("{}.{}.{}", exec_part(), host_part(), pid_part())
}

fn sanitize_part(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c == '.' || c.is_whitespace() || TRANSPORT_RESERVED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .to_lowercase()
}

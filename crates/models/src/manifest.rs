use crate::error::StowageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constraint that accepts any version.
pub const ANY_VERSION: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Name as written in the manifest.
    pub name: String,
    pub extras: Vec<String>,
    /// Version specifier such as `>=2.31,<3`, or `*` when unconstrained.
    pub constraint: String,
    pub markers: Option<String>,
}

/// A requirements-style dependency manifest: package name to version constraint.
///
/// Names are unique after PEP 503 normalisation. Option lines (`--index-url`,
/// `-c constraints.txt`, ...) are kept verbatim and handed to the installer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub packages: BTreeMap<String, Requirement>,
    pub options: Vec<String>,
}

impl DependencyManifest {
    pub fn parse(content: &str) -> Result<Self, StowageError> {
        let mut manifest = DependencyManifest::default();

        for (index, raw) in logical_lines(content) {
            let line = strip_comment(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('-') {
                manifest.options.push(line.to_string());
                continue;
            }

            let requirement = parse_requirement(line).map_err(|reason| {
                StowageError::ManifestInvalid {
                    reason: format!("line {}: {}", index, reason),
                }
            })?;

            let key = normalize_name(&requirement.name);
            if let Some(existing) = manifest.packages.get(&key) {
                return Err(StowageError::ManifestInvalid {
                    reason: format!(
                        "line {}: duplicate package '{}' (already listed as '{}')",
                        index, requirement.name, existing.name
                    ),
                });
            }
            manifest.packages.insert(key, requirement);
        }

        Ok(manifest)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        self.packages.get(&normalize_name(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(|name| name.as_str())
    }
}

/// PEP 503 normalisation: lowercase, runs of `-`, `_` and `.` collapse to `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    normalized
}

fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut start = 0;

    for (index, line) in content.lines().enumerate() {
        if pending.is_empty() {
            start = index + 1;
        }
        match line.strip_suffix('\\') {
            Some(head) => pending.push_str(head),
            None => {
                pending.push_str(line);
                lines.push((start, std::mem::take(&mut pending)));
            }
        }
    }
    if !pending.is_empty() {
        lines.push((start, pending));
    }
    lines
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_requirement(line: &str) -> Result<Requirement, String> {
    let (requirement, markers) = match line.split_once(';') {
        Some((requirement, markers)) => (requirement.trim(), Some(markers.trim().to_string())),
        None => (line, None),
    };

    let name_end = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(requirement.len());
    let name = &requirement[..name_end];

    if name.is_empty()
        || !name.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !name.ends_with(|c: char| c.is_ascii_alphanumeric())
    {
        return Err(format!("'{}' does not start with a valid package name", requirement));
    }

    let mut rest = requirement[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| format!("unterminated extras in '{}'", requirement))?;
        extras = after[..close]
            .split(',')
            .map(|extra| extra.trim().to_string())
            .filter(|extra| !extra.is_empty())
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let constraint = if rest.is_empty() {
        ANY_VERSION.to_string()
    } else if rest.starts_with('@')
        || rest.starts_with(['=', '<', '>', '!', '~'])
        || rest.starts_with('(')
    {
        rest.trim_start_matches('(')
            .trim_end_matches(')')
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        return Err(format!("unexpected '{}' after package name '{}'", rest, name));
    };

    Ok(Requirement {
        name: name.to_string(),
        extras,
        constraint,
        markers: markers.filter(|m| !m.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unconstrained_package() {
        let manifest = DependencyManifest::parse("requests\n").unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("requests").unwrap().constraint, ANY_VERSION);
    }

    #[test]
    fn test_parse_bot_manifest() {
        let content = r#"
# telegram bot
pyTelegramBotAPI==4.14.0
python-dotenv>=1.0   # env loading
PyMuPDF ~= 1.23
requests[socks] >=2.31, <3 ; python_version >= "3.8"
--index-url https://pypi.org/simple
"#;
        let manifest = DependencyManifest::parse(content).unwrap();

        assert_eq!(manifest.len(), 4);
        assert_eq!(
            manifest.get("pytelegrambotapi").unwrap().constraint,
            "==4.14.0"
        );
        assert_eq!(manifest.get("python_dotenv").unwrap().constraint, ">=1.0");
        let requests = manifest.get("requests").unwrap();
        assert_eq!(requests.extras, vec!["socks".to_string()]);
        assert_eq!(requests.constraint, ">=2.31, <3");
        assert_eq!(
            requests.markers.as_deref(),
            Some("python_version >= \"3.8\"")
        );
        assert_eq!(
            manifest.options,
            vec!["--index-url https://pypi.org/simple".to_string()]
        );
    }

    #[test]
    fn test_duplicate_names_after_normalisation() {
        let err = DependencyManifest::parse("python-dotenv\nPython_DotEnv==1.0\n").unwrap_err();
        assert!(matches!(err, StowageError::ManifestInvalid { .. }));
        assert!(err.to_string().contains("duplicate package"));
    }

    #[test]
    fn test_rejects_unnamed_requirement() {
        let err = DependencyManifest::parse("git+https://example.com/repo.git\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_line_continuation() {
        let manifest = DependencyManifest::parse("requests \\\n  ==2.31.0\nflask\n").unwrap();
        assert_eq!(manifest.get("requests").unwrap().constraint, "==2.31.0");
        assert!(manifest.get("flask").is_some());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Foo.Bar__baz"), "foo-bar-baz");
        assert_eq!(normalize_name("requests"), "requests");
    }
}

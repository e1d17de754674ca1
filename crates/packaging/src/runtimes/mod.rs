use std::fs;
use std::path::{Path, PathBuf};
use stowage_models::StowageError;
use tracing::info;

mod python;

pub const SUPPORTED_RUNTIMES: &[&str] = &["python"];

/// A starter file written by `stowage init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub path: String,
    pub content: String,
}

pub fn templates_for(runtime: &str, entry: &str) -> Result<Vec<Template>, StowageError> {
    match runtime {
        "python" | "python3" | "python3.11" => Ok(python::templates(entry)),
        _ => Err(StowageError::ConfigError {
            reason: format!(
                "unsupported runtime {} (supported: {})",
                runtime,
                SUPPORTED_RUNTIMES.join(", ")
            ),
        }),
    }
}

/// Write the starter recipe, manifest and entry script into `dir`. Existing
/// files are left untouched and not reported as written.
pub fn write_templates(dir: &Path, templates: &[Template]) -> Result<Vec<PathBuf>, StowageError> {
    fs::create_dir_all(dir).map_err(StowageError::storage)?;
    let mut written = Vec::new();
    for template in templates {
        let path = dir.join(&template.path);
        if path.exists() {
            info!("Keeping existing {}", path.display());
            continue;
        }
        fs::write(&path, &template.content).map_err(StowageError::storage)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_recipe;
    use stowage_models::{DependencyManifest, Instruction};
    use tempfile::tempdir;

    #[test]
    fn test_python_templates_parse() {
        let templates = templates_for("python", "bot.py").unwrap();
        let recipe = templates.iter().find(|t| t.path == "Dockerfile").unwrap();
        let parsed = parse_recipe(&recipe.content).unwrap();
        assert!(parsed.steps.iter().any(|s| matches!(
            &s.instruction,
            Instruction::SetCmd { argv } if argv == &["python", "bot.py"]
        )));

        let manifest = templates.iter().find(|t| t.path == "requirements.txt").unwrap();
        assert!(DependencyManifest::parse(&manifest.content).is_ok());
    }

    #[test]
    fn test_unknown_runtime() {
        assert!(templates_for("cobol", "main.cob").is_err());
    }

    #[test]
    fn test_write_keeps_existing_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bot.py"), "custom").unwrap();
        let written = write_templates(dir.path(), &templates_for("python", "bot.py").unwrap()).unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("bot.py")).unwrap(), "custom");
    }
}

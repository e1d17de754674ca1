//! Recipe parser for the supported Dockerfile subset.
//!
//! Supported instructions: `FROM`, `WORKDIR`, `ENV`, `LABEL`, `COPY`, `ADD`,
//! `RUN` (dependency installs only), `ENTRYPOINT` and `CMD` (exec form only).
//! Keywords are case-insensitive, `\` continues a line and `#` starts a
//! comment line. `$VAR` and `${VAR}` expand from earlier `ENV` values, on
//! top of the environment inherited from the base image.

use stowage_models::{ImageName, ImageRef, Instruction, Recipe, RecipeStep, StageMode, StowageError};

/// Installer flags that take a value and are passed through unchanged.
const PASSTHROUGH_VALUE_FLAGS: &[&str] = &[
    "--index-url",
    "-i",
    "--extra-index-url",
    "--trusted-host",
    "--find-links",
    "-f",
    "--only-binary",
    "--no-binary",
    "--progress-bar",
    "--timeout",
    "--retries",
    "--platform",
    "--python-version",
    "--implementation",
    "--abi",
];

/// Installer flags without a value that are passed through unchanged.
const PASSTHROUGH_FLAGS: &[&str] = &[
    "--upgrade",
    "-U",
    "--no-deps",
    "--pre",
    "--prefer-binary",
    "--require-hashes",
    "--no-build-isolation",
    "--no-compile",
    "--quiet",
    "-q",
    "--verbose",
    "-v",
    "--no-warn-script-location",
    "--ignore-installed",
    "-I",
];

/// Flags that would move packages outside the managed install location.
const FORBIDDEN_FLAGS: &[&str] = &[
    "--target", "-t", "--prefix", "--root", "--user", "--editable", "-e", "--src",
];

/// Flags that control the installer cache. Caching is always off, so these
/// are accepted and dropped.
const CACHE_FLAGS: &[&str] = &["--no-cache-dir"];
const CACHE_VALUE_FLAGS: &[&str] = &["--cache-dir"];

const SHELL_OPERATORS: &[&str] = &["&&", "||", ";", "|", "&", ">", ">>", "<", "`", "$("];

pub fn parse_recipe(content: &str) -> Result<Recipe, StowageError> {
    RecipeParser::new(content, Vec::new()).parse()
}

/// Parse with `base_env` visible to `$VAR` references, as if its entries
/// came from `ENV` lines right after `FROM`.
pub fn parse_recipe_with_env(content: &str, base_env: &[(String, String)]) -> Result<Recipe, StowageError> {
    RecipeParser::new(content, base_env.to_vec()).parse()
}

fn parse_error(line: usize, reason: impl Into<String>) -> StowageError {
    StowageError::RecipeParse {
        line,
        reason: reason.into(),
    }
}

struct RecipeParser {
    lines: Vec<(usize, String)>,
    env: Vec<(String, String)>,
}

impl RecipeParser {
    fn new(content: &str, env: Vec<(String, String)>) -> Self {
        Self {
            lines: Self::preprocess(content),
            env,
        }
    }

    /// Join continuation lines and drop blank and comment lines. Each logical
    /// line keeps the number of its first physical line.
    fn preprocess(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut current = String::new();
        let mut start_line = 0;
        let mut continuation = false;

        for (index, raw) in content.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.starts_with('#') || (trimmed.is_empty() && !continuation) {
                continue;
            }

            let (body, continues) = match trimmed.strip_suffix('\\') {
                Some(body) => (body.trim_end(), true),
                None => (trimmed, false),
            };

            if continuation {
                if !body.is_empty() {
                    current.push(' ');
                    current.push_str(body);
                }
            } else {
                start_line = index + 1;
                current = body.to_string();
            }
            continuation = continues;

            if !continuation && !current.is_empty() {
                result.push((start_line, std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            result.push((start_line, current));
        }
        result
    }

    fn parse(mut self) -> Result<Recipe, StowageError> {
        let lines = std::mem::take(&mut self.lines);
        let mut steps = Vec::with_capacity(lines.len());

        for (line, text) in lines {
            let (keyword, rest) = match text.split_once(char::is_whitespace) {
                Some((keyword, rest)) => (keyword.to_ascii_uppercase(), rest.trim()),
                None => (text.to_ascii_uppercase(), ""),
            };

            let is_from = keyword == "FROM";
            if steps.is_empty() && !is_from {
                return Err(parse_error(
                    line,
                    format!("expected FROM as the first instruction, found {}", keyword),
                ));
            }
            if !steps.is_empty() && is_from {
                return Err(parse_error(line, "multi-stage builds are not supported"));
            }

            let instruction = match keyword.as_str() {
                "FROM" => self.parse_from(line, rest)?,
                "WORKDIR" => self.parse_workdir(line, rest)?,
                "ENV" => self.parse_env(line, rest)?,
                "LABEL" => self.parse_label(line, rest)?,
                "COPY" => self.parse_stage_files(line, rest, StageMode::Copy)?,
                "ADD" => self.parse_stage_files(line, rest, StageMode::Add)?,
                "RUN" => self.parse_run(line, rest)?,
                "ENTRYPOINT" => Instruction::SetEntrypoint {
                    argv: Self::parse_exec_form(line, "ENTRYPOINT", rest)?,
                },
                "CMD" => Instruction::SetCmd {
                    argv: Self::parse_exec_form(line, "CMD", rest)?,
                },
                other => return Err(parse_error(line, format!("unsupported instruction {}", other))),
            };

            steps.push(RecipeStep {
                line,
                text,
                instruction,
            });
        }

        if steps.is_empty() {
            return Err(parse_error(1, "recipe has no FROM instruction"));
        }
        Ok(Recipe { steps })
    }

    fn parse_from(&self, line: usize, rest: &str) -> Result<Instruction, StowageError> {
        let args = tokenize(line, rest)?;
        if let Some(flag) = args.iter().find(|a| a.starts_with("--")) {
            return Err(parse_error(line, format!("unsupported FROM flag {}", flag)));
        }
        match args.as_slice() {
            [image] if image.eq_ignore_ascii_case("scratch") => Ok(Instruction::SelectBase {
                image: ImageRef::Scratch,
            }),
            [image] => {
                let name: ImageName = image
                    .parse()
                    .map_err(|_| parse_error(line, format!("invalid image reference {}", image)))?;
                Ok(Instruction::SelectBase {
                    image: ImageRef::Named(name),
                })
            }
            [_, keyword, _] if keyword.eq_ignore_ascii_case("as") => {
                Err(parse_error(line, "named build stages are not supported"))
            }
            _ => Err(parse_error(line, "FROM takes exactly one image reference")),
        }
    }

    fn parse_workdir(&self, line: usize, rest: &str) -> Result<Instruction, StowageError> {
        let args = tokenize(line, rest)?;
        match args.as_slice() {
            [path] => Ok(Instruction::SetWorkdir {
                path: self.substitute(line, path)?,
            }),
            _ => Err(parse_error(line, "WORKDIR takes exactly one path")),
        }
    }

    fn parse_env(&mut self, line: usize, rest: &str) -> Result<Instruction, StowageError> {
        let args = tokenize(line, rest)?;
        if args.is_empty() {
            return Err(parse_error(line, "ENV requires at least one key=value pair"));
        }

        let mut vars = Vec::new();
        if args[0].contains('=') {
            for arg in &args {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| parse_error(line, format!("expected key=value, found {}", arg)))?;
                vars.push((key.to_string(), value.to_string()));
            }
        } else {
            if args.len() < 2 {
                return Err(parse_error(line, format!("ENV {} requires a value", args[0])));
            }
            vars.push((args[0].clone(), args[1..].join(" ")));
        }

        // Values on one line expand against the environment before that line.
        let mut expanded = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            if !is_valid_env_key(&key) {
                return Err(parse_error(line, format!("invalid environment variable name {}", key)));
            }
            expanded.push((key, self.substitute(line, &value)?));
        }
        for (key, value) in &expanded {
            match self.env.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.clone(),
                None => self.env.push((key.clone(), value.clone())),
            }
        }
        Ok(Instruction::SetEnv { vars: expanded })
    }

    fn parse_label(&self, line: usize, rest: &str) -> Result<Instruction, StowageError> {
        let args = tokenize(line, rest)?;
        if args.is_empty() {
            return Err(parse_error(line, "LABEL requires at least one key=value pair"));
        }
        let mut labels = Vec::new();
        for arg in &args {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| parse_error(line, format!("expected key=value, found {}", arg)))?;
            if key.is_empty() {
                return Err(parse_error(line, "LABEL key must not be empty"));
            }
            labels.push((key.to_string(), self.substitute(line, value)?));
        }
        Ok(Instruction::SetLabel { labels })
    }

    fn parse_stage_files(&self, line: usize, rest: &str, mode: StageMode) -> Result<Instruction, StowageError> {
        let keyword = match mode {
            StageMode::Copy => "COPY",
            StageMode::Add => "ADD",
        };
        let args = if rest.starts_with('[') {
            serde_json::from_str::<Vec<String>>(rest)
                .map_err(|e| parse_error(line, format!("invalid {} JSON form: {}", keyword, e)))?
        } else {
            tokenize(line, rest)?
        };

        if let Some(flag) = args.iter().find(|a| a.starts_with("--")) {
            return Err(parse_error(line, format!("unsupported {} flag {}", keyword, flag)));
        }
        if args.len() < 2 {
            return Err(parse_error(
                line,
                format!("{} requires at least one source and a destination", keyword),
            ));
        }

        let mut sources = Vec::with_capacity(args.len() - 1);
        for source in &args[..args.len() - 1] {
            sources.push(self.substitute(line, source)?);
        }
        let destination = self.substitute(line, &args[args.len() - 1])?;
        if destination.is_empty() {
            return Err(parse_error(line, format!("{} destination is empty", keyword)));
        }

        Ok(Instruction::StageFiles {
            mode,
            sources,
            destination,
        })
    }

    fn parse_run(&self, line: usize, rest: &str) -> Result<Instruction, StowageError> {
        let args = if rest.starts_with('[') {
            serde_json::from_str::<Vec<String>>(rest)
                .map_err(|e| parse_error(line, format!("invalid RUN JSON form: {}", e)))?
        } else {
            if let Some(op) = SHELL_OPERATORS.iter().find(|op| rest.contains(*op)) {
                return Err(parse_error(
                    line,
                    format!("shell operator {} is not supported in RUN", op),
                ));
            }
            tokenize(line, rest)?
        };
        parse_install_command(line, &args)
    }

    fn parse_exec_form(line: usize, keyword: &str, rest: &str) -> Result<Vec<String>, StowageError> {
        if !rest.starts_with('[') {
            return Err(parse_error(
                line,
                format!("{} requires the exec form, e.g. {} [\"python\", \"bot.py\"]", keyword, keyword),
            ));
        }
        serde_json::from_str(rest)
            .map_err(|e| parse_error(line, format!("invalid {} JSON array: {}", keyword, e)))
    }

    fn substitute(&self, line: usize, input: &str) -> Result<String, StowageError> {
        expand_vars(input, &self.env).map_err(|reason| parse_error(line, reason))
    }
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand `$VAR`, `${VAR}` and `${VAR:-default}`. Unset variables expand to
/// the empty string; `\$` is a literal dollar.
pub fn expand_vars(input: &str, env: &[(String, String)]) -> Result<String, String> {
    let lookup = |name: &str| {
        env.iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                out.push('$');
                chars.next();
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(format!("unterminated variable reference in {}", input));
                    }
                    match body.split_once(":-") {
                        Some((name, default)) => match lookup(name) {
                            Some(value) if !value.is_empty() => out.push_str(value),
                            _ => out.push_str(default),
                        },
                        None => {
                            if !is_valid_env_key(&body) {
                                return Err(format!("invalid variable reference ${{{}}}", body));
                            }
                            out.push_str(lookup(&body).unwrap_or(""));
                        }
                    }
                }
                Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(lookup(&name).unwrap_or(""));
                }
                _ => out.push('$'),
            },
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Split a line into words, honouring single and double quotes and
/// backslash escapes outside single quotes.
fn tokenize(line: usize, s: &str) -> Result<Vec<String>, StowageError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), '$') => current.push_str("\\$"),
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                // A `$` keeps its escape so variable expansion can see it.
                Some('$') => current.push_str("\\$"),
                Some(next) => current.push(next),
                None => current.push('\\'),
            },
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    tokens.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(parse_error(line, "unterminated quote"));
    }
    if in_word {
        tokens.push(current);
    }
    Ok(tokens)
}

fn program_name(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn is_python(word: &str) -> bool {
    let name = program_name(word);
    name == "python"
        || name
            .strip_prefix("python")
            .map(|version| version.chars().all(|c| c.is_ascii_digit() || c == '.'))
            .unwrap_or(false)
}

/// Accept `pip install ... -r <manifest>` in its common spellings.
fn parse_install_command(line: usize, args: &[String]) -> Result<Instruction, StowageError> {
    let unsupported = || {
        parse_error(
            line,
            "RUN only supports `pip install -r <manifest>`; other commands are not executed",
        )
    };

    let rest = match args {
        [pip, install, rest @ ..]
            if matches!(program_name(pip), "pip" | "pip3") && install == "install" =>
        {
            rest
        }
        [python, m, pip, install, rest @ ..]
            if is_python(python) && m == "-m" && pip == "pip" && install == "install" =>
        {
            rest
        }
        _ => return Err(unsupported()),
    };

    let mut manifest: Option<String> = None;
    let mut installer_args = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let arg = rest[i].as_str();
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => (flag, Some(value.to_string())),
            _ => (arg, None),
        };

        let take_value = |i: &mut usize| -> Result<String, StowageError> {
            if let Some(value) = inline_value.clone() {
                return Ok(value);
            }
            *i += 1;
            rest.get(*i)
                .cloned()
                .ok_or_else(|| parse_error(line, format!("{} requires a value", flag)))
        };

        if flag == "-r" || flag == "--requirement" {
            let value = take_value(&mut i)?;
            if manifest.replace(value).is_some() {
                return Err(parse_error(line, "exactly one -r <manifest> is supported"));
            }
        } else if let Some(value) = flag.strip_prefix("-r").filter(|v| !v.is_empty() && !flag.starts_with("--")) {
            if manifest.replace(value.to_string()).is_some() {
                return Err(parse_error(line, "exactly one -r <manifest> is supported"));
            }
        } else if CACHE_FLAGS.contains(&flag) {
            // dropped, the installer always runs without a cache
        } else if CACHE_VALUE_FLAGS.contains(&flag) {
            take_value(&mut i)?;
        } else if FORBIDDEN_FLAGS.contains(&flag) {
            return Err(parse_error(
                line,
                format!("{} conflicts with the managed install location", flag),
            ));
        } else if PASSTHROUGH_FLAGS.contains(&flag) {
            installer_args.push(arg.to_string());
        } else if PASSTHROUGH_VALUE_FLAGS.contains(&flag) {
            let value = take_value(&mut i)?;
            installer_args.push(format!("{}={}", flag, value));
        } else if flag.starts_with('-') {
            return Err(parse_error(line, format!("unsupported installer flag {}", flag)));
        } else {
            return Err(parse_error(
                line,
                format!("package {} must be listed in the manifest, not on the RUN line", arg),
            ));
        }
        i += 1;
    }

    let manifest = manifest.ok_or_else(|| parse_error(line, "pip install requires -r <manifest>"))?;
    Ok(Instruction::RunInstall {
        manifest,
        installer_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_models::BuildStage;

    const BOT_RECIPE: &str = r#"
# Chat bot image
FROM python:3.11-slim

WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY . .
ENV PYTHONUNBUFFERED=1
CMD ["python", "bot.py"]
"#;

    #[test]
    fn test_parse_bot_recipe() {
        let recipe = parse_recipe(BOT_RECIPE).unwrap();
        let stages: Vec<BuildStage> = recipe.steps.iter().map(|s| s.instruction.stage()).collect();
        assert_eq!(
            stages,
            vec![
                BuildStage::SelectBase,
                BuildStage::SetWorkdir,
                BuildStage::StageFiles,
                BuildStage::InstallDependencies,
                BuildStage::StageFiles,
                BuildStage::Configure,
                BuildStage::SetEntrypoint,
            ]
        );
        assert_eq!(recipe.steps[0].line, 3);
        assert_eq!(
            recipe.steps[3].instruction,
            Instruction::RunInstall {
                manifest: "requirements.txt".to_string(),
                installer_args: vec![],
            }
        );
        assert_eq!(
            recipe.steps[6].instruction,
            Instruction::SetCmd {
                argv: vec!["python".to_string(), "bot.py".to_string()]
            }
        );
    }

    #[test]
    fn test_continuation_and_case() {
        let recipe = parse_recipe(
            "from scratch\ncopy a.py \\\n     b.py \\\n     /app/\nentrypoint [\"/app/a.py\"]\n",
        )
        .unwrap();
        assert_eq!(recipe.steps.len(), 3);
        assert_eq!(recipe.steps[1].line, 2);
        assert_eq!(
            recipe.steps[1].instruction,
            Instruction::StageFiles {
                mode: StageMode::Copy,
                sources: vec!["a.py".to_string(), "b.py".to_string()],
                destination: "/app/".to_string(),
            }
        );
    }

    #[test]
    fn test_env_substitution() {
        let recipe = parse_recipe(
            "FROM scratch\nENV APP_HOME=/srv/bot LOG=\"debug level\"\nWORKDIR ${APP_HOME}\nCOPY bot.py $APP_HOME/main.py\nENV PATH=${APP_HOME}/bin:${PATH:-/usr/bin}\n",
        )
        .unwrap();
        assert_eq!(
            recipe.steps[1].instruction,
            Instruction::SetEnv {
                vars: vec![
                    ("APP_HOME".to_string(), "/srv/bot".to_string()),
                    ("LOG".to_string(), "debug level".to_string()),
                ]
            }
        );
        assert_eq!(
            recipe.steps[2].instruction,
            Instruction::SetWorkdir {
                path: "/srv/bot".to_string()
            }
        );
        match &recipe.steps[3].instruction {
            Instruction::StageFiles { destination, .. } => assert_eq!(destination, "/srv/bot/main.py"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            recipe.steps[4].instruction,
            Instruction::SetEnv {
                vars: vec![("PATH".to_string(), "/srv/bot/bin:/usr/bin".to_string())]
            }
        );
    }

    #[test]
    fn test_base_env_visible_to_substitution() {
        let base = vec![("PATH".to_string(), "/opt/py/bin:/usr/bin".to_string())];
        let content = "FROM base\nENV PATH=/app/bin:$PATH\n";

        let recipe = parse_recipe_with_env(content, &base).unwrap();
        assert_eq!(
            recipe.steps[1].instruction,
            Instruction::SetEnv {
                vars: vec![("PATH".to_string(), "/app/bin:/opt/py/bin:/usr/bin".to_string())]
            }
        );

        let recipe = parse_recipe(content).unwrap();
        assert_eq!(
            recipe.steps[1].instruction,
            Instruction::SetEnv {
                vars: vec![("PATH".to_string(), "/app/bin:".to_string())]
            }
        );
    }

    #[test]
    fn test_escaped_dollar_is_literal() {
        assert_eq!(expand_vars("\\$HOME", &[]).unwrap(), "$HOME");
        assert_eq!(expand_vars("cost $", &[]).unwrap(), "cost $");
        assert!(expand_vars("${OPEN", &[]).is_err());
    }

    #[test]
    fn test_install_spellings() {
        for line in [
            "RUN pip3 install -r deps.txt",
            "RUN python -m pip install --requirement=deps.txt",
            "RUN python3.11 -m pip install --cache-dir /tmp/c -rdeps.txt",
            "RUN [\"pip\", \"install\", \"-r\", \"deps.txt\"]",
        ] {
            let recipe = parse_recipe(&format!("FROM scratch\n{}\n", line)).unwrap();
            assert_eq!(
                recipe.steps[1].instruction,
                Instruction::RunInstall {
                    manifest: "deps.txt".to_string(),
                    installer_args: vec![],
                },
                "{}",
                line
            );
        }
    }

    #[test]
    fn test_install_passthrough_flags() {
        let recipe = parse_recipe(
            "FROM scratch\nRUN pip install -U --index-url https://pypi.example/simple -r r.txt\n",
        )
        .unwrap();
        assert_eq!(
            recipe.steps[1].instruction,
            Instruction::RunInstall {
                manifest: "r.txt".to_string(),
                installer_args: vec![
                    "-U".to_string(),
                    "--index-url=https://pypi.example/simple".to_string()
                ],
            }
        );
    }

    #[test]
    fn test_rejected_run_forms() {
        for (line, needle) in [
            ("RUN apt-get update", "only supports"),
            ("RUN pip install requests", "must be listed in the manifest"),
            ("RUN pip install --target /opt -r r.txt", "managed install location"),
            ("RUN pip install -r a.txt -r b.txt", "exactly one"),
            ("RUN pip install -r r.txt && rm -rf /", "shell operator"),
            ("RUN pip install --weird -r r.txt", "unsupported installer flag"),
            ("RUN pip install --upgrade", "requires -r"),
        ] {
            let err = parse_recipe(&format!("FROM scratch\n{}\n", line)).unwrap_err();
            match err {
                StowageError::RecipeParse { line: 2, reason } => {
                    assert!(reason.contains(needle), "{}: {}", line, reason)
                }
                other => panic!("{}: unexpected {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_structural_errors() {
        let cases = [
            ("", 1, "no FROM"),
            ("WORKDIR /app\nFROM scratch\n", 1, "expected FROM"),
            ("FROM scratch\nFROM python:3.11\n", 2, "multi-stage"),
            ("FROM python:3.11 AS build\n", 1, "named build stages"),
            ("FROM scratch\nCMD python bot.py\n", 2, "exec form"),
            ("FROM scratch\nCMD [\"python\", \n", 2, "invalid CMD"),
            ("FROM scratch\nUSER bot\n", 2, "unsupported instruction USER"),
            ("FROM scratch\nCOPY --chown=1:1 a b\n", 2, "unsupported COPY flag"),
            ("FROM scratch\nCOPY bot.py\n", 2, "at least one source"),
            ("FROM Python:3\n", 1, "invalid image reference"),
            ("FROM scratch\nENV 1BAD=x\n", 2, "invalid environment variable"),
        ];
        for (content, expected_line, needle) in cases {
            match parse_recipe(content).unwrap_err() {
                StowageError::RecipeParse { line, reason } => {
                    assert_eq!(line, expected_line, "{:?}", content);
                    assert!(reason.contains(needle), "{:?}: {}", content, reason);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(1, r#"a "b c" 'd $e' f\ g"#).unwrap(),
            vec!["a", "b c", "d \\$e", "f g"]
        );
        assert!(tokenize(1, "\"open").is_err());
    }
}

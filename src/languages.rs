//! Language configuration for compilation and execution

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("failed to parse language configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read language configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {kind} limit for {language}: {value:?}")]
    InvalidLimit {
        language: String,
        kind: &'static str,
        value: Vec<String>,
    },

    #[error("language {0} has an empty run command")]
    EmptyRunCommand(String),
}

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq)]
pub struct Language {
    pub name: String,
    /// File extensions (without dot) used to pick a language for checker sources
    pub extensions: Vec<String>,
    /// Name of the source file inside the box (e.g., "main.cpp")
    pub source_file: String,
    /// Name of the artifact inside the box; the source itself for interpreted languages
    pub compiled_file: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Set when the toolchain is missing on this host
    pub disabled: bool,
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Adjusted CPU time limit in seconds
    pub fn calculate_time_limit(&self, base_secs: f64) -> f64 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_secs * multiplier as f64 + bonus_seconds as f64,
            None => base_secs,
        }
    }

    /// Adjusted memory limit in KB
    pub fn calculate_memory_limit(&self, base_kb: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_kb
                .saturating_mul(multiplier as u64)
                .saturating_add(bonus_mb as u64 * 1024),
            None => base_kb,
        }
    }

    /// The program that has to exist on the host for this language to work
    fn toolchain(&self) -> Option<&str> {
        self.compile_command
            .as_ref()
            .unwrap_or(&self.run_command)
            .first()
            .map(String::as_str)
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    #[serde(default)]
    extensions: Vec<String>,
    source_file: String,
    compiled_file: Option<String>,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Registry of languages, addressed by name, alias or file extension
#[derive(Debug, Clone, Default)]
pub struct Languages {
    languages: BTreeMap<String, Language>,
    aliases: HashMap<String, String>,
}

impl Languages {
    /// Languages shipped in `files/languages.toml`
    pub fn builtin() -> Result<Self, LanguageError> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml(content)
    }

    /// Load from `path` when given, otherwise the built-in table
    pub fn load(path: Option<&Path>) -> Result<Self, LanguageError> {
        match path {
            Some(path) => {
                info!("Loading languages from {:?}", path);
                let content = std::fs::read_to_string(path)?;
                Self::from_toml(&content)
            }
            None => Self::builtin(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, LanguageError> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, raw) in raw_configs {
            let name = name.to_lowercase();
            let parse_limit = |raw_limit: Vec<String>,
                               kind: &'static str|
             -> Result<Option<(u32, u32)>, LanguageError> {
                if raw_limit.is_empty() {
                    return Ok(None);
                }
                let invalid = || LanguageError::InvalidLimit {
                    language: name.clone(),
                    kind,
                    value: raw_limit.clone(),
                };
                if raw_limit.len() != 2 {
                    return Err(invalid());
                }
                let multiplier = raw_limit[0].parse::<u32>().map_err(|_| invalid())?;
                let offset = raw_limit[1].parse::<u32>().map_err(|_| invalid())?;
                Ok(Some((multiplier, offset)))
            };

            let time_limit = parse_limit(raw.time_limit, "time")?;
            let memory_limit = parse_limit(raw.memory_limit, "memory")?;
            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                return Err(LanguageError::EmptyRunCommand(name));
            }

            let language = Language {
                extensions: raw.extensions.iter().map(|e| e.to_lowercase()).collect(),
                compiled_file: raw.compiled_file.unwrap_or_else(|| raw.source_file.clone()),
                source_file: raw.source_file,
                compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
                run_command,
                time_limit,
                memory_limit,
                disabled: false,
                name: name.clone(),
            };

            for alias in raw.aliases {
                registry.aliases.insert(alias.to_lowercase(), name.clone());
            }
            registry.languages.insert(name, language);
        }

        Ok(registry)
    }

    /// Look up by name or alias, disabled languages included
    pub fn get(&self, name: &str) -> Option<&Language> {
        let name = name.to_lowercase();
        let key = self.aliases.get(&name).unwrap_or(&name);
        self.languages.get(key)
    }

    /// Language whose extension matches `filename`
    pub fn by_filename(&self, filename: &str) -> Option<&Language> {
        let extension = Path::new(filename).extension()?.to_str()?.to_lowercase();
        self.languages
            .values()
            .find(|lang| lang.extensions.iter().any(|e| *e == extension))
    }

    /// Languages that accept new submissions
    pub fn enabled(&self) -> impl Iterator<Item = &Language> {
        self.languages.values().filter(|lang| !lang.disabled)
    }

    /// Disable every language whose compiler/interpreter is not usable on this host
    pub fn check_availability(&mut self) {
        let path_var = std::env::var("PATH").unwrap_or_default();
        self.check_availability_in(&path_var);
    }

    fn check_availability_in(&mut self, path_var: &str) {
        for lang in self.languages.values_mut().filter(|lang| !lang.disabled) {
            let Some(program) = lang.toolchain() else {
                lang.disabled = true;
                info!("Language {:?} was disabled because of an empty command", lang.name);
                continue;
            };

            if let Err(reason) = check_executable(program, path_var) {
                lang.disabled = true;
                info!("Language {:?} was disabled because {}", lang.name, reason);
            }
        }

        if self.enabled().next().is_none() {
            warn!("No language is available on this host");
        }
    }
}

/// Resolve `program` like a shell would and make sure it can be executed
fn check_executable(program: &str, path_var: &str) -> Result<PathBuf, &'static str> {
    let found = if program.contains('/') {
        let path = PathBuf::from(program);
        path.exists().then_some(path)
    } else {
        std::env::split_paths(path_var)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.exists())
    };
    let found = found.ok_or("the compiler/interpreter was not found in PATH")?;

    let resolved = std::fs::canonicalize(&found)
        .map_err(|_| "the compiler/interpreter had a bad symlink")?;
    let metadata = std::fs::metadata(&resolved)
        .map_err(|_| "the compiler/interpreter binary was not found")?;

    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err("the compiler/interpreter binary is not executable");
    }
    Ok(resolved)
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[c]
extensions = ["c"]
source_file = "main.c"
compiled_file = "main"
compile_command = "fakecc -o /box/main /box/main.c"
run_command = "/box/main"

[python]
extensions = ["py"]
source_file = "main.py"
run_command = "noexec /box/main.py"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "python3"]

[ruby]
extensions = ["rb"]
source_file = "main.rb"
run_command = "missing-ruby /box/main.rb"
"#;

    #[test]
    fn test_load_languages() {
        let languages = Languages::from_toml(CONFIG).unwrap();

        let c = languages.get("C").unwrap();
        assert!(c.is_compiled());
        assert_eq!(c.compiled_file, "main");
        assert_eq!(c.compile_command.as_ref().unwrap()[0], "fakecc");

        let python = languages.get("python3").unwrap();
        assert_eq!(python.name, "python");
        assert!(!python.is_compiled());
        assert_eq!(python.compiled_file, "main.py");
        assert!(languages.get("cobol").is_none());
    }

    #[test]
    fn test_builtin_languages_parse() {
        let languages = Languages::builtin().unwrap();
        assert!(languages.get("cpp").is_some());
        assert_eq!(languages.by_filename("checker.cpp").unwrap().name, "cpp");
        assert_eq!(languages.by_filename("checker.py").unwrap().name, "python3");
    }

    #[test]
    fn test_by_filename() {
        let languages = Languages::from_toml(CONFIG).unwrap();
        assert_eq!(languages.by_filename("checker.C").unwrap().name, "c");
        assert_eq!(languages.by_filename("a.b.py").unwrap().name, "python");
        assert!(languages.by_filename("checker").is_none());
        assert!(languages.by_filename("checker.pas").is_none());
    }

    #[test]
    fn test_limit_adjustment() {
        let languages = Languages::from_toml(CONFIG).unwrap();
        let python = languages.get("py").unwrap();
        assert_eq!(python.calculate_time_limit(1.5), 6.5);
        assert_eq!(python.calculate_memory_limit(65536), 2 * 65536 + 32 * 1024);

        let c = languages.get("c").unwrap();
        assert_eq!(c.calculate_time_limit(0.5), 0.5);
        assert_eq!(c.calculate_memory_limit(1024), 1024);
    }

    #[test]
    fn test_huge_memory_limit_saturates() {
        let languages = Languages::from_toml(CONFIG).unwrap();
        let python = languages.get("python").unwrap();
        assert_eq!(python.calculate_memory_limit(u64::MAX / 2 + 1), u64::MAX);
    }

    #[test]
    fn test_invalid_limit() {
        let config = r#"
[c]
source_file = "main.c"
run_command = "/box/main"
time_limit = ["x", "1"]
"#;
        assert!(matches!(
            Languages::from_toml(config),
            Err(LanguageError::InvalidLimit { kind: "time", .. })
        ));
    }

    #[test]
    fn test_check_availability() {
        let dir = TempDir::new().unwrap();
        let fakecc = dir.path().join("fakecc");
        fs::write(&fakecc, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&fakecc, fs::Permissions::from_mode(0o755)).unwrap();
        let noexec = dir.path().join("noexec");
        fs::write(&noexec, "").unwrap();
        fs::set_permissions(&noexec, fs::Permissions::from_mode(0o644)).unwrap();

        let mut languages = Languages::from_toml(CONFIG).unwrap();
        languages.check_availability_in(dir.path().to_str().unwrap());

        assert!(!languages.get("c").unwrap().disabled);
        assert!(languages.get("python").unwrap().disabled);
        assert!(languages.get("ruby").unwrap().disabled);

        let enabled: Vec<_> = languages.enabled().map(|l| l.name.as_str()).collect();
        assert_eq!(enabled, vec!["c"]);
    }
}

// src/language.rs
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn yes() -> bool {
    true
}

/// How to check and run one language inside a jail's `/tmp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Registry key stored on submitted steps, e.g. `python3`.
    pub id: String,
    pub name: String,
    /// Empty when the language has no compile or lint stage.
    #[serde(default)]
    pub compiler: String,
    #[serde(default)]
    pub compiler_args: Vec<String>,
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub runner_args: Vec<String>,
    pub source_file: String,
    /// Program produced by the compiler; run instead of `runner` when set.
    #[serde(default)]
    pub executable: String,
    #[serde(default = "yes")]
    pub available: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Language {
    pub fn compiles(&self) -> bool {
        !self.compiler.is_empty()
    }

    /// `compiler compiler_args.. source_file`
    pub fn compile_command(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.compiler_args.len() + 2);
        argv.push(self.compiler.clone());
        argv.extend(self.compiler_args.iter().cloned());
        argv.push(self.source_file.clone());
        argv
    }

    pub fn run_command(&self) -> Vec<String> {
        if !self.executable.is_empty() {
            return vec![self.executable.clone()];
        }
        let mut argv = Vec::with_capacity(self.runner_args.len() + 1);
        argv.push(self.runner.clone());
        argv.extend(self.runner_args.iter().cloned());
        argv
    }

    /// Files the pipeline leaves in the env directory, relative to it.
    pub fn artifacts(&self) -> Vec<&str> {
        let mut files = vec![self.source_file.as_str()];
        if !self.executable.is_empty() {
            files.push(self.executable.trim_start_matches("./"));
        }
        files
    }

    fn programs(&self) -> impl Iterator<Item = &str> {
        [self.compiler.as_str(), self.runner.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
    }
}

/// The languages a deployment accepts, keyed by [`Language::id`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    languages: Vec<Language>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// C, C++, Go, PHP and Python 3.
    pub fn defaults() -> Self {
        let languages = vec![
            Language {
                id: "c".into(),
                name: "C".into(),
                compiler: "cc".into(),
                compiler_args: strings(&["-O2", "-std=c11"]),
                runner: String::new(),
                runner_args: Vec::new(),
                source_file: "main.c".into(),
                executable: "./a.out".into(),
                available: true,
            },
            Language {
                id: "c++".into(),
                name: "C++".into(),
                compiler: "c++".into(),
                compiler_args: strings(&["-O2", "-std=c++17"]),
                runner: String::new(),
                runner_args: Vec::new(),
                source_file: "main.cpp".into(),
                executable: "./a.out".into(),
                available: true,
            },
            Language {
                id: "go".into(),
                name: "Go".into(),
                // `go` wants a writable cache; the wrapper points it into /tmp.
                compiler: "/bin/sh".into(),
                compiler_args: strings(&[
                    "-c",
                    "HOME=/tmp GOCACHE=/tmp/.cache/go GOPATH=/tmp/go exec go build -o main \"$0\"",
                ]),
                runner: String::new(),
                runner_args: Vec::new(),
                source_file: "main.go".into(),
                executable: "./main".into(),
                available: true,
            },
            Language {
                id: "php".into(),
                name: "PHP".into(),
                compiler: "php".into(),
                compiler_args: strings(&["-l"]),
                runner: "php".into(),
                runner_args: strings(&["main.php"]),
                source_file: "main.php".into(),
                executable: String::new(),
                available: true,
            },
            Language {
                id: "python3".into(),
                name: "Python 3".into(),
                compiler: "python3".into(),
                compiler_args: strings(&["-c", "import ast, sys; ast.parse(open(sys.argv[1]).read(), sys.argv[1])"]),
                runner: "python3".into(),
                runner_args: strings(&["main.py"]),
                source_file: "main.py".into(),
                executable: String::new(),
                available: true,
            },
        ];
        Self { languages }
    }

    /// Parse a JSON array of [`Language`] entries.
    pub fn from_json(text: &str) -> SandboxResult<Self> {
        let registry: Registry = serde_json::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> SandboxResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> SandboxResult<()> {
        for (i, lang) in self.languages.iter().enumerate() {
            if lang.id.is_empty() || lang.source_file.is_empty() {
                return Err(SandboxError::InvalidConfig(format!(
                    "language #{i} needs an id and a source_file"
                )));
            }
            if lang.runner.is_empty() && lang.executable.is_empty() {
                return Err(SandboxError::InvalidConfig(format!(
                    "language {} has neither a runner nor an executable",
                    lang.id
                )));
            }
            if self.languages[..i].iter().any(|l| l.id == lang.id) {
                return Err(SandboxError::InvalidConfig(format!(
                    "language {} is listed twice",
                    lang.id
                )));
            }
        }
        Ok(())
    }

    /// Add `lang`, replacing any entry with the same id.
    pub fn insert(&mut self, lang: Language) {
        match self.languages.iter_mut().find(|l| l.id == lang.id) {
            Some(slot) => *slot = lang,
            None => self.languages.push(lang),
        }
    }

    /// Look up an available language.
    pub fn get(&self, id: &str) -> SandboxResult<&Language> {
        self.languages
            .iter()
            .find(|l| l.id == id && l.available)
            .ok_or_else(|| SandboxError::UnknownLanguage(id.to_string()))
    }

    pub fn available(&self) -> impl Iterator<Item = &Language> {
        self.languages.iter().filter(|l| l.available)
    }

    pub fn all(&self) -> &[Language] {
        &self.languages
    }

    /// Mark languages whose tools cannot be found on `path` (a `PATH`-style
    /// list) as unavailable. Absolute program paths are checked directly.
    pub fn probe(&mut self, path: &str) {
        for lang in &mut self.languages {
            let missing = lang.programs().find(|p| !on_path(p, path)).map(str::to_string);
            if let Some(program) = missing {
                tracing::debug!("language {} unavailable: {} not found", lang.id, program);
                lang.available = false;
            }
        }
    }
}

fn on_path(program: &str, path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let executable = |p: &Path| {
        std::fs::metadata(p).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    };
    if program.contains('/') {
        return executable(Path::new(program));
    }
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .any(|dir| executable(&Path::new(dir).join(program)))
}

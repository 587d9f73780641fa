use async_trait::async_trait;
use pipecore::{parse_flag, ConfigError, DependencyError, ProgressSink, Requirement};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A program that must be found on the search path. Never installable:
/// `installable` is accepted for uniformity but installing always fails.
#[derive(Debug, Clone)]
pub struct ExecutableRequirement {
    name: String,
    program: String,
    search_path: Option<String>,
    optional: bool,
}

impl ExecutableRequirement {
    pub fn for_program(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("executable:{}", program),
            program,
            search_path: None,
            optional: false,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Where the program resolves, if anywhere.
    pub fn locate(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return is_executable(program).then(|| program.to_path_buf());
        }

        let search_path = match &self.search_path {
            Some(path) => path.clone().into(),
            None => std::env::var_os("PATH")?,
        };
        std::env::split_paths(&search_path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl Requirement for ExecutableRequirement {
    fn name(&self) -> &str {
        &self.name
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn installable(&self) -> bool {
        false
    }

    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (key, value) in params {
            match key.as_str() {
                "optional" => self.optional = parse_flag(key, value)?,
                "installable" => {
                    parse_flag(key, value)?;
                }
                "program" => {
                    if value.trim().is_empty() {
                        return Err(ConfigError::invalid_parameter(key, "program name is empty"));
                    }
                    self.program = value.trim().to_string();
                    self.name = format!("executable:{}", self.program);
                }
                "search_path" => self.search_path = Some(value.clone()),
                _ => return Err(ConfigError::UnknownParameter(key.clone())),
            }
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let found = self.locate();
        if let Some(path) = &found {
            tracing::debug!("{} found at {}", self.name, path.display());
        }
        found.is_some()
    }

    async fn install(&self, _progress: &dyn ProgressSink) -> Result<(), DependencyError> {
        Err(DependencyError::NotInstallable(self.name.clone()))
    }
}

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::error::{BenchError, Result};
use crate::fleet::TestCaseDescriptor;

/// Maps test-case names to programs across an ordered list of directories.
#[derive(Debug, Clone)]
pub struct CaseResolver {
    dirs: Vec<PathBuf>,
}

impl CaseResolver {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Absolute path of `name` in the first directory that contains it.
    ///
    /// Names are plain file names; anything that could walk out of the case
    /// directories is reported as not found.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if !is_plain_name(name) {
            return Err(BenchError::CaseNotFound(name.to_string()));
        }

        for dir in &self.dirs {
            let candidate = dir.join(name);
            if candidate.is_file() {
                tracing::debug!(case = name, path = %candidate.display(), "Test case resolved");
                return Ok(std::fs::canonicalize(&candidate).unwrap_or(candidate));
            }
        }
        Err(BenchError::CaseNotFound(name.to_string()))
    }

    /// Every runnable case, first directory winning on duplicate names.
    pub fn list(&self) -> Vec<TestCaseDescriptor> {
        let mut seen = HashSet::new();
        let mut cases = Vec::new();

        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<(String, PathBuf)> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().into_string().ok().map(|n| (n, e.path())))
                .filter(|(n, _)| !n.starts_with("__") && !n.starts_with('.'))
                .collect();
            names.sort();

            for (name, path) in names {
                if seen.insert(name.clone()) {
                    cases.push(TestCaseDescriptor {
                        display_name: display_name(&name),
                        description: format!("测试用例: {}", name),
                        path: path.display().to_string(),
                        is_sample: false,
                        name,
                    });
                }
            }
        }
        cases
    }
}

fn is_plain_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// `basic_serial_test.py` → `Basic Serial Test`
fn display_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    stem.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

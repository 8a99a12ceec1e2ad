//! Workspace file signals
//!
//! A coarse picture of what exists in a project's file area: how many files
//! of each kind and when each kind last changed. The oracle weighs these
//! against the last recorded action to decide how to resume.

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Source,
    Test,
    Config,
    Docs,
    Other,
}

impl FileCategory {
    pub fn classify(path: &Path) -> Self {
        let in_test_dir = path
            .components()
            .any(|c| matches!(c.as_os_str().to_str(), Some("tests" | "test" | "__tests__")));
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let is_code = matches!(
            ext.as_str(),
            "rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "go" | "java" | "kt" | "c" | "h" | "cc"
                | "cpp" | "hpp" | "rb" | "swift" | "cs" | "sh"
        );

        if is_code
            && (in_test_dir
                || stem.starts_with("test_")
                || stem.ends_with("_test")
                || stem.ends_with(".test")
                || stem.ends_with("_spec")
                || stem.ends_with(".spec"))
        {
            return Self::Test;
        }
        if is_code {
            return Self::Source;
        }
        match ext.as_str() {
            "toml" | "json" | "yaml" | "yml" | "ini" | "cfg" | "lock" | "env" => Self::Config,
            "md" | "rst" | "txt" | "adoc" => Self::Docs,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorySignal {
    pub count: usize,
    pub latest_modified: Option<DateTime<Utc>>,
}

impl CategorySignal {
    fn observe(&mut self, modified: Option<DateTime<Utc>>) {
        self.count += 1;
        if modified > self.latest_modified {
            self.latest_modified = modified;
        }
    }
}

/// Summary of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSignals {
    pub root: PathBuf,
    pub total_files: usize,
    pub categories: BTreeMap<FileCategory, CategorySignal>,
    pub latest_modified: Option<DateTime<Utc>>,
    /// Entries the walker could not read
    pub unreadable_entries: usize,
    pub scanned_at: DateTime<Utc>,
}

impl FileSignals {
    /// Walk `root`, honoring `.gitignore` and skipping hidden files
    ///
    /// Fails if the root is missing or is not a readable directory. Individual
    /// unreadable entries below it are counted, not fatal.
    pub fn scan(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let meta = std::fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        std::fs::read_dir(root)?;

        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .build();

        let mut signals = Self {
            root: root.to_path_buf(),
            total_files: 0,
            categories: BTreeMap::new(),
            latest_modified: None,
            unreadable_entries: 0,
            scanned_at: Utc::now(),
        };

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    signals.unreadable_entries += 1;
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            signals
                .categories
                .entry(FileCategory::classify(relative))
                .or_default()
                .observe(modified);
            signals.total_files += 1;
            if modified > signals.latest_modified {
                signals.latest_modified = modified;
            }
        }

        debug!(
            root = %root.display(),
            files = signals.total_files,
            "Workspace scanned"
        );
        Ok(signals)
    }

    pub fn count(&self, category: FileCategory) -> usize {
        self.categories.get(&category).map_or(0, |c| c.count)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_classify() {
        assert_eq!(FileCategory::classify(Path::new("src/lib.rs")), FileCategory::Source);
        assert_eq!(FileCategory::classify(Path::new("tests/api.rs")), FileCategory::Test);
        assert_eq!(FileCategory::classify(Path::new("pkg/test_io.py")), FileCategory::Test);
        assert_eq!(FileCategory::classify(Path::new("web/app.spec.ts")), FileCategory::Test);
        assert_eq!(FileCategory::classify(Path::new("Cargo.toml")), FileCategory::Config);
        assert_eq!(FileCategory::classify(Path::new("README.md")), FileCategory::Docs);
        assert_eq!(FileCategory::classify(Path::new("logo.png")), FileCategory::Other);
    }

    #[test]
    fn test_scan_counts_by_category() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        fs::write(dir.path().join("tests/it.rs"), "").unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        fs::write(dir.path().join(".hidden"), "x").unwrap();

        let signals = FileSignals::scan(dir.path()).unwrap();
        assert_eq!(signals.total_files, 4);
        assert_eq!(signals.count(FileCategory::Source), 2);
        assert_eq!(signals.count(FileCategory::Test), 1);
        assert_eq!(signals.count(FileCategory::Config), 1);
        assert_eq!(signals.count(FileCategory::Docs), 0);
        assert!(signals.latest_modified.is_some());
    }

    #[test]
    fn test_scan_honors_gitignore() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/out.rs"), "").unwrap();
        fs::write(dir.path().join("lib.rs"), "").unwrap();

        let signals = FileSignals::scan(dir.path()).unwrap();
        assert_eq!(signals.total_files, 1);
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        assert!(FileSignals::scan(dir.path().join("gone")).is_err());
    }

    #[test]
    fn test_scan_file_root_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        assert!(FileSignals::scan(&file).is_err());
    }
}

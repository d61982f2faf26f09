//! Path-and-attribute admission filter (§4.1).

use std::path::Path;

use crate::config::WatchConfig;
use crate::types::{ChangeKind, FileAttributes, PathKey};

/// Decides whether a path/size/extension is admitted.
///
/// A single pure operation, `admits`, that short-circuits in the
/// documented order so the expensive `probe_attrs` closure — a status
/// syscall — is only ever invoked once every cheaper rule has passed.
#[derive(Debug, Clone)]
pub struct PathFilter {
    watch_roots: Vec<std::path::PathBuf>,
    include_extensions: Vec<String>,
    exclude_directory_names: Vec<String>,
    exclude_patterns: Vec<String>,
    max_file_size_bytes: u64,
    admit_hidden: bool,
}

impl PathFilter {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            watch_roots: config.watch_roots.clone(),
            include_extensions: config
                .include_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            exclude_directory_names: config.exclude_directory_names.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
            max_file_size_bytes: config.max_file_size_bytes,
            admit_hidden: config.admit_hidden,
        }
    }

    /// `admits(path, kind, probe_attrs) -> bool`.
    ///
    /// `probe_attrs` is only called once every path-string-only rule ahead
    /// of it has passed. Probe failure is equivalent to rejection
    /// (non-fatal, never propagated as an error). The size and extension
    /// rules both apply to files only (§4.1) — a directory is admitted
    /// unconditionally once the probe confirms it is one, the same way a
    /// `Deleted` path is exempted before the probe ever runs.
    pub fn admits(
        &self,
        path: &PathKey,
        kind: ChangeKind,
        probe_attrs: impl FnOnce() -> std::io::Result<FileAttributes>,
    ) -> bool {
        let p = path.as_path();

        if !self.is_under_watch_root(p) {
            return false;
        }
        if self.has_excluded_ancestor(p) {
            return false;
        }
        if !self.admit_hidden && is_hidden(p) {
            return false;
        }
        if self.matches_exclude_pattern(p) {
            return false;
        }
        if kind == ChangeKind::Deleted {
            // Deleted paths can't be stat'd; the size/extension rules only
            // apply to surviving files, matching §4.1's "files only" scoping.
            return true;
        }
        let attrs = match probe_attrs() {
            Ok(attrs) => attrs,
            Err(_) => return false,
        };
        if attrs.is_directory {
            return true;
        }
        if !self.include_extensions.is_empty() && !self.matches_include_extension(p) {
            return false;
        }
        attrs.size_bytes <= self.max_file_size_bytes
    }

    fn is_under_watch_root(&self, path: &Path) -> bool {
        self.watch_roots.iter().any(|root| path.starts_with(root))
    }

    fn has_excluded_ancestor(&self, path: &Path) -> bool {
        path.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.exclude_directory_names
                .iter()
                .any(|excluded| excluded == name.as_ref())
        })
    }

    fn matches_exclude_pattern(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.exclude_patterns
            .iter()
            .any(|pattern| path_str.contains(pattern.as_str()))
    }

    fn matches_include_extension(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()) else {
            return false;
        };
        let dotted = format!(".{ext}");
        self.include_extensions.iter().any(|e| e == &dotted)
    }
}

/// True if the basename starts with `.` or `~` (dotfiles and editor backups).
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with('.') || name.starts_with('~')
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::PathBuf;

    fn filter(roots: &[&str]) -> PathFilter {
        let config = WatchConfig {
            watch_roots: roots.iter().map(PathBuf::from).collect(),
            ..WatchConfig::default()
        };
        PathFilter::from_config(&config)
    }

    fn key(path: &str) -> PathKey {
        PathKey::new(PathBuf::from(path)).unwrap()
    }

    fn never_probe() -> impl FnOnce() -> std::io::Result<FileAttributes> {
        || panic!("probe_attrs should not be invoked")
    }

    #[test]
    fn root_containment_short_circuits_before_probe() {
        let filter = filter(&["/watched"]);
        let probed = Cell::new(false);
        let admitted = filter.admits(&key("/other/file.txt"), ChangeKind::Created, || {
            probed.set(true);
            Ok(FileAttributes {
                size_bytes: 0,
                modified_at_unix_secs: 0,
                is_directory: false,
            })
        });
        assert!(!admitted);
        assert!(!probed.get(), "probe_attrs must not run for rejected root");
    }

    #[test]
    fn excluded_directory_name_rejects_without_probe() {
        let filter = filter(&["/proj"]);
        let admitted = filter.admits(
            &key("/proj/node_modules/foo/bar.js"),
            ChangeKind::Created,
            never_probe(),
        );
        assert!(!admitted);
    }

    #[test]
    fn hidden_file_rejected_by_default() {
        let filter = filter(&["/proj"]);
        let admitted = filter.admits(&key("/proj/.env"), ChangeKind::Created, never_probe());
        assert!(!admitted);
    }

    #[test]
    fn admit_hidden_allows_dotfiles() {
        let mut config = WatchConfig {
            watch_roots: vec![PathBuf::from("/proj")],
            ..WatchConfig::default()
        };
        config.admit_hidden = true;
        let filter = PathFilter::from_config(&config);
        let admitted = filter.admits(&key("/proj/.env"), ChangeKind::Created, || {
            Ok(FileAttributes {
                size_bytes: 10,
                modified_at_unix_secs: 0,
                is_directory: false,
            })
        });
        assert!(admitted);
    }

    #[test]
    fn size_over_limit_rejects() {
        let mut config = WatchConfig {
            watch_roots: vec![PathBuf::from("/")],
            ..WatchConfig::default()
        };
        config.max_file_size_bytes = 50 * 1024 * 1024;
        let filter = PathFilter::from_config(&config);
        let admitted = filter.admits(&key("/big.bin"), ChangeKind::Created, || {
            Ok(FileAttributes {
                size_bytes: 100 * 1024 * 1024,
                modified_at_unix_secs: 0,
                is_directory: false,
            })
        });
        assert!(!admitted);
    }

    #[test]
    fn deleted_paths_skip_size_and_extension_rules() {
        let mut config = WatchConfig {
            watch_roots: vec![PathBuf::from("/")],
            include_extensions: vec![".rs".to_string()],
            ..WatchConfig::default()
        };
        config.max_file_size_bytes = 1;
        let filter = PathFilter::from_config(&config);
        let admitted = filter.admits(&key("/any.bin"), ChangeKind::Deleted, never_probe());
        assert!(admitted);
    }

    #[test]
    fn include_extensions_filters_non_matching_files() {
        let config = WatchConfig {
            watch_roots: vec![PathBuf::from("/")],
            include_extensions: vec![".rs".to_string()],
            ..WatchConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        let admitted = filter.admits(&key("/file.txt"), ChangeKind::Created, || {
            Ok(FileAttributes {
                size_bytes: 10,
                modified_at_unix_secs: 0,
                is_directory: false,
            })
        });
        assert!(!admitted);
    }

    #[test]
    fn include_extensions_does_not_reject_directories() {
        let config = WatchConfig {
            watch_roots: vec![PathBuf::from("/")],
            include_extensions: vec![".rs".to_string()],
            ..WatchConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        let admitted = filter.admits(&key("/project/src"), ChangeKind::Created, || {
            Ok(FileAttributes {
                size_bytes: 0,
                modified_at_unix_secs: 0,
                is_directory: true,
            })
        });
        assert!(admitted, "a directory must never be rejected by include_extensions");
    }
}

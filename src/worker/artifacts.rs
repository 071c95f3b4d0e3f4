//! Output artifact selection and transport encoding.

use std::collections::HashMap;
use std::path::{Component, Path};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

/// `*` and `?` stop at `/`, like a shell glob.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Decides which sandbox files are returned to the coordinator.
#[derive(Debug, Clone)]
pub struct OutputMatcher {
    match_all: bool,
    patterns: Vec<Pattern>,
}

impl OutputMatcher {
    /// An empty pattern list matches every file. Patterns that fail to parse
    /// never match.
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|raw| {
                let normalized = raw.replace('\\', "/");
                match Pattern::new(&normalized) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        tracing::warn!(pattern = %raw, error = %e, "Ignoring invalid output pattern");
                        None
                    }
                }
            })
            .collect();

        Self {
            match_all: patterns.is_empty(),
            patterns: compiled,
        }
    }

    /// `path` is a normalized `./`-prefixed relative path. A pattern matches
    /// the full path, the path without its `./` prefix, or the base name.
    pub fn matches(&self, path: &str) -> bool {
        if self.match_all {
            return true;
        }

        let bare = path.strip_prefix("./").unwrap_or(path);
        let base = bare.rsplit('/').next().unwrap_or(bare);

        self.patterns.iter().any(|pattern| {
            pattern.matches_with(path, MATCH_OPTIONS)
                || pattern.matches_with(bare, MATCH_OPTIONS)
                || pattern.matches_with(base, MATCH_OPTIONS)
        })
    }
}

/// `./`-prefixed, forward-slash form of `path` relative to `root`.
pub fn normalize_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("./{}", parts.join("/")))
}

/// True when `path` stays inside whatever directory it is joined onto.
pub fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    let mut has_normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            _ => return false,
        }
    }
    has_normal
}

pub fn encode_artifact(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_artifact(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Walk `root` and encode every regular file the patterns select.
///
/// Unreadable entries are skipped; they never fail the job.
pub fn collect_artifacts(root: &Path, patterns: &[String]) -> HashMap<String, String> {
    let matcher = OutputMatcher::new(patterns);
    let mut artifacts = HashMap::new();

    for entry in WalkDir::new(root).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(normalized) = normalize_relative(root, entry.path()) else {
            continue;
        };
        if !matcher.matches(&normalized) {
            tracing::debug!(path = %normalized, "Skipped file (not output)");
            continue;
        }

        match std::fs::read(entry.path()) {
            Ok(content) => {
                tracing::debug!(path = %normalized, size = content.len(), "Added output file");
                artifacts.insert(normalized, encode_artifact(&content));
            }
            Err(e) => {
                tracing::debug!(path = %normalized, error = %e, "Failed to read output file");
            }
        }
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> OutputMatcher {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        OutputMatcher::new(&owned)
    }

    #[test]
    fn extension_pattern_matches_by_base_name() {
        let m = matcher(&["*.exe"]);
        assert!(m.matches("./build/app.exe"));
        assert!(m.matches("./app.exe"));
        assert!(!m.matches("./app.exe.bak"));
    }

    #[test]
    fn empty_pattern_list_matches_everything() {
        let m = matcher(&[]);
        assert!(m.matches("./anything/at/all.txt"));
        assert!(m.matches("./.hidden"));
    }

    #[test]
    fn directory_pattern_matches_without_dot_prefix() {
        let m = matcher(&["out/*"]);
        assert!(m.matches("./out/app"));
        assert!(!m.matches("./out/nested/app"));
        assert!(!m.matches("./src/main.go"));
    }

    #[test]
    fn question_mark_and_character_class() {
        let m = matcher(&["lib?.[ao]"]);
        assert!(m.matches("./target/libx.a"));
        assert!(m.matches("./liby.o"));
        assert!(!m.matches("./libxy.a"));
        assert!(!m.matches("./libx.so"));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let m = matcher(&["[unclosed"]);
        assert!(!m.matches("./[unclosed"));
        assert!(!m.matches("./main.go"));
    }

    #[test]
    fn safe_relative_paths() {
        assert!(is_safe_relative("main.go"));
        assert!(is_safe_relative("./src/lib/mod.rs"));
        assert!(!is_safe_relative("../escape"));
        assert!(!is_safe_relative("src/../../escape"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative(""));
        assert!(!is_safe_relative("."));
    }

    #[test]
    fn artifact_encoding_is_lossless() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let decoded = decode_artifact(&encode_artifact(&bytes)).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn collects_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join("out/app"), b"\x7fELF").unwrap();
        std::fs::write(dir.path().join("main.go"), b"package main").unwrap();

        let artifacts = collect_artifacts(dir.path(), &["out/*".to_string()]);

        assert_eq!(artifacts.len(), 1);
        let encoded = artifacts.get("./out/app").unwrap();
        assert_eq!(decode_artifact(encoded).unwrap(), b"\x7fELF");
    }
}

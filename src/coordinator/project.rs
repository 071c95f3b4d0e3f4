use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::BuildEnvironment;
use crate::worker::artifacts::{decode_artifact, is_safe_relative};

/// Files larger than this stay behind when a project is shipped.
pub const MAX_PROJECT_FILE_SIZE: u64 = 1024 * 1024;

/// Compiled objects and binaries are never shipped.
const SKIPPED_EXTENSIONS: &[&str] = &["exe", "dll", "so", "dylib", "o", "obj"];

#[derive(Debug, thiserror::Error)]
pub enum PostBuildError {
    #[error("post-build script not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to start post-build script {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("post-build script failed with {status}\nOutput: {output}")]
    Failed { status: String, output: String },
}

/// Text content of every shippable file under `root`, keyed by
/// forward-slash relative path.
pub fn read_project_files(root: &Path) -> io::Result<HashMap<String, String>> {
    let mut files = HashMap::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata()?.len() > MAX_PROJECT_FILE_SIZE || is_skipped(entry.path()) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read(entry.path())?;
        files.insert(key, String::from_utf8_lossy(&content).into_owned());
    }

    tracing::debug!(root = %root.display(), files = files.len(), "Read project files");
    Ok(files)
}

fn is_skipped(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SKIPPED_EXTENSIONS
                .iter()
                .any(|skip| ext.eq_ignore_ascii_case(skip))
        })
        .unwrap_or(false)
}

/// Decode artifacts into `dest`, overwriting existing files. Bad entries are
/// skipped with a warning. Returns how many files were written.
pub async fn save_output_files(dest: &Path, output_files: &HashMap<String, String>) -> usize {
    let mut saved = 0;

    for (key, encoded) in output_files {
        if !is_safe_relative(key) {
            tracing::warn!(path = %key, "Skipping artifact with unsafe path");
            continue;
        }
        let content = match decode_artifact(encoded) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %key, error = %e, "Failed to decode artifact");
                continue;
            }
        };

        let target = dest.join(key.trim_start_matches("./"));
        if let Err(e) = write_artifact(&target, &content).await {
            tracing::warn!(path = %target.display(), error = %e, "Failed to write artifact");
            continue;
        }
        tracing::debug!(path = %target.display(), bytes = content.len(), "Saved artifact");
        saved += 1;
    }

    tracing::debug!(dest = %dest.display(), saved, "Saved output files");
    saved
}

async fn write_artifact(target: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(dir) = target.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(target, content).await?;

    // Artifacts are usually binaries; keep them runnable.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

/// Interpreter and arguments used to run `script`, chosen by extension.
pub fn script_command(script: &Path) -> (PathBuf, Vec<PathBuf>) {
    let ext = script
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let script = script.to_path_buf();

    match ext.as_str() {
        "bat" | "cmd" => ("cmd".into(), vec!["/C".into(), script]),
        "sh" => ("bash".into(), vec![script]),
        "ps1" => (
            "powershell".into(),
            vec!["-ExecutionPolicy".into(), "Bypass".into(), "-File".into(), script],
        ),
        "py" => ("python".into(), vec![script]),
        _ => (script, Vec::new()),
    }
}

/// Run the environment's post-build script in `dest`. Returns its combined
/// output.
pub async fn run_post_build_script(
    script: &str,
    dest: &Path,
    env: &BuildEnvironment,
) -> Result<String, PostBuildError> {
    let script_path = Path::new(script);
    let script_path = if script_path.is_absolute() {
        script_path.to_path_buf()
    } else {
        dest.join(script_path)
    };
    if !script_path.exists() {
        return Err(PostBuildError::NotFound(script_path));
    }

    let (program, args) = script_command(&script_path);
    tracing::debug!(script = %script_path.display(), "Running post-build script");

    let output = Command::new(&program)
        .args(&args)
        .current_dir(dest)
        .envs(&env.env_vars)
        .env("BOLTBUILD_PROJECT_DIR", dest)
        .env("BOLTBUILD_ENVIRONMENT", &env.name)
        .env("BOLTBUILD_OUTPUT_DIR", dest.join("output"))
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|source| PostBuildError::Spawn {
            path: script_path.clone(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(PostBuildError::Failed {
            status: output.status.to_string(),
            output: combined,
        });
    }

    tracing::debug!(script = %script_path.display(), "Post-build script completed");
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::artifacts::encode_artifact;

    #[test]
    fn collects_text_files_and_skips_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();
        std::fs::write(dir.path().join("src/nested/lib.go"), "package nested").unwrap();
        std::fs::write(dir.path().join("old.o"), [0u8, 1, 2]).unwrap();
        std::fs::write(dir.path().join("tool.EXE"), [0u8]).unwrap();
        std::fs::write(
            dir.path().join("big.txt"),
            vec![b'x'; MAX_PROJECT_FILE_SIZE as usize + 1],
        )
        .unwrap();

        let files = read_project_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["main.go"], "package main");
        assert_eq!(files["src/nested/lib.go"], "package nested");
    }

    #[test]
    fn missing_project_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_project_files(&dir.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn saves_artifacts_and_skips_unsafe_keys() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("project");
        let mut outputs = HashMap::new();
        outputs.insert("./out/app".to_string(), encode_artifact(b"\x7fELF"));
        outputs.insert("../escape".to_string(), encode_artifact(b"nope"));
        outputs.insert("./bad".to_string(), "!!not base64!!".to_string());

        assert_eq!(save_output_files(&dest, &outputs).await, 1);
        assert_eq!(std::fs::read(dest.join("out/app")).unwrap(), b"\x7fELF");
        assert!(!dir.path().join("escape").exists());
        assert!(!dest.join("bad").exists());
    }

    #[tokio::test]
    async fn saving_overwrites_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app"), "old").unwrap();
        let mut outputs = HashMap::new();
        outputs.insert("./app".to_string(), encode_artifact(b"new"));

        save_output_files(dir.path(), &outputs).await;
        assert_eq!(std::fs::read_to_string(dir.path().join("app")).unwrap(), "new");
    }

    #[test]
    fn scripts_dispatch_on_extension() {
        let (program, args) = script_command(Path::new("/p/deploy.sh"));
        assert_eq!(program, PathBuf::from("bash"));
        assert_eq!(args, vec![PathBuf::from("/p/deploy.sh")]);

        let (program, args) = script_command(Path::new("/p/deploy.PY"));
        assert_eq!(program, PathBuf::from("python"));
        assert_eq!(args.len(), 1);

        let (program, args) = script_command(Path::new("/p/deploy"));
        assert_eq!(program, PathBuf::from("/p/deploy"));
        assert!(args.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn post_build_script_sees_injected_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("post.sh"),
            "echo \"$BOLTBUILD_ENVIRONMENT:$GREETING\" > marker.txt\n",
        )
        .unwrap();
        let env = BuildEnvironment {
            name: "go".to_string(),
            env_vars: [("GREETING".to_string(), "hi".to_string())].into(),
            ..Default::default()
        };

        run_post_build_script("post.sh", dir.path(), &env).await.unwrap();
        let marker = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
        assert_eq!(marker.trim(), "go:hi");
    }

    #[tokio::test]
    async fn missing_post_build_script_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_post_build_script("nope.sh", dir.path(), &BuildEnvironment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PostBuildError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_post_build_script_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fail.sh"), "echo broken\nexit 3\n").unwrap();

        let err = run_post_build_script("fail.sh", dir.path(), &BuildEnvironment::default())
            .await
            .unwrap_err();
        match err {
            PostBuildError::Failed { output, .. } => assert!(output.contains("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }
}

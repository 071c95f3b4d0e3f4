use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::SandboxConfig;
use crate::protocol::{JobRequest, JobResult};
use crate::worker::artifacts::{collect_artifacts, is_safe_relative};

/// Reasons a job fails before or while its command runs. These end up as
/// the `error` text of a failed [`JobResult`]; the connection is unaffected.
#[derive(Debug, thiserror::Error)]
enum SandboxError {
    #[error("Invalid project name {0:?}: must be a single path component")]
    InvalidProjectName(String),

    #[error("Failed to create project directory: {0}")]
    CreateSandbox(#[source] std::io::Error),

    #[error("Refusing to write {0:?} outside the sandbox")]
    UnsafePath(String),

    #[error("Failed to write project files: {0}")]
    WriteFiles(#[source] std::io::Error),

    #[error("Failed to create execution directory: {0}")]
    ExecutionDir(#[source] std::io::Error),

    #[error("empty command in build request")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed while waiting for command: {0}")]
    Wait(#[source] std::io::Error),
}

/// Runs build jobs inside per-job sandbox directories.
///
/// Each job gets `<temp_root>/<project_name>`: the request's files are
/// written there, the command runs with the sandbox (or the requested
/// execution directory) as its working directory, matching outputs are read
/// back, and the directory is removed afterwards unless cleanup is disabled.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: SandboxConfig,
}

impl JobExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Directory a request would be materialized into.
    pub fn sandbox_path(&self, request: &JobRequest) -> PathBuf {
        self.config.temp_root.join(&request.project_name)
    }

    /// Execute one job to completion. Never fails: every problem is reported
    /// inside the returned result.
    pub async fn execute(&self, request: &JobRequest) -> JobResult {
        let start = Instant::now();
        tracing::info!(
            job_id = %request.id,
            environment = %request.environment,
            command = %request.command,
            files = request.files.len(),
            "Executing job"
        );

        let sandbox = match self.create_sandbox(request).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(job_id = %request.id, error = %e, "Sandbox setup failed");
                return JobResult::failed(&request.id, e.to_string(), start.elapsed());
            }
        };

        let mut result = match self.run_in_sandbox(&sandbox, request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(job_id = %request.id, error = %e, "Job failed");
                JobResult::failed(&request.id, e.to_string(), start.elapsed())
            }
        };
        result.duration = start.elapsed();

        self.cleanup(&sandbox).await;

        tracing::info!(
            job_id = %request.id,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            output_files = result.output_files.len(),
            "Job completed"
        );
        result
    }

    async fn create_sandbox(&self, request: &JobRequest) -> Result<PathBuf, SandboxError> {
        let mut components = Path::new(&request.project_name).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(SandboxError::InvalidProjectName(request.project_name.clone()));
        }

        let path = self.sandbox_path(request);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(SandboxError::CreateSandbox)?;
        Ok(path)
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &Path,
        request: &JobRequest,
    ) -> Result<JobResult, SandboxError> {
        materialize_files(sandbox, request).await?;

        let execution_dir = resolve_execution_dir(sandbox, &request.execution_dir);
        tokio::fs::create_dir_all(&execution_dir)
            .await
            .map_err(SandboxError::ExecutionDir)?;

        let mut tokens = request.command.split_whitespace();
        let program = tokens.next().ok_or(SandboxError::EmptyCommand)?;
        let args: Vec<&str> = tokens.collect();

        tracing::debug!(
            job_id = %request.id,
            program,
            args = ?args,
            execution_dir = %execution_dir.display(),
            "Spawning build command"
        );

        let child = Command::new(program)
            .args(&args)
            .current_dir(&execution_dir)
            .envs(&request.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let (status, combined) = wait_with_combined_output(child)
            .await
            .map_err(SandboxError::Wait)?;
        let mut output = String::from_utf8_lossy(&combined).into_owned();

        if !status.success() {
            let error = describe_failure(status);
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&error);
            output.push('\n');
            return Ok(JobResult {
                id: request.id.clone(),
                success: false,
                output,
                error,
                ..Default::default()
            });
        }

        let root = sandbox.to_path_buf();
        let patterns = request.output_paths.clone();
        let output_files =
            match tokio::task::spawn_blocking(move || collect_artifacts(&root, &patterns)).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(job_id = %request.id, error = %e, "Artifact collection aborted");
                    Default::default()
                }
            };

        Ok(JobResult {
            id: request.id.clone(),
            success: true,
            output,
            output_files,
            ..Default::default()
        })
    }

    async fn cleanup(&self, sandbox: &Path) {
        if !self.config.cleanup {
            tracing::debug!(sandbox = %sandbox.display(), "Temporary directory preserved");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(sandbox).await {
            tracing::warn!(sandbox = %sandbox.display(), error = %e, "Failed to remove sandbox");
        }
    }
}

async fn materialize_files(sandbox: &Path, request: &JobRequest) -> Result<(), SandboxError> {
    for (relative, content) in &request.files {
        if !is_safe_relative(relative) {
            return Err(SandboxError::UnsafePath(relative.clone()));
        }
        let full = sandbox.join(relative);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(SandboxError::WriteFiles)?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(SandboxError::WriteFiles)?;
    }
    Ok(())
}

/// Absolute paths are used as given, empty means the sandbox root, anything
/// else is joined under the sandbox.
pub fn resolve_execution_dir(sandbox: &Path, execution_dir: &str) -> PathBuf {
    if execution_dir.is_empty() {
        return sandbox.to_path_buf();
    }
    let dir = Path::new(execution_dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        sandbox.join(dir)
    }
}

fn describe_failure(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("command exited with non-zero exit code {code}"),
        None => format!("command terminated without an exit code ({status})"),
    }
}

/// Wait for `child`, interleaving stdout and stderr chunks in arrival order.
async fn wait_with_combined_output(mut child: Child) -> std::io::Result<(ExitStatus, Vec<u8>)> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut combined = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => match read? {
                0 => stdout = None,
                n => combined.extend_from_slice(&out_buf[..n]),
            },
            read = read_chunk(&mut stderr, &mut err_buf) => match read? {
                0 => stderr = None,
                n => combined.extend_from_slice(&err_buf[..n]),
            },
        }
    }

    let status = child.wait().await?;
    Ok((status, combined))
}

async fn read_chunk<R: AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

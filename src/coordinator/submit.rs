use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::connection::WorkerConnection;
use super::pending::PendingResults;
use super::project::{read_project_files, run_post_build_script, save_output_files};
use super::Coordinator;
use crate::config::BuildEnvironment;
use crate::error::{BoltError, Result};
use crate::protocol::{JobRequest, JobResult};

/// Which worker a submission may run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitTarget {
    /// First idle, version-compatible worker.
    Any,
    /// The worker at this dial or advertised address, or nothing.
    Address(String),
}

impl fmt::Display for SubmitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitTarget::Any => f.write_str("any"),
            SubmitTarget::Address(addr) => f.write_str(addr),
        }
    }
}

/// Fresh correlation id; never reused within a process.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Job request for `environment` carrying `files`.
pub fn build_request(
    environment: &str,
    env: &BuildEnvironment,
    files: std::collections::HashMap<String, String>,
) -> JobRequest {
    let id = new_job_id();
    JobRequest {
        project_name: format!("project_{id}"),
        id,
        environment: environment.to_string(),
        command: env.command.clone(),
        project_dir: env.project_dir.display().to_string(),
        execution_dir: env.execution_dir.clone(),
        output_paths: env.output_paths.clone(),
        env_vars: env.env_vars.clone(),
        files,
    }
}

/// Open the correlation slot for a reserved `conn` and write `request`.
/// On failure the reservation and the slot are both released.
async fn deliver(
    conn: Arc<WorkerConnection>,
    pending: PendingResults,
    request: JobRequest,
) -> Result<oneshot::Receiver<JobResult>> {
    let rx = pending.register(&request.id).await;

    // The receive loop may have closed the connection between reserve
    // and register; its cleanup would then have missed this slot.
    if conn.is_closed() {
        pending.abandon(&request.id).await;
        return Err(BoltError::ConnectionClosed(conn.addr().to_string()));
    }

    if let Err(source) = conn.send(&request).await {
        conn.release();
        pending.abandon(&request.id).await;
        return Err(BoltError::SendFailed {
            addr: conn.addr().to_string(),
            source,
        });
    }
    Ok(rx)
}

impl Coordinator {
    /// Send `request` to a worker chosen by `target` and wait for its result.
    ///
    /// Preconditions are checked and the worker reserved before anything is
    /// written. Exactly one of result delivery, the build timeout or a
    /// disconnect settles the call.
    pub async fn dispatch(&self, request: JobRequest, target: &SubmitTarget) -> Result<JobResult> {
        let job_id = request.id.clone();
        let conn = match target {
            SubmitTarget::Any => self.registry.reserve_any(&job_id).await?,
            SubmitTarget::Address(addr) => self.registry.reserve_at(addr, &job_id).await?,
        };

        // Registration and the write run to completion on their own task. A
        // caller dropped mid-send only stops waiting; the result or a
        // disconnect releases the worker as usual.
        let delivery = tokio::spawn(deliver(conn.clone(), self.pending.clone(), request));
        let mut rx = match delivery.await {
            Ok(delivered) => delivered?,
            Err(e) => {
                conn.release();
                self.pending.abandon(&job_id).await;
                return Err(BoltError::Io(std::io::Error::other(e)));
            }
        };

        tracing::debug!(
            job_id = %job_id,
            worker_id = %conn.identity().id,
            addr = %conn.addr(),
            "Build submitted"
        );

        let timeout = self.config.coordinator.timeouts.build();
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(BoltError::ConnectionClosed(conn.addr().to_string())),
            Err(_) => {
                if self.pending.abandon(&job_id).await {
                    tracing::warn!(job_id = %job_id, addr = %conn.addr(), ?timeout, "Build timed out");
                    return Err(BoltError::Timeout(timeout));
                }
                // Lost the race: the slot was already claimed by delivery or
                // disconnect, so the channel settles immediately.
                rx.await
                    .map_err(|_| BoltError::ConnectionClosed(conn.addr().to_string()))
            }
        }
    }

    /// Ship `environment`'s project to a worker, build it and write any
    /// artifacts back into the project directory.
    pub async fn submit_build(&self, environment: &str, target: SubmitTarget) -> Result<JobResult> {
        let env = self
            .config
            .build
            .environment(environment)
            .cloned()
            .ok_or_else(|| BoltError::UnknownEnvironment(environment.to_string()))?;

        let project_dir = env.project_dir.clone();
        let files = tokio::task::spawn_blocking(move || read_project_files(&project_dir))
            .await
            .map_err(|e| BoltError::Io(std::io::Error::other(e)))?
            .map_err(|source| BoltError::ProjectFiles {
                path: env.project_dir.display().to_string(),
                source,
            })?;

        let request = build_request(environment, &env, files);
        tracing::info!(
            job_id = %request.id,
            environment = %environment,
            target = %target,
            "Submitting build"
        );

        let result = self.dispatch(request, &target).await?;
        if result.success {
            self.finish_build(&env, &result).await;
        }

        tracing::info!(
            job_id = %result.id,
            success = result.success,
            duration = ?result.duration,
            artifacts = result.output_files.len(),
            "Build finished"
        );
        Ok(result)
    }

    async fn finish_build(&self, env: &BuildEnvironment, result: &JobResult) {
        let dest: &Path = &env.project_dir;
        if !result.output_files.is_empty() {
            save_output_files(dest, &result.output_files).await;
        }

        if let Some(script) = env.post_build_script.as_deref().filter(|s| !s.is_empty()) {
            if let Err(e) = run_post_build_script(script, dest, env).await {
                tracing::warn!(job_id = %result.id, error = %e, "Post-build script failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn request_copies_environment_and_names_sandbox_after_id() {
        let env = BuildEnvironment {
            name: "go".to_string(),
            command: "go build -o out/app .".to_string(),
            project_dir: PathBuf::from("/src/app"),
            execution_dir: ".".to_string(),
            output_paths: vec!["out/*".to_string()],
            ..Default::default()
        };
        let request = build_request("go-build", &env, Default::default());

        assert_eq!(request.environment, "go-build");
        assert_eq!(request.command, env.command);
        assert_eq!(request.output_paths, env.output_paths);
        assert_eq!(request.project_name, format!("project_{}", request.id));
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(new_job_id(), new_job_id());
    }
}

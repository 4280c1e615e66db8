//! Runs the external recompressor process source→target with a bounded,
//! polled wait and a best-effort process log.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLLS: u32 = 180; // ~15 minutes total
const MEMLIMIT_MB: &str = "6000";
const LOG_FILENAME: &str = ".guetzli-processor.log";

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transform did not exit within {0:?}")]
    Timeout(Duration),
    #[error("transform exited with status {0}")]
    ExitCode(i32),
    #[error("transform failed: {0}")]
    Failed(String),
}

/// Spawns `{recompress_cmd} --memlimit 6000 <source> <target>`, waiting for
/// it in 5-second increments up to `MAX_POLLS` attempts. Standard output and
/// error are appended to `.guetzli-processor.log` in the source's parent
/// directory, best-effort.
pub async fn transform(
    recompress_cmd: &str,
    source: &Path,
    target: &Path,
) -> Result<(), TransformError> {
    let log_path = source
        .parent()
        .map(|p| p.join(LOG_FILENAME))
        .unwrap_or_else(|| Path::new(LOG_FILENAME).to_path_buf());

    let mut child = Command::new(recompress_cmd)
        .arg("--memlimit")
        .arg(MEMLIMIT_MB)
        .arg(source)
        .arg(target)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TransformError::Failed(format!("failed to spawn {recompress_cmd}: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let log_task = tokio::spawn(append_output_to_log(log_path, stdout, stderr));

    let mut attempts = 0;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                attempts += 1;
                if attempts >= MAX_POLLS {
                    let _ = child.kill().await;
                    break Err(TransformError::Timeout(POLL_INTERVAL * MAX_POLLS));
                }
                // A sleep here is the only suspension point in the poll
                // loop; if cancelled, the spec treats that as logged and
                // retried rather than aborting the transform mid-flight.
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => break Err(TransformError::Failed(format!("wait failed: {e}"))),
        }
    };

    let _ = log_task.await;

    let status = status?;
    if !status.success() {
        return Err(TransformError::ExitCode(status.code().unwrap_or(-1)));
    }
    Ok(())
}

/// Drains the child's stdout/stderr pipes into the process log, best-effort.
/// Failure to open the log file is logged at `warn` and otherwise ignored —
/// it never fails the transform.
async fn append_output_to_log(
    log_path: std::path::PathBuf,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) {
    let file = match OpenOptions::new().create(true).append(true).open(&log_path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %log_path.display(), error = %e, "failed to open processor log");
            return;
        }
    };
    let mut file = file;

    // Both pipes must be drained concurrently: the child can fill the
    // stderr pipe buffer while this task is still blocked reading stdout
    // (or vice versa), which would otherwise stall the child until the
    // poll loop's timeout kills it.
    let (stdout_buf, stderr_buf) = tokio::join!(read_pipe(stdout), read_pipe(stderr));

    if let Some(buf) = stdout_buf {
        let _ = file.write_all(&buf).await;
    }
    if let Some(buf) = stderr_buf {
        let _ = file.write_all(&buf).await;
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Option<Vec<u8>> {
    let mut pipe = pipe?;
    let mut buf = Vec::new();
    match tokio::io::AsyncReadExt::read_to_end(&mut pipe, &mut buf).await {
        Ok(_) if !buf.is_empty() => Some(buf),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn successful_transform_produces_target() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "guetzli",
            "#!/bin/sh\n# args: --memlimit 6000 <src> <dst>\ncp \"$3\" \"$4\"\n",
        );
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"fake jpeg").unwrap();
        let target = dir.path().join("target.jpg");

        transform(script.to_str().unwrap(), &source, &target)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"fake jpeg");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "guetzli", "#!/bin/sh\nexit 3\n");
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"fake jpeg").unwrap();
        let target = dir.path().join("target.jpg");

        let err = transform(script.to_str().unwrap(), &source, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::ExitCode(3)));
    }

    #[tokio::test]
    async fn output_is_appended_to_processor_log() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "guetzli",
            "#!/bin/sh\necho hello-stdout\n>&2 echo hello-stderr\ncp \"$3\" \"$4\"\n",
        );
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"fake jpeg").unwrap();
        let target = dir.path().join("target.jpg");

        transform(script.to_str().unwrap(), &source, &target)
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join(".guetzli-processor.log")).unwrap();
        assert!(log.contains("hello-stdout"));
        assert!(log.contains("hello-stderr"));
    }
}

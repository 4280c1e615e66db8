//! Runs the external JPEG quality-probe process against a single file.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

const PROBE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe did not exit within {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Failed(String),
}

/// Spawns `{probe_cmd} -format %Q <path>`, reads its first line of stdout,
/// and parses it as the JPEG quality (1..100). `PATH` is forwarded by simply
/// not clearing the child's inherited environment.
pub async fn probe(probe_cmd: &str, path: &Path) -> Result<u32, ProbeError> {
    use tokio::io::AsyncReadExt;

    let mut child = Command::new(probe_cmd)
        .arg("-format")
        .arg("%Q")
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ProbeError::Failed(format!("failed to spawn {probe_cmd}: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout was piped");

    // Read all of stdout and wait for exit within the same timeout window —
    // a probe that hangs with output buffered but never exits must still
    // be killed, not reported as success.
    let read_and_wait = async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        let status = child.wait().await?;
        Ok::<(std::process::ExitStatus, Vec<u8>), std::io::Error>((status, buf))
    };

    let (status, raw_stdout) = match tokio::time::timeout(PROBE_WAIT, read_and_wait).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(ProbeError::Failed(format!("probe wait failed: {e}"))),
        Err(_) => {
            let _ = child.kill().await;
            return Err(ProbeError::Timeout(PROBE_WAIT));
        }
    };

    if !status.success() {
        return Err(ProbeError::Failed(format!(
            "probe exited with status {:?}",
            status.code()
        )));
    }

    let first_line = String::from_utf8_lossy(&raw_stdout)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    first_line
        .parse::<u32>()
        .map_err(|_| ProbeError::Failed(format!("non-numeric probe output: '{first_line}'")))
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
    async fn parses_quality_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "identify", "#!/bin/sh\necho 87\n");
        let quality = probe(script.to_str().unwrap(), Path::new("anything.jpg"))
            .await
            .unwrap();
        assert_eq!(quality, 87);
    }

    #[tokio::test]
    async fn non_numeric_output_is_a_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "identify", "#!/bin/sh\necho not-a-number\n");
        let err = probe(script.to_str().unwrap(), Path::new("anything.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "identify", "#!/bin/sh\nexit 1\n");
        let err = probe(script.to_str().unwrap(), Path::new("anything.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Failed(_)));
    }
}

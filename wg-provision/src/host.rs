// Command execution and file transfer on the target host

//! Target host access
//!
//! The orchestrator only talks to the VPN server through [`RemoteExecutor`].
//! [`SshExecutor`] drives the system `ssh` client; [`LocalExecutor`] runs
//! against the machine the tool runs on (target `localhost`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status used by download scripts to signal a missing file
const MISSING_FILE_STATUS: i32 = 3;

/// Result of a command run on the target host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(output: &Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Command execution and file transfer on the VPN server
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Human-readable target name for logs
    fn target(&self) -> &str;

    /// Run a shell command
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Atomically replace `path` with `contents`, created with `mode`
    async fn upload(&self, contents: &[u8], path: &str, mode: u32) -> Result<()>;

    /// Read `path`; `None` when it does not exist
    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Run a command and fail unless it exits successfully; returns stdout
pub async fn run_checked<R: RemoteExecutor + ?Sized>(exec: &R, command: &str) -> Result<String> {
    let output = exec
        .run(command)
        .await
        .with_context(|| format!("Failed to run `{}` on {}", command, exec.target()))?;
    if !output.success {
        anyhow::bail!(
            "`{}` failed on {}: {}",
            command,
            exec.target(),
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell script that atomically writes stdin to `path` with `mode`
fn upload_script(path: &str, mode: u32) -> String {
    let tmp = shell_quote(&format!("{}.tmp", path));
    format!(
        "umask 077 && cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {dest}",
        tmp = tmp,
        mode = mode,
        dest = shell_quote(path)
    )
}

/// Shell script that prints `path` or exits with [`MISSING_FILE_STATUS`]
fn download_script(path: &str) -> String {
    let quoted = shell_quote(path);
    format!(
        "if [ -e {p} ]; then cat {p}; else exit {status}; fi",
        p = quoted,
        status = MISSING_FILE_STATUS
    )
}

/// Spawn `command`, optionally feeding stdin, and collect its output
async fn spawn_collect(mut command: Command, stdin: Option<&[u8]>) -> std::io::Result<Output> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        pipe.shutdown().await?;
    }
    child.wait_with_output().await
}

/// Remote host reached through the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    destination: String,
    ssh: PathBuf,
    options: Vec<String>,
}

impl SshExecutor {
    /// Connect to `destination` (`host` or `user@host`) non-interactively
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ssh: PathBuf::from("ssh"),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    /// Use a different `ssh` binary
    pub fn with_ssh_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh = path.into();
        self
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(&self.options)
            .arg("--")
            .arg(&self.destination)
            .arg(remote);
        cmd
    }

    async fn exec(&self, remote: &str, stdin: Option<&[u8]>) -> Result<Output> {
        spawn_collect(self.command(remote), stdin)
            .await
            .with_context(|| format!("Failed to execute ssh to {}", self.destination))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn target(&self) -> &str {
        &self.destination
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        log::debug!("[{}] $ {}", self.destination, command);
        let output = self.exec(command, None).await?;
        Ok(CommandOutput::from_output(&output))
    }

    async fn upload(&self, contents: &[u8], path: &str, mode: u32) -> Result<()> {
        log::debug!("[{}] upload {} ({:o})", self.destination, path, mode);
        let output = self.exec(&upload_script(path, mode), Some(contents)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Upload of {} to {} failed: {}", path, self.destination, stderr.trim());
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        log::debug!("[{}] download {}", self.destination, path);
        let output = self.exec(&download_script(path), None).await?;
        if output.status.code() == Some(MISSING_FILE_STATUS) {
            return Ok(None);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Download of {} from {} failed: {}",
                path,
                self.destination,
                stderr.trim()
            );
        }
        Ok(Some(output.stdout))
    }
}

/// The local machine
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        log::debug!("[localhost] $ {}", command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let output = spawn_collect(cmd, None)
            .await
            .context("Failed to execute sh")?;
        Ok(CommandOutput::from_output(&output))
    }

    async fn upload(&self, contents: &[u8], path: &str, mode: u32) -> Result<()> {
        log::debug!("[localhost] write {} ({:o})", path, mode);
        let dest = Path::new(path);
        let tmp = PathBuf::from(format!("{}.tmp", path));
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(mode);
        let mut file = options
            .open(&tmp)
            .await
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all().await?;
        // Creation mode is subject to the umask
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))
                .await
                .with_context(|| format!("Failed to set permissions on {}", tmp.display()))?;
        }
        tokio::fs::rename(&tmp, dest)
            .await
            .with_context(|| format!("Failed to move {} into place", path))?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/wireguard/wg0.conf"), "/etc/wireguard/wg0.conf");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_upload_script() {
        assert_eq!(
            upload_script("/etc/wireguard/wg0.conf", 0o600),
            "umask 077 && cat > /etc/wireguard/wg0.conf.tmp && chmod 600 /etc/wireguard/wg0.conf.tmp \
             && mv -f /etc/wireguard/wg0.conf.tmp /etc/wireguard/wg0.conf"
        );
    }

    #[test]
    fn test_download_script() {
        assert_eq!(
            download_script("/etc/sysctl.conf"),
            "if [ -e /etc/sysctl.conf ]; then cat /etc/sysctl.conf; else exit 3; fi"
        );
    }

    #[test]
    fn test_ssh_command_line() {
        let exec = SshExecutor::new("root@vpn.example.org");
        let cmd = exec.command("uname -r");
        let std_cmd = cmd.as_std();
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(std_cmd.get_program().to_string_lossy(), "ssh");
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "--", "root@vpn.example.org", "uname -r"]
        );
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_local_executor_roundtrip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf");
        let path_str = path.to_str().unwrap();
        let exec = LocalExecutor;

        assert_eq!(exec.download(path_str).await.unwrap(), None);
        exec.upload(b"[Interface]\n", path_str, 0o600).await.unwrap();
        assert_eq!(
            exec.download(path_str).await.unwrap().as_deref(),
            Some(&b"[Interface]\n"[..])
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_local_run_checked() {
        let exec = LocalExecutor;
        assert_eq!(run_checked(&exec, "echo hello").await.unwrap(), "hello\n");
        assert!(run_checked(&exec, "exit 1").await.is_err());
    }
}

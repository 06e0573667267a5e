// External tool adapters

//! Adapters around command line tools
//!
//! - [`WgToolKeyGenerator`]: key generation through `wg genkey`, `wg pubkey`
//!   and `wg genpsk`
//! - [`QrEncoder`]: best-effort PNG rendering of client documents through
//!   `qrencode`
//!
//! Both run synchronously; they are only called from the local part of a run.

use crate::keystore::{replace_owner_only, KeyGenerator};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Run `program args...`, feeding `stdin` if given, and return trimmed stdout
fn run_tool(program: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<String, String> {
    let stdout = run_tool_raw(program, args, stdin)?;
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

/// Like [`run_tool`] but returns stdout untouched
fn run_tool_raw(program: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to execute {}: {}", program.display(), e))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)
            .map_err(|e| format!("failed to write to {}: {}", program.display(), e))?;
        // Dropping the pipe closes stdin
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("failed to wait for {}: {}", program.display(), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} {} failed: {}",
            program.display(),
            args.join(" "),
            stderr.trim()
        ));
    }

    Ok(output.stdout)
}

/// Key generation through the `wg` command line tool
#[derive(Debug, Clone)]
pub struct WgToolKeyGenerator {
    wg: PathBuf,
}

impl WgToolKeyGenerator {
    /// Use the `wg` binary at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { wg: path.into() }
    }
}

impl Default for WgToolKeyGenerator {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl KeyGenerator for WgToolKeyGenerator {
    fn generate_private(&self) -> Result<String, String> {
        run_tool(&self.wg, &["genkey"], None)
    }

    fn derive_public(&self, private_key: &str) -> Result<String, String> {
        let input = format!("{}\n", private_key);
        run_tool(&self.wg, &["pubkey"], Some(input.as_bytes()))
    }

    fn generate_preshared(&self) -> Result<String, String> {
        run_tool(&self.wg, &["genpsk"], None)
    }
}

/// PNG QR codes through `qrencode`
#[derive(Debug, Clone)]
pub struct QrEncoder {
    qrencode: PathBuf,
}

impl QrEncoder {
    /// Use the `qrencode` binary at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            qrencode: path.into(),
        }
    }

    /// Encode `text` into a PNG at `output`
    ///
    /// The image is read from `qrencode`'s stdout and written owner-only, so
    /// it is never readable by others. Returns `false` without leaving a file
    /// behind when the tool is missing or fails; a missing QR code never
    /// fails a run.
    pub fn encode_png(&self, text: &str, output: &Path) -> bool {
        let png = match run_tool_raw(
            &self.qrencode,
            &["-t", "png", "-o", "-"],
            Some(text.as_bytes()),
        ) {
            Ok(png) if !png.is_empty() => png,
            Ok(_) => {
                log::warn!("Skipping QR code {}: qrencode produced no output", output.display());
                return false;
            }
            Err(e) => {
                log::warn!("Skipping QR code {}: {}", output.display(), e);
                return false;
            }
        };

        match replace_owner_only(output, &png, false) {
            Ok(()) => {
                log::debug!("Wrote QR code {}", output.display());
                true
            }
            Err(e) => {
                log::warn!("Skipping QR code {}: {}", output.display(), e);
                false
            }
        }
    }
}

impl Default for QrEncoder {
    fn default() -> Self {
        Self::new("qrencode")
    }
}

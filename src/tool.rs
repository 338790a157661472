//! External RDB patch tool invocation.
//!
//! The tool rewrites root.rdb/root.rdx from whatever mod containers sit in
//! the package directory, creating `.original` backups on its first run. It
//! is interactive (asks for confirmation on stdin) and is given a hard
//! deadline, after which it is killed and the operation fails as if the tool
//! had exited non-zero.
//!
//! The manager takes the tool as a trait object so test environments can
//! swap in `MockPatchTool`, which only fabricates the backup files.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::info;
use wait_timeout::ChildExt;

use crate::error::{ModError, Result};

/// Patch tool executable expected inside the game package directory.
pub const PATCH_TOOL_EXE: &str = "yumia_mod_insert_into_rdb.exe";

/// Core archive files the tool rewrites, with their backup names.
pub const CORE_RDB_FILES: [&str; 2] = ["root.rdb", "root.rdx"];
pub const CORE_RDB_BACKUPS: [&str; 2] = ["root.rdb.original", "root.rdx.original"];

const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Applies staged mod containers to the core RDB files.
pub trait PatchTool {
    /// Run the tool with the package directory as working directory.
    /// Returns captured output on success.
    fn apply(&self, package_dir: &Path) -> Result<String>;
}

/// Invokes the real patch tool executable.
pub struct RdbPatchTool;

impl PatchTool for RdbPatchTool {
    fn apply(&self, package_dir: &Path) -> Result<String> {
        let exe = package_dir.join(PATCH_TOOL_EXE);
        if !exe.exists() {
            return Err(ModError::ExternalToolFailure(format!(
                "patch tool not found at {}",
                exe.display()
            )));
        }

        info!("Running patch tool: {}", exe.display());
        let mut child = Command::new(&exe)
            .current_dir(package_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ModError::ExternalToolFailure(format!("failed to launch: {e}")))?;

        // Confirm the interactive prompt, then close stdin.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"y\n");
        }

        // Drain stdout on a thread so a chatty tool can't fill the pipe and
        // stall while we wait on the deadline.
        let stdout_pipe = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut output = String::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_string(&mut output);
            }
            output
        });

        let status = match child.wait_timeout(TOOL_TIMEOUT) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(ModError::ExternalToolFailure(format!(
                    "patch tool timed out after {} seconds",
                    TOOL_TIMEOUT.as_secs()
                )));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(ModError::ExternalToolFailure(format!(
                    "failed waiting for patch tool: {e}"
                )));
            }
        };

        let stdout = reader.join().unwrap_or_default();
        info!("  patch tool exited with code {:?}", status.code());
        for line in last_lines(&stdout, 10) {
            info!("  [tool] {line}");
        }

        if status.success() {
            Ok(stdout)
        } else {
            let tail = last_lines(&stdout, 10).join("\n");
            Err(ModError::ExternalToolFailure(format!(
                "exit code {:?}\n{}",
                status.code(),
                tail
            )))
        }
    }
}

/// No-op stand-in for environments without the real tool.
///
/// Creates empty core files and their backups when missing, which is enough
/// for install/uninstall/migration flows to exercise their backup handling.
pub struct MockPatchTool;

impl PatchTool for MockPatchTool {
    fn apply(&self, package_dir: &Path) -> Result<String> {
        info!("Running mock patch tool");
        for (core, backup) in CORE_RDB_FILES.iter().zip(CORE_RDB_BACKUPS) {
            let core_path = package_dir.join(core);
            let backup_path = package_dir.join(backup);
            if !core_path.exists() {
                std::fs::write(&core_path, b"")?;
            }
            if !backup_path.exists() {
                std::fs::copy(&core_path, &backup_path)?;
                info!("  Created mock backup: {backup}");
            }
        }
        Ok("mock patch tool".to_string())
    }
}

/// A tool that always fails, for exercising rollback paths in tests.
#[cfg(test)]
pub struct FailingPatchTool;

#[cfg(test)]
impl PatchTool for FailingPatchTool {
    fn apply(&self, _package_dir: &Path) -> Result<String> {
        Err(ModError::ExternalToolFailure("simulated failure".to_string()))
    }
}

fn last_lines(output: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = output.trim().lines().filter(|l| !l.is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mock_tool_creates_backups() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("root.rdb"), b"rdb bytes").unwrap();

        MockPatchTool.apply(dir.path()).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("root.rdb.original")).unwrap(),
            b"rdb bytes"
        );
        // root.rdx did not exist, so both it and its backup are fabricated
        assert!(dir.path().join("root.rdx").exists());
        assert!(dir.path().join("root.rdx.original").exists());
    }

    #[test]
    fn test_mock_tool_preserves_existing_backups() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("root.rdb"), b"patched").unwrap();
        std::fs::write(dir.path().join("root.rdb.original"), b"vanilla").unwrap();

        MockPatchTool.apply(dir.path()).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("root.rdb.original")).unwrap(),
            b"vanilla"
        );
    }

    #[test]
    fn test_real_tool_missing_exe() {
        let dir = tempdir().unwrap();
        let err = RdbPatchTool.apply(dir.path()).unwrap_err();
        assert!(matches!(err, ModError::ExternalToolFailure(_)));
    }

    #[test]
    fn test_last_lines() {
        let output = "one\ntwo\nthree\n";
        assert_eq!(last_lines(output, 2), vec!["two", "three"]);
        assert_eq!(last_lines(output, 10), vec!["one", "two", "three"]);
    }
}

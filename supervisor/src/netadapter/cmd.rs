//! Checked execution of external network tools.
//!
//! Every binary is looked up through the OS's normal `PATH` search, then
//! symlink-resolved, and the resolved path must sit under the calling
//! adapter's allowlist of system directories. A first `PATH` hit outside
//! the allowlist is rejected rather than skipped, so a shadowing entry
//! earlier in `PATH` cannot redirect the invocation.

use crate::error::SupervisorError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn resolve_tool(name: &str, allowed_dirs: &[&str]) -> Result<PathBuf, SupervisorError> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if !candidate.is_file() {
            continue;
        }
        let resolved = std::fs::canonicalize(&candidate)?;
        if allowed_dirs
            .iter()
            .any(|allowed| resolved.starts_with(allowed))
        {
            return Ok(resolved);
        }
        return Err(SupervisorError::NetworkSetup(format!(
            "{name} resolves to {} outside the system tool directories",
            resolved.display()
        )));
    }
    Err(SupervisorError::NetworkSetup(format!(
        "{name} not found in PATH"
    )))
}

pub async fn run(tool: &Path, args: &[&str]) -> Result<String, SupervisorError> {
    tracing::debug!(tool = %tool.display(), ?args, "running external tool");
    let output = tokio::time::timeout(TOOL_TIMEOUT, Command::new(tool).args(args).output())
        .await
        .map_err(|_| {
            SupervisorError::NetworkSetup(format!(
                "{} {} timed out after {TOOL_TIMEOUT:?}",
                tool.display(),
                args.join(" ")
            ))
        })??;

    if !output.status.success() {
        return Err(SupervisorError::NetworkSetup(format!(
            "{} {} failed: {}",
            tool.display(),
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub async fn run_tool(
    name: &str,
    allowed_dirs: &[&str],
    args: &[&str],
) -> Result<String, SupervisorError> {
    let path = resolve_tool(name, allowed_dirs)?;
    run(&path, args).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    // PATH is process-global; serialize the tests that rewrite it.
    static PATH_LOCK: Mutex<()> = Mutex::new(());

    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn with_path<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = PATH_LOCK.lock().unwrap();
        let old_path = std::env::var_os("PATH");
        unsafe { std::env::set_var("PATH", dir) };
        let result = f();
        if let Some(old) = old_path {
            unsafe { std::env::set_var("PATH", old) };
        }
        result
    }

    #[test]
    fn rejects_tool_outside_allowlist() {
        let dir = tempfile::TempDir::new().unwrap();
        fake_tool(dir.path(), "iptool");

        let result = with_path(dir.path(), || resolve_tool("iptool", &["/usr/sbin", "/sbin"]));
        assert!(matches!(result, Err(SupervisorError::NetworkSetup(_))));
    }

    #[test]
    fn rejects_symlink_escaping_allowlist() {
        let outside = tempfile::TempDir::new().unwrap();
        let inside = tempfile::TempDir::new().unwrap();
        let target = fake_tool(outside.path(), "real");
        let link = inside.path().join("iptool");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let inside_str = inside.path().to_string_lossy().into_owned();
        // The link sits inside the allowlist but its target does not.
        let result = with_path(inside.path(), || {
            resolve_tool("iptool", &[inside_str.as_str()])
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("failing");
        std::fs::write(&path, "#!/bin/sh\necho boom >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = run(&path, &[]).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("boom"), "missing stderr in {text}");
    }
}

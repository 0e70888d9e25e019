//! Shell tool — run a single command to completion and capture its output.
//!
//! Reference implementation only: no sandboxing, no background sessions.
//! Sufficient to exercise the engine's tool-dispatch loop and the loop
//! detector's `shell` cap; not meant for untrusted input.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct ShellRequest {
    pub command: String,
    /// Hard wall-clock timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub stdin: Option<String>,
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResponse {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

/// Environment variables a reference shell tool must never let a model override.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "PATH",
        "HOME",
        "SHELL",
        "SSH_AUTH_SOCK",
    ];
    BLOCKED.contains(&name.to_ascii_uppercase().as_str())
}

const MAX_OUTPUT_CHARS: usize = 32_000;

/// Run a command to completion (or until `timeout_secs` elapses), returning
/// combined stdout/stderr truncated to a reasonable size.
pub async fn run(req: ShellRequest) -> Result<ShellResponse, String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.command);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::piped());

    if let Some(ref wd) = req.workdir {
        cmd.current_dir(wd);
    }
    if let Some(ref env) = req.env {
        for (k, v) in env {
            if is_dangerous_env_var(k) {
                return Err(format!("environment variable '{k}' is blocked by security policy"));
            }
            cmd.env(k, v);
        }
    }

    let mut child = cmd.spawn().map_err(|e| format!("failed to spawn: {e}"))?;

    if let Some(ref data) = req.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data.as_bytes()).await;
        }
    } else {
        drop(child.stdin.take());
    }

    let timeout = Duration::from_secs(req.timeout_secs.max(1));
    let wait = async {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await;
        (status, stdout, stderr)
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok((status, stdout, stderr)) => {
            let mut output = stdout;
            if !stderr.is_empty() {
                output.push_str("\n[stderr]\n");
                output.push_str(&stderr);
            }
            truncate_output(&mut output);
            Ok(ShellResponse {
                exit_code: status.ok().and_then(|s| s.code()),
                output,
                timed_out: false,
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            Ok(ShellResponse {
                exit_code: None,
                output: format!("command timed out after {}s", req.timeout_secs),
                timed_out: true,
            })
        }
    }
}

fn truncate_output(output: &mut String) {
    if output.len() <= MAX_OUTPUT_CHARS {
        return;
    }
    let mut boundary = MAX_OUTPUT_CHARS;
    while boundary < output.len() && !output.is_char_boundary(boundary) {
        boundary += 1;
    }
    output.truncate(boundary);
    output.push_str("\n[...truncated]");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_simple_command() {
        let result = run(ShellRequest {
            command: "echo hello".into(),
            timeout_secs: 5,
            workdir: None,
            env: None,
            stdin: None,
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("hello"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let result = run(ShellRequest {
            command: "exit 3".into(),
            timeout_secs: 5,
            workdir: None,
            env: None,
            stdin: None,
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let result = run(ShellRequest {
            command: "sleep 5".into(),
            timeout_secs: 1,
            workdir: None,
            env: None,
            stdin: None,
        })
        .await
        .unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn rejects_dangerous_env_override() {
        let mut env = HashMap::new();
        env.insert("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string());
        let result = run(ShellRequest {
            command: "echo hi".into(),
            timeout_secs: 5,
            workdir: None,
            env: Some(env),
            stdin: None,
        })
        .await;
        assert!(result.is_err());
    }
}

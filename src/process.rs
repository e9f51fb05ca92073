//! Subprocess execution helpers.
//!
//! `Cmd` is a thin builder over `std::process::Command` with three run modes:
//! captured (`run`), inherited stdio (`run_interactive`), and line-streamed
//! (`run_streamed`) for callers that must re-frame child output as it arrives.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// Outcome of a captured command run.
#[derive(Debug)]
pub struct CmdResult {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Builder for external commands.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        for (k, v) in vars {
            self.envs.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Message used when the command fails and `allow_fail` is not set.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Non-zero exit becomes a normal `CmdResult` instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn failure_msg(&self) -> String {
        match &self.error_msg {
            Some(msg) => msg.clone(),
            None => format!("{} failed", self.program),
        }
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdResult> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let detail = tail(&result.stderr, 20);
            if detail.is_empty() {
                bail!("{} (exit code {})", self.failure_msg(), result.exit_code());
            }
            bail!(
                "{} (exit code {})\n{}",
                self.failure_msg(),
                result.exit_code(),
                detail
            );
        }
        Ok(result)
    }

    /// Run with inherited stdio (child output goes straight to the terminal).
    pub fn run_interactive(self) -> Result<i32> {
        let status = self
            .command()
            .status()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        let code = status.code().unwrap_or(-1);
        if !status.success() && !self.allow_fail {
            bail!("{} (exit code {})", self.failure_msg(), code);
        }
        Ok(code)
    }

    /// Run with stdout and stderr pumped line-by-line through `on_line`, in
    /// arrival order, fully drained before this returns. Used where child
    /// output must be re-framed (debugger machine-interface capture).
    pub fn run_streamed(self, mut on_line: impl FnMut(&str)) -> Result<i32> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let (tx, rx) = mpsc::channel::<String>();
        let tx_err = tx.clone();
        let out_reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let err_reader = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                if tx_err.send(line).is_err() {
                    break;
                }
            }
        });

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => on_line(&line),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                // Both readers finished; the child has closed its pipes.
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let _ = out_reader.join();
        let _ = err_reader.join();

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.program))?;
        let code = status.code().unwrap_or(-1);
        if !status.success() && !self.allow_fail {
            bail!("{} (exit code {})", self.failure_msg(), code);
        }
        Ok(code)
    }
}

/// Bail with a description when a required path is missing.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found: {}", what, path.display());
    }
    Ok(())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

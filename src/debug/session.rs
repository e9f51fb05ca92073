//! Interactive debugger session.
//!
//! Renders the init script, resolves the client's version probe, and runs the
//! debugger with the operator's terminal bridged to it line by line. Ctrl-C is
//! recorded instead of killing this process, so the debugger in the same
//! foreground group keeps handling it as a target interrupt.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use crate::process::Cmd;

/// Init script file name inside the environment build directory.
pub const INIT_SCRIPT_NAME: &str = ".debug-init";

/// Render the init commands into a script the debugger can source.
///
/// `$LOAD_CMDS` on a line of its own expands to the load command list;
/// `$PROG_PATH`, `$INIT_BREAK` and `$DEBUG_PORT` substitute inline. Lines
/// needing `$DEBUG_PORT` are dropped entirely when no port is configured.
pub fn render_init_script(
    init_cmds: &[String],
    load_cmds: &[String],
    init_break: &str,
    port: Option<&str>,
    program: &Path,
) -> String {
    let substitute = |line: &str| -> Option<String> {
        if line.contains("$DEBUG_PORT") && port.is_none() {
            return None;
        }
        let mut rendered = line.replace("$PROG_PATH", &program.display().to_string());
        rendered = rendered.replace("$INIT_BREAK", init_break);
        if let Some(port) = port {
            rendered = rendered.replace("$DEBUG_PORT", port);
        }
        Some(rendered)
    };

    let mut lines = Vec::new();
    for cmd in init_cmds {
        if cmd.trim() == "$LOAD_CMDS" {
            for load in load_cmds {
                if let Some(rendered) = substitute(load) {
                    lines.push(rendered);
                }
            }
        } else if let Some(rendered) = substitute(cmd) {
            lines.push(rendered);
        }
    }
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

pub fn write_init_script(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("writing debugger init script '{}'", path.display()))
}

/// Ask the debugger for its version banner.
pub fn query_version(debugger: &Path) -> Result<String> {
    let result = Cmd::new(debugger.display().to_string())
        .arg("--version")
        .allow_fail()
        .run()?;
    if !result.success() {
        bail!(
            "debugger '{}' failed to report a version:\n{}{}",
            debugger.display(),
            result.stdout,
            result.stderr
        );
    }
    Ok(result.stdout)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// While alive, SIGINT sets a flag instead of terminating this process. The
/// previous disposition is restored on drop.
pub struct InterruptGuard {
    previous: libc::sighandler_t,
}

impl InterruptGuard {
    pub fn install() -> Self {
        let previous = unsafe { libc::signal(libc::SIGINT, note_interrupt as libc::sighandler_t) };
        InterruptGuard { previous }
    }

    pub fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe { libc::signal(libc::SIGINT, self.previous) };
    }
}

enum SessionEvent {
    Operator(String),
    Debugger(String),
    OperatorClosed,
    DebuggerClosed,
}

/// A runnable debugger invocation.
pub struct DebugSession {
    pub debugger: PathBuf,
    pub program: PathBuf,
    pub init_script: PathBuf,
    pub client_args: Vec<String>,
}

impl DebugSession {
    /// Bridge the operator's terminal and the debugger until the debugger
    /// exits. Returns its exit code.
    ///
    /// Operator hangup closes the debugger's stdin so it sees EOF and quits
    /// on its own; output keeps draining until the debugger is gone. A SIGINT
    /// that kills the debugger while some probe server still holds its output
    /// pipe open is caught by polling the child after each interrupt.
    pub fn run(&self) -> Result<i32> {
        let mut child = Command::new(&self.debugger)
            .arg("-q")
            .arg("-x")
            .arg(&self.init_script)
            .args(&self.client_args)
            .arg(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.debugger.display()))?;

        let child_stdout = child.stdout.take().context("Failed to capture stdout")?;
        let child_stdin = child.stdin.take().context("Failed to capture stdin")?;

        let (tx, rx) = mpsc::channel::<SessionEvent>();
        let tx_operator = tx.clone();
        std::thread::spawn(move || {
            let lines = BufReader::new(child_stdout).lines();
            for line in lines.map_while(std::result::Result::ok) {
                if tx.send(SessionEvent::Debugger(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(SessionEvent::DebuggerClosed);
        });
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            let lines = stdin.lock().lines();
            for line in lines.map_while(std::result::Result::ok) {
                if tx_operator.send(SessionEvent::Operator(line)).is_err() {
                    return;
                }
            }
            let _ = tx_operator.send(SessionEvent::OperatorClosed);
        });

        let guard = InterruptGuard::install();
        let mut operator_stdin = Some(child_stdin);
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(SessionEvent::Debugger(line)) => println!("{line}"),
                Ok(SessionEvent::Operator(line)) => {
                    if let Some(stdin) = operator_stdin.as_mut() {
                        // A broken pipe means the debugger already left; its
                        // closed stdout ends the session right after.
                        let _ = writeln!(stdin, "{line}");
                        let _ = stdin.flush();
                    }
                }
                Ok(SessionEvent::OperatorClosed) => {
                    operator_stdin = None;
                }
                Ok(SessionEvent::DebuggerClosed) => {
                    let status = child
                        .wait()
                        .with_context(|| format!("Failed to wait for {}", self.debugger.display()))?;
                    return Ok(status.code().unwrap_or(-1));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if guard.interrupted() {
                        if let Some(status) = child.try_wait().with_context(|| {
                            format!("Failed to wait for {}", self.debugger.display())
                        })? {
                            return Ok(status.code().unwrap_or(-1));
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let status = child
                        .wait()
                        .with_context(|| format!("Failed to wait for {}", self.debugger.display()))?;
                    return Ok(status.code().unwrap_or(-1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn fake_debugger(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-gdb");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn renders_the_default_template() {
        let script = render_init_script(
            &strs(&[
                "target extended-remote $DEBUG_PORT",
                "$LOAD_CMDS",
                "$INIT_BREAK",
            ]),
            &strs(&["load"]),
            "tbreak main",
            Some(":3333"),
            Path::new("/work/firmware.elf"),
        );
        assert_eq!(script, "target extended-remote :3333\nload\ntbreak main\n");
    }

    #[test]
    fn port_lines_vanish_without_a_port() {
        let script = render_init_script(
            &strs(&[
                "target extended-remote $DEBUG_PORT",
                "$LOAD_CMDS",
                "$INIT_BREAK",
            ]),
            &strs(&["load"]),
            "tbreak main",
            None,
            Path::new("/work/firmware.elf"),
        );
        assert_eq!(script, "load\ntbreak main\n");
    }

    #[test]
    fn load_cmds_expand_in_place() {
        let script = render_init_script(
            &strs(&["monitor reset halt", "$LOAD_CMDS", "continue"]),
            &strs(&["restore /work/boot.bin binary 0x1000", "load"]),
            "tbreak main",
            None,
            Path::new("/work/firmware.elf"),
        );
        assert_eq!(
            script,
            "monitor reset halt\nrestore /work/boot.bin binary 0x1000\nload\ncontinue\n"
        );
    }

    #[test]
    fn program_path_substitutes_inline() {
        let script = render_init_script(
            &strs(&["file $PROG_PATH", "$LOAD_CMDS"]),
            &strs(&[]),
            "tbreak main",
            None,
            Path::new("/work/firmware.elf"),
        );
        assert_eq!(script, "file /work/firmware.elf\n");
    }

    #[test]
    fn version_query_returns_the_banner() {
        let tmp = TempDir::new().unwrap();
        let debugger = fake_debugger(tmp.path(), "echo 'GNU gdb (test) 12.1'");
        let banner = query_version(&debugger).unwrap();
        assert!(banner.contains("GNU gdb"));
    }

    #[test]
    fn version_query_failure_names_the_debugger() {
        let tmp = TempDir::new().unwrap();
        let debugger = fake_debugger(tmp.path(), "echo 'no dice' >&2; exit 1");
        let err = query_version(&debugger).unwrap_err();
        assert!(err.to_string().contains("fake-gdb"));
        assert!(err.to_string().contains("no dice"));
    }

    #[test]
    fn session_reports_the_debugger_exit_code() {
        let tmp = TempDir::new().unwrap();
        let debugger = fake_debugger(tmp.path(), "echo ready; exit 7");
        let init = tmp.path().join(INIT_SCRIPT_NAME);
        write_init_script(&init, "tbreak main\n").unwrap();
        let session = DebugSession {
            debugger,
            program: tmp.path().join("firmware.elf"),
            init_script: init,
            client_args: Vec::new(),
        };
        assert_eq!(session.run().unwrap(), 7);
    }

    #[test]
    fn operator_hangup_reaches_the_debugger_as_eof() {
        // The test harness runs with stdin closed, so the operator side hangs
        // up immediately and the script's read loop ends on EOF.
        let tmp = TempDir::new().unwrap();
        let debugger = fake_debugger(
            tmp.path(),
            "while read line; do echo \"got $line\"; done; exit 0",
        );
        let init = tmp.path().join(INIT_SCRIPT_NAME);
        write_init_script(&init, "load\n").unwrap();
        let session = DebugSession {
            debugger,
            program: tmp.path().join("firmware.elf"),
            init_script: init,
            client_args: Vec::new(),
        };
        assert_eq!(session.run().unwrap(), 0);
    }

    #[test]
    fn interrupt_guard_records_a_ctrl_c() {
        let guard = InterruptGuard::install();
        assert!(!guard.interrupted());
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(guard.interrupted());
    }
}

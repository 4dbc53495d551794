//! Subprocess helpers with timeouts
//!
//! Every call the backends make to `pct`, `qm`, `step` or `openssl` goes
//! through here. A child that outlives its timeout is killed and the call
//! fails.

use anyhow::{Context, Result, bail};
use converge::ExecOutput;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn display(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        buf
    })
}

fn feed(stdin: Option<ChildStdin>, input: Option<&[u8]>) -> thread::JoinHandle<io::Result<()>> {
    let bytes = input.map(<[u8]>::to_vec);
    thread::spawn(move || match (stdin, bytes) {
        (Some(mut stdin), Some(bytes)) => stdin.write_all(&bytes),
        _ => Ok(()),
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration, what: &str) -> Result<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait for: {what}"))?
        {
            // Killed by a signal: report like a shell would
            return Ok(status.code().unwrap_or(128 + 9));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("`{what}` timed out after {}s", timeout.as_secs_f64());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run a command, optionally feeding `input` on stdin, and capture its output
pub fn run_input(
    program: &str,
    args: &[&str],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<ExecOutput> {
    let what = display(program, args);
    log::trace!("exec: {what}");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute: {what}"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let stdin = feed(child.stdin.take(), input);

    let exit_code = wait_with_timeout(&mut child, timeout, &what)?;

    // A child may exit without reading all of its input
    if let Ok(Err(e)) = stdin.join()
        && e.kind() != io::ErrorKind::BrokenPipe
    {
        return Err(e).with_context(|| format!("Failed to write stdin of: {what}"));
    }

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

/// Run a command and capture its output; a non-zero exit is not an error
pub fn run_capture(program: &str, args: &[&str], timeout: Duration) -> Result<ExecOutput> {
    run_input(program, args, None, timeout)
}

/// Run a command that must succeed; returns trimmed stdout
pub fn run_checked(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let output = run_capture(program, args, timeout)?;
    if output.success() {
        Ok(output.stdout.trim().to_string())
    } else {
        bail!(
            "`{}` exited with status {}: {}",
            display(program, args),
            output.exit_code,
            output.tail(5)
        )
    }
}

/// Check if a command exists
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Quote a string for `sh -c`
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#![cfg(unix)]

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::debug;
use std::fs::File;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

#[derive(Debug, Copy, Clone, Default, PartialEq, ValueEnum)]
pub enum TraceMode {
    /// process lifecycle only
    #[default]
    Process,
    /// also file and network io (slower but more detailed)
    Io,
}

impl TraceMode {
    fn filter(self) -> &'static str {
        match self {
            TraceMode::Process => "trace=%process",
            TraceMode::Io => "trace=%process,%network,%file,read,write",
        }
    }
}

/// `(major, minor)` of the installed strace, from `strace -V`.
pub fn strace_version() -> Result<(u32, u32)> {
    let output = Command::new("strace")
        .arg("-V")
        .output()
        .context("failed to run strace -V")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or_default();
    let version = first.split_whitespace().last().unwrap_or_default();
    parse_version(version).with_context(|| format!("unrecognized strace version line {first:?}"))
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut fields = version.split('.');
    let major = fields.next()?.parse().ok()?;
    let minor = fields.next().and_then(|minor| minor.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

/// Run the command under strace, writing the raw trace to `output`.
/// Returns the traced command's exit status.
pub fn run_strace(mode: TraceMode, command: &[String], output: &Path) -> Result<ExitStatus> {
    let mut cmd = Command::new("strace");
    // skips the stops for syscalls outside the filter, much faster
    if strace_version().is_ok_and(|version| version >= (5, 3)) {
        cmd.arg("--seccomp-bpf");
    }
    // -ttt: absolute microsecond timestamps, -y: decorate fds with paths,
    // -f: follow children, -T: record time spent in each call
    cmd.arg("-tttyfT");
    cmd.args(["-e", mode.filter()]);
    cmd.args(["-s", "128"]);
    cmd.arg("-o").arg(output);
    cmd.arg("--");
    cmd.args(command);
    debug!("running {:?}", cmd);
    cmd.status().context("failed to run strace")
}

/// Render folded stacks to an svg with the flamegraph script.
pub fn run_flamegraph(script: &str, folded: &Path, svg: &Path, extra: &[String]) -> Result<()> {
    let svg_file =
        File::create(svg).with_context(|| format!("failed to create {}", svg.display()))?;
    let mut cmd = Command::new(script);
    cmd.args([
        "--flamechart",
        "--countname",
        "us",
        "--nametype",
        "Frame:",
        "--colors",
        "aqua",
        "--width",
        "1600",
    ]);
    cmd.args(extra);
    cmd.arg(folded);
    cmd.stdout(Stdio::from(svg_file));
    debug!("running {:?}", cmd);
    let status = cmd.status().with_context(|| format!("failed to run {script}"))?;
    if !status.success() {
        bail!("{script} exited with {status}");
    }
    Ok(())
}

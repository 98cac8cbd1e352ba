use clap::Parser;
use eyre::eyre;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::SuperviseConfig;

type Result<T> = color_eyre::eyre::Result<T>;

/// Stand up a test fixture process, hold it for the test window, then tear
/// it down with SIGTERM and verify it exits cleanly
#[derive(Parser)]
#[command(name = "fixinit")]
#[command(about = "Supervises a single test-fixture process for one test run")]
#[command(version)]
pub struct Cli {
    /// How long to hold the fixture alive before teardown (ms)
    #[arg(long, default_value = "5000")]
    pub hold_ms: u64,

    /// Give up reaping this long after SIGTERM (ms); waits forever if unset
    #[arg(long)]
    pub reap_timeout_ms: Option<u64>,

    /// Fixture executable to launch
    pub command: String,

    /// Arguments for the fixture
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Validates the CLI input into a supervision config. The executable is
    /// resolved here, in the parent, so the post-fork child never has to
    /// search PATH.
    pub fn into_config(self) -> Result<SuperviseConfig> {
        let command = resolve_executable(&self.command)?;

        Ok(SuperviseConfig {
            command,
            args: self.args,
            hold: Duration::from_millis(self.hold_ms),
            reap_deadline: self.reap_timeout_ms.map(Duration::from_millis),
        })
    }
}

/// Resolves a fixture command to an executable path: taken as-is when it
/// contains a path separator, otherwise looked up along PATH.
fn resolve_executable(command: &str) -> Result<PathBuf> {
    let candidate = Path::new(command);
    if command.contains('/') {
        if is_executable_file(candidate) {
            return Ok(candidate.to_path_buf());
        }
        return Err(eyre!("fixture executable not found: {}", command));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(command);
        if is_executable_file(&full) {
            return Ok(full);
        }
    }

    Err(eyre!("fixture executable '{}' not found on PATH", command))
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

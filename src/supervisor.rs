use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::info;

use crate::error::{Result, SuperviseError};
use crate::signals::SignalGuard;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for one supervision run
#[derive(Debug, Clone)]
pub struct SuperviseConfig {
    /// Resolved path of the fixture executable
    pub command: PathBuf,
    /// Arguments passed to the fixture
    pub args: Vec<String>,
    /// How long the fixture is held alive before teardown
    pub hold: Duration,
    /// Optional bound on how long reap will wait after SIGTERM.
    /// `None` reproduces the original unbounded waitpid.
    pub reap_deadline: Option<Duration>,
}

/// Handle to the launched fixture. One is created per `launch` and consumed
/// by exactly one `reap`.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
}

impl ChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Decoded wait status of the reaped fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, if the fixture exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it did not
    pub signal: Option<Signal>,
}

impl ExitStatus {
    /// A clean teardown is a normal exit with code zero; anything else is a
    /// fixture-teardown failure.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Drives the full supervision sequence for a single fixture process.
pub struct Supervisor {
    config: SuperviseConfig,
}

impl Supervisor {
    pub fn new(config: SuperviseConfig) -> Self {
        Self { config }
    }

    /// Runs the whole lifecycle: block SIGCHLD, launch, hold, SIGTERM,
    /// reap, restore the mask, verify a clean exit.
    ///
    /// The mask restore is guaranteed on every path: explicitly after reap
    /// on success, via the guard's `Drop` when any earlier step fails. A
    /// failure before reap can leave the fixture running; that is surfaced
    /// in the returned error rather than papered over.
    pub fn run(&self) -> Result<ExitStatus> {
        let guard = SignalGuard::block_sigchld()?;

        let child = launch(&self.config.command, &self.config.args, guard.saved_mask())?;
        hold(self.config.hold);
        terminate(&child)?;
        let status = reap(&child, self.config.reap_deadline)?;

        guard.restore()?;

        if status.is_clean() {
            info!("fixture exited cleanly");
            Ok(status)
        } else {
            Err(SuperviseError::UncleanExit(status))
        }
    }
}

/// Forks and execs the fixture.
///
/// The child reinstates `parent_mask` (the pre-block mask captured by the
/// guard) before exec, so the fixture runs with the caller's original signal
/// disposition; the SIGCHLD block is a supervisor-only concern.
///
/// Everything the child touches is allocated here, before fork: CString
/// conversions, the argv pointer array, and the exec-failure diagnostic
/// prefix. Between fork and exec the child makes only async-signal-safe
/// calls, and an exec failure ends the child alone with `_exit(127)` after
/// writing the diagnostic; it never returns into parent code.
pub fn launch(command: &Path, args: &[String], parent_mask: SigSet) -> Result<ChildProcess> {
    let program = CString::new(command.as_os_str().as_bytes())
        .map_err(|_| SuperviseError::InvalidCommand("command path contains a null byte".into()))?;

    let mut argv: Vec<CString> = Vec::with_capacity(1 + args.len());
    argv.push(program.clone());
    for arg in args {
        argv.push(CString::new(arg.as_bytes()).map_err(|_| {
            SuperviseError::InvalidCommand(format!("argument contains a null byte: {:?}", arg))
        })?);
    }
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let diag_prefix = format!("fixinit: exec {} failed, errno ", command.display()).into_bytes();

    info!("forking fixture: {} {:?}", command.display(), args);

    // SAFETY: the child only performs async-signal-safe operations between
    // fork and exec, using data prepared above.
    match unsafe { fork() }.map_err(SuperviseError::LaunchFailed)? {
        ForkResult::Child => {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&parent_mask), None);
            unsafe {
                libc::execv(program.as_ptr(), argv_ptrs.as_ptr());
            }
            // execv only returns on failure
            report_exec_failure(&diag_prefix, Errno::last_raw())
        }
        ForkResult::Parent { child } => {
            info!("fixture started with pid {}", child);
            Ok(ChildProcess { pid: child })
        }
    }
}

/// Runs in the child after a failed exec. Raw writes and `_exit` only; the
/// errno digits are formatted on the stack.
fn report_exec_failure(prefix: &[u8], errno: i32) -> ! {
    let mut digits = [0u8; 12];
    let mut n = errno.unsigned_abs();
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    unsafe {
        libc::write(libc::STDERR_FILENO, prefix.as_ptr().cast(), prefix.len());
        libc::write(
            libc::STDERR_FILENO,
            digits[i..].as_ptr().cast(),
            digits.len() - i,
        );
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::_exit(127)
    }
}

/// Holds the calling flow while the fixture runs. Stand-in for the real
/// test body; plain timed wait, no readiness handshake with the fixture.
pub fn hold(duration: Duration) {
    info!("holding {:?} while the fixture runs", duration);
    thread::sleep(duration);
}

/// Sends SIGTERM to the fixture, exactly once. Delivery failure (fixture
/// already reaped, permission denied) surfaces as an error, never a retry.
pub fn terminate(child: &ChildProcess) -> Result<()> {
    info!("sending SIGTERM to fixture pid {}", child.pid());
    kill(child.pid(), Signal::SIGTERM).map_err(SuperviseError::SignalDelivery)
}

/// Collects the fixture's exit status.
///
/// Waits on the specific pid, never "any child". With no deadline this is
/// the original unbounded blocking waitpid; with one, waitpid is polled
/// with WNOHANG until the deadline expires, at which point the fixture is
/// left unreaped and `ReapTimeout` is returned.
pub fn reap(child: &ChildProcess, deadline: Option<Duration>) -> Result<ExitStatus> {
    info!("awaiting fixture exit, pid {}", child.pid());
    let status = match deadline {
        None => reap_blocking(child.pid())?,
        Some(limit) => reap_polling(child.pid(), limit)?,
    };
    info!("fixture pid {} reaped: {}", child.pid(), status);
    Ok(status)
}

fn reap_blocking(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = decode_wait_status(pid, status)? {
                    return Ok(exit);
                }
                // stop/continue event, not a termination
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SuperviseError::WaitFailed(e)),
        }
    }
}

fn reap_polling(pid: Pid, limit: Duration) -> Result<ExitStatus> {
    let started = Instant::now();
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                if let Some(exit) = decode_wait_status(pid, status)? {
                    return Ok(exit);
                }
                if started.elapsed() >= limit {
                    return Err(SuperviseError::ReapTimeout(limit));
                }
                thread::sleep(REAP_POLL_INTERVAL.min(limit));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SuperviseError::WaitFailed(e)),
        }
    }
}

/// Decodes a wait status into an [`ExitStatus`], or `None` for events that
/// are not terminations (still alive, stopped, continued).
///
/// waitpid was handed a specific pid, so a different pid coming back means
/// the handle bookkeeping is corrupt; that is a hard `ReapMismatch`, not
/// something to ignore.
fn decode_wait_status(expected: Pid, status: WaitStatus) -> Result<Option<ExitStatus>> {
    match status {
        WaitStatus::Exited(pid, code) => {
            check_reaped_pid(expected, pid)?;
            Ok(Some(ExitStatus {
                code: Some(code),
                signal: None,
            }))
        }
        WaitStatus::Signaled(pid, signal, _core_dumped) => {
            check_reaped_pid(expected, pid)?;
            Ok(Some(ExitStatus {
                code: None,
                signal: Some(signal),
            }))
        }
        _ => Ok(None),
    }
}

fn check_reaped_pid(expected: Pid, actual: Pid) -> Result<()> {
    if actual != expected {
        return Err(SuperviseError::ReapMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SH: &str = "/bin/sh";

    fn sh_fixture(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_full_sequence_clean_exit() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("trap 'exit 0' TERM; while :; do sleep 0.05; done");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        hold(Duration::from_millis(300));
        terminate(&child).unwrap();

        let status = reap(&child, None).unwrap();
        guard.restore().unwrap();

        assert_eq!(status.code, Some(0));
        assert_eq!(status.signal, None);
        assert!(status.is_clean());
    }

    #[test]
    fn test_untrapped_sigterm_reports_signal_death() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("sleep 30");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        hold(Duration::from_millis(200));
        terminate(&child).unwrap();

        let status = reap(&child, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status.signal, Some(Signal::SIGTERM));
        assert_eq!(status.code, None);
        assert!(!status.is_clean());
    }

    #[test]
    fn test_child_crash_reports_exit_code() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("exit 7");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        let status = reap(&child, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status.code, Some(7));
        assert!(!status.is_clean());
    }

    #[test]
    fn test_terminate_after_reap_is_signal_error() {
        // A self-exited fixture stays a zombie (SIGCHLD is blocked, nothing
        // reaps it early) and a zombie still accepts signals, so ESRCH only
        // shows up once the pid has actually been reaped.
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("exit 0");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        let status = reap(&child, Some(Duration::from_secs(5))).unwrap();
        assert!(status.is_clean());

        match terminate(&child) {
            Err(SuperviseError::SignalDelivery(Errno::ESRCH)) => {}
            other => panic!("expected SignalDelivery(ESRCH), got {:?}", other),
        }
    }

    #[test]
    fn test_exec_failure_surfaces_as_code_127() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let missing = Path::new("/nonexistent/fixture/binary");
        let child = launch(missing, &[], guard.saved_mask()).unwrap();

        let status = reap(&child, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status.code, Some(127));
        assert!(!status.is_clean());
    }

    #[test]
    fn test_reap_deadline_expires_for_stubborn_fixture() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("trap '' TERM; sleep 5");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        // Let the shell install its trap before signalling.
        hold(Duration::from_millis(300));
        terminate(&child).unwrap();

        match reap(&child, Some(Duration::from_millis(300))) {
            Err(SuperviseError::ReapTimeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(300));
            }
            other => panic!("expected ReapTimeout, got {:?}", other),
        }

        // Clean up the deliberately stubborn fixture.
        kill(child.pid(), Signal::SIGKILL).unwrap();
        let status = reap(&child, None).unwrap();
        assert_eq!(status.signal, Some(Signal::SIGKILL));
    }

    #[test]
    fn test_unbounded_reap_outlasts_ignored_sigterm() {
        // Documented base behavior: with no deadline, reap blocks past an
        // ignored SIGTERM until the fixture exits on its own.
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = sh_fixture("trap '' TERM; sleep 0.6");
        let child = launch(Path::new(SH), &args, guard.saved_mask()).unwrap();

        hold(Duration::from_millis(200));
        terminate(&child).unwrap();

        let reap_started = Instant::now();
        let status = reap(&child, None).unwrap();
        guard.restore().unwrap();

        assert!(status.is_clean());
        assert!(reap_started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_decode_exited_status() {
        let pid = Pid::from_raw(4242);
        let decoded = decode_wait_status(pid, WaitStatus::Exited(pid, 0)).unwrap();
        assert_eq!(
            decoded,
            Some(ExitStatus {
                code: Some(0),
                signal: None
            })
        );
    }

    #[test]
    fn test_decode_signaled_status() {
        let pid = Pid::from_raw(4242);
        let decoded = decode_wait_status(pid, WaitStatus::Signaled(pid, Signal::SIGTERM, false));
        assert_eq!(
            decoded.unwrap(),
            Some(ExitStatus {
                code: None,
                signal: Some(Signal::SIGTERM)
            })
        );
    }

    #[test]
    fn test_decode_still_alive_is_not_a_termination() {
        let pid = Pid::from_raw(4242);
        let decoded = decode_wait_status(pid, WaitStatus::StillAlive).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_mismatched_pid_raises_reap_mismatch() {
        let expected = Pid::from_raw(4242);
        let stranger = Pid::from_raw(4243);
        match decode_wait_status(expected, WaitStatus::Exited(stranger, 0)) {
            Err(SuperviseError::ReapMismatch {
                expected: e,
                actual: a,
            }) => {
                assert_eq!(e, expected);
                assert_eq!(a, stranger);
            }
            other => panic!("expected ReapMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_status_display() {
        let clean = ExitStatus {
            code: Some(0),
            signal: None,
        };
        assert_eq!(clean.to_string(), "exit code 0");

        let signaled = ExitStatus {
            code: None,
            signal: Some(Signal::SIGTERM),
        };
        assert_eq!(signaled.to_string(), "terminated by signal SIGTERM");
    }

    #[test]
    fn test_launch_rejects_null_byte_argument() {
        let guard = SignalGuard::block_sigchld().unwrap();
        let args = vec!["bad\0arg".to_string()];
        match launch(Path::new(SH), &args, guard.saved_mask()) {
            Err(SuperviseError::InvalidCommand(msg)) => {
                assert!(msg.contains("null byte"));
            }
            other => panic!("expected InvalidCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_supervisor_run_happy_path() {
        let config = SuperviseConfig {
            command: PathBuf::from(SH),
            args: sh_fixture("trap 'exit 0' TERM; while :; do sleep 0.05; done"),
            hold: Duration::from_millis(200),
            reap_deadline: Some(Duration::from_secs(5)),
        };
        let status = Supervisor::new(config).run().unwrap();
        assert!(status.is_clean());
    }

    #[test]
    fn test_supervisor_run_unclean_exit() {
        let config = SuperviseConfig {
            command: PathBuf::from(SH),
            args: sh_fixture("exit 3"),
            hold: Duration::from_millis(100),
            reap_deadline: Some(Duration::from_secs(5)),
        };
        match Supervisor::new(config).run() {
            Err(SuperviseError::UncleanExit(status)) => {
                assert_eq!(status.code, Some(3));
            }
            other => panic!("expected UncleanExit, got {:?}", other),
        }
    }
}

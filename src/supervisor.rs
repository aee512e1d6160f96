use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Timings;
use crate::error::{Error, Result};
use crate::io::write_exact;
use crate::msd::MassStorage;
use crate::nbd;

/// How a forked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exited with this status code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(Signal),
}

impl Outcome {
    /// True for a zero exit status.
    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Exited(0))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exit status {}", code),
            Outcome::Signaled(signal) => write!(f, "signal {:?}", signal),
        }
    }
}

/// Blocks until `pid` exits or is killed.
pub(crate) fn wait(pid: Pid) -> Result<Outcome> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Outcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(Outcome::Signaled(signal)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(source) => return Err(Error::Process { op: "waitpid", source }),
        }
    }
}

/// Handed to a session so it can report that the kernel binding is in place.
#[derive(Debug)]
pub struct Ready(UnixStream);

impl Ready {
    /// Tells the supervisor the device is attached and being served.
    pub fn signal(mut self) -> Result<()> {
        write_exact(&mut self.0, &[1])
    }
}

/// Keeps one session running at a time and restarts it whenever it ends.
///
/// Mass storage is enabled only while a session is attached, and is always
/// disabled again before the next session starts.
pub struct Supervisor<M> {
    msd: M,
    timings: Timings,
    device: Option<PathBuf>,
}

impl<M: MassStorage> Supervisor<M> {
    /// Creates a supervisor toggling visibility through `msd`.
    pub fn new(msd: M, timings: Timings) -> Self {
        Self {
            msd,
            timings,
            device: None,
        }
    }

    /// Flushes the buffers of `device` each time mass storage is disabled.
    pub fn flush_on_disable(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Returns the visibility controller.
    pub fn mass_storage(&self) -> &M {
        &self.msd
    }

    /// Runs `session` in a fresh child process, forever.
    pub fn run<F>(&mut self, mut session: F) -> !
    where
        F: FnMut(Ready) -> Result<()>,
    {
        loop {
            let cooldown = match self.cycle(&mut session) {
                Ok(outcome) => self.cooldown(outcome),
                Err(err) => {
                    error!(error = %err, "could not supervise session");
                    self.timings.crash_cooldown
                }
            };

            debug!(?cooldown, "restarting session after cooldown");
            thread::sleep(cooldown);
        }
    }

    /// Delay before the next session, given how the last one ended.
    pub fn cooldown(&self, outcome: Outcome) -> Duration {
        if outcome.is_clean() {
            self.timings.clean_cooldown
        } else {
            self.timings.crash_cooldown
        }
    }

    /// Forks one session and waits for it to end.
    ///
    /// Mass storage is enabled once the session signals [`Ready`] and
    /// disabled after it exits, whatever the reason.
    pub fn cycle<F>(&mut self, session: &mut F) -> Result<Outcome>
    where
        F: FnMut(Ready) -> Result<()>,
    {
        let (mut attached, ready) = UnixStream::pair()?;

        match unsafe { fork() }.map_err(|source| Error::Process { op: "fork", source })? {
            ForkResult::Child => {
                drop(attached);

                let attempt = AssertUnwindSafe(|| session(Ready(ready)));

                let status = match panic::catch_unwind(attempt) {
                    Ok(Ok(())) => 0,
                    Ok(Err(err)) => {
                        error!(error = %err, "session ended with error");
                        1
                    }
                    Err(_) => 101,
                };

                unsafe { libc::_exit(status) }
            }
            ForkResult::Parent { child } => {
                drop(ready);

                info!(pid = %child, "session started");

                if wait_attached(&mut attached) {
                    thread::sleep(self.timings.settle);
                    self.msd.enable();
                } else {
                    warn!(pid = %child, "session ended before attaching");
                }

                let outcome = wait(child);

                // Force an eject so the host never sees an unbacked device.
                self.msd.disable();
                self.flush_device();

                let outcome = outcome?;
                if outcome.is_clean() {
                    info!(pid = %child, "session ended");
                } else {
                    warn!(pid = %child, %outcome, "abnormal session exit");
                }

                Ok(outcome)
            }
        }
    }

    fn flush_device(&self) {
        let Some(path) = &self.device else {
            return;
        };

        let flushed = File::open(path)
            .map_err(Error::from)
            .and_then(|device| unsafe { nbd::flush_buffers(&device) });

        if let Err(err) = flushed {
            warn!(device = %path.display(), error = %err, "failed to flush device buffers");
        }
    }
}

/// Returns true once the session reports it is attached, false if it exits
/// first.
fn wait_attached(channel: &mut UnixStream) -> bool {
    let mut byte = [0u8; 1];

    loop {
        match channel.read(&mut byte) {
            Ok(0) => return false,
            Ok(_) => return true,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "lost track of session readiness");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[derive(Default)]
    struct Recorder {
        events: Vec<&'static str>,
    }

    impl MassStorage for Recorder {
        fn enable(&mut self) {
            self.events.push("enable");
        }

        fn disable(&mut self) {
            self.events.push("disable");
        }
    }

    fn supervisor() -> Supervisor<Recorder> {
        let timings = Timings {
            settle: Duration::ZERO,
            clean_cooldown: Duration::from_millis(2),
            crash_cooldown: Duration::from_millis(5),
        };
        Supervisor::new(Recorder::default(), timings)
    }

    #[test]
    fn clean_session_is_exposed_then_ejected() {
        let mut supervisor = supervisor();

        let outcome = supervisor.cycle(&mut |ready: Ready| ready.signal()).unwrap();

        assert_eq!(outcome, Outcome::Exited(0));
        assert_eq!(supervisor.mass_storage().events, vec!["enable", "disable"]);
        assert_eq!(supervisor.cooldown(outcome), Duration::from_millis(2));
    }

    #[test]
    fn failed_session_backs_off_longer() {
        let mut supervisor = supervisor();

        let outcome = supervisor
            .cycle(&mut |ready: Ready| {
                ready.signal()?;
                Err(Error::PeerClosed)
            })
            .unwrap();

        assert_eq!(outcome, Outcome::Exited(1));
        assert_eq!(supervisor.mass_storage().events, vec!["enable", "disable"]);
        assert_eq!(supervisor.cooldown(outcome), Duration::from_millis(5));
    }

    #[test]
    fn session_failing_before_attach_is_never_exposed() {
        let mut supervisor = supervisor();

        let outcome = supervisor
            .cycle(&mut |_: Ready| Err(Error::BadMagic(0)))
            .unwrap();

        assert!(!outcome.is_clean());
        assert_eq!(supervisor.mass_storage().events, vec!["disable"]);
    }

    #[test]
    fn killed_session_is_abnormal() {
        let mut supervisor = supervisor();

        let outcome = supervisor
            .cycle(&mut |ready: Ready| {
                ready.signal()?;
                let _ = raise(Signal::SIGKILL);
                Ok(())
            })
            .unwrap();

        assert_eq!(outcome, Outcome::Signaled(Signal::SIGKILL));
        assert_eq!(supervisor.cooldown(outcome), Duration::from_millis(5));
        assert_eq!(supervisor.mass_storage().events, vec!["enable", "disable"]);
    }

    #[test]
    fn panicking_session_is_abnormal() {
        let mut supervisor = supervisor();

        let outcome = supervisor
            .cycle(&mut |_: Ready| -> Result<()> { panic!("translator exploded") })
            .unwrap();

        assert_eq!(outcome, Outcome::Exited(101));
    }

    #[test]
    fn every_cycle_disables_before_the_next_enable() {
        let mut supervisor = supervisor();

        for _ in 0..3 {
            supervisor.cycle(&mut |ready: Ready| ready.signal()).unwrap();
        }

        assert_eq!(
            supervisor.mass_storage().events,
            vec!["enable", "disable", "enable", "disable", "enable", "disable"]
        );
    }

    #[test]
    fn outcome_display() {
        assert_eq!(Outcome::Exited(3).to_string(), "exit status 3");
        assert_eq!(Outcome::Signaled(Signal::SIGTERM).to_string(), "signal SIGTERM");
    }
}

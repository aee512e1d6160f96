use std::process::Command;
use tracing::{info, warn};

/// Controls whether the host sees the device as USB mass storage.
///
/// Neither call reports failure: the supervisor logs and carries on.
pub trait MassStorage {
    /// Exposes the device to the host.
    fn enable(&mut self);

    /// Withdraws the device from the host.
    fn disable(&mut self);
}

/// Toggles visibility by running shell commands.
#[derive(Debug, Clone)]
pub struct Scripts {
    on: String,
    off: String,
}

impl Scripts {
    /// Creates a controller running `on` to enable and `off` to disable.
    pub fn new(on: impl Into<String>, off: impl Into<String>) -> Self {
        Self {
            on: on.into(),
            off: off.into(),
        }
    }

    fn run(&self, command: &str) {
        match Command::new("/bin/sh").arg("-c").arg(command).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(command, %status, "mass storage command failed"),
            Err(err) => warn!(command, error = %err, "could not run mass storage command"),
        }
    }
}

impl MassStorage for Scripts {
    fn enable(&mut self) {
        info!("enable MSD");
        self.run(&self.on);
    }

    fn disable(&mut self) {
        info!("disable MSD");
        self.run(&self.off);
    }
}

/// Only logs, for hosts without a USB gadget.
#[derive(Debug, Clone, Copy, Default)]
pub struct Simulated;

impl MassStorage for Simulated {
    fn enable(&mut self) {
        info!("fake enable MSD");
    }

    fn disable(&mut self) {
        info!("fake disable MSD");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scripts_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("msd.log");
        let mut scripts = Scripts::new(
            format!("echo on >> {}", log.display()),
            format!("echo off >> {}", log.display()),
        );

        scripts.enable();
        scripts.disable();

        assert_eq!(fs::read_to_string(&log).unwrap(), "on\noff\n");
    }

    #[test]
    fn failing_scripts_are_tolerated() {
        let mut scripts = Scripts::new("exit 3", "/nonexistent/msdoff.sh");

        scripts.enable();
        scripts.disable();
    }
}

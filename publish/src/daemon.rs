use std::{
    path::Path,
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    docker::{self, Docker},
    process::{self, Runner},
};

pub const READINESS_ATTEMPTS: u32 = 3;
pub const READINESS_INTERVAL: Duration = Duration::from_secs(5);

/// How the daemon process ended, if it did. Written once by the launch thread.
#[derive(Debug, Clone, Default)]
pub struct DaemonExit(Arc<OnceLock<String>>);

impl DaemonExit {
    fn record(&self, outcome: String) {
        // First outcome wins.
        let _ = self.0.set(outcome);
    }

    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

pub struct DaemonSupervisor<'a> {
    pub program: &'a Path,
    pub storage_driver: Option<&'a str>,
    /// Forward the daemon's output instead of discarding it.
    pub launch_debug: bool,
    pub attempts: u32,
    pub interval: Duration,
}

impl<'a> DaemonSupervisor<'a> {
    pub fn new(program: &'a Path, storage_driver: Option<&'a str>, launch_debug: bool) -> Self {
        Self {
            program,
            storage_driver,
            launch_debug,
            attempts: READINESS_ATTEMPTS,
            interval: READINESS_INTERVAL,
        }
    }

    /// Launches the daemon and waits for it to answer. Returns whether it did.
    pub fn start(&self, runner: &dyn Runner, docker: &Docker) -> bool {
        let exit = self.launch();
        self.wait_until_ready(runner, docker, &exit)
    }

    /// The daemon command, with its output discarded unless `launch_debug` is set.
    pub fn command(&self) -> process::Command {
        let command = docker::daemon(self.program, self.storage_driver);
        if self.launch_debug {
            command
        } else {
            command.silenced()
        }
    }

    /// Starts the daemon on a detached thread. The thread is never joined; the only trace it leaves is the returned
    /// [`DaemonExit`].
    pub fn launch(&self) -> DaemonExit {
        let command = self.command();
        let exit = DaemonExit::default();
        let slot = exit.clone();
        let spawned = thread::Builder::new()
            .name("daemon".to_owned())
            .spawn(move || {
                let outcome = match command.status() {
                    Ok(()) => "the daemon exited".to_owned(),
                    Err(error) => error.to_string(),
                };
                slot.record(outcome);
            });

        match spawned {
            // Dropping the handle detaches the thread.
            Ok(_handle) => {}
            Err(error) => {
                exit.record(format!("failed to spawn the daemon launch thread: {error}"));
            }
        }

        exit
    }

    /// Asks the daemon up to `attempts` times, sleeping `interval` between failed attempts. Not being ready is not an
    /// error: the next command that needs the daemon will fail with a more useful message.
    pub fn wait_until_ready(
        &self,
        runner: &dyn Runner,
        docker: &Docker,
        exit: &DaemonExit,
    ) -> bool {
        for attempt in 1..=self.attempts {
            match runner.run(docker.info()) {
                Ok(()) => {
                    info!("container engine is ready");
                    return true;
                }
                Err(error) => {
                    debug!(
                        "container engine not ready ({attempt}/{attempts}): {error}",
                        attempts = self.attempts
                    );
                }
            }

            if attempt < self.attempts {
                thread::sleep(self.interval);
            }
        }

        warn!(
            "container engine did not become ready after {attempts} attempts, continuing anyway",
            attempts = self.attempts
        );
        if let Some(outcome) = exit.get() {
            warn!("daemon launch: {outcome}");
        }
        false
    }
}

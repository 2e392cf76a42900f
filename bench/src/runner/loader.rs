//! External data loader.
//!
//! The loader is an opaque program that writes points until the collection
//! holds the requested number of rows. The target is handed to every
//! invocation through one environment variable on the child only.
//!
//! On unix each invocation leads its own process group, so workers the
//! loader forks are signalled together with it and never outlive its handle.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;

/// Row count a loader invocation should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTarget {
    pub rows: u64,
}

impl LoadTarget {
    pub fn rows(rows: u64) -> Self {
        Self { rows }
    }
}

/// How a background loader ended up exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderExit {
    /// It had already finished before stop was requested
    AlreadyExited(ExitStatus),
    /// It exited within the grace period after SIGTERM
    Terminated(ExitStatus),
    /// It ignored SIGTERM and was killed
    Killed,
}

#[derive(Debug, Clone)]
pub struct DataLoader {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    target_env: String,
    working_dir: Option<PathBuf>,
}

impl DataLoader {
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env_pairs()?,
            target_env: config.target_env.clone(),
            working_dir: config.working_dir.clone(),
        })
    }

    fn command(&self, target: LoadTarget, log_path: &Path) -> Result<Command> {
        let log = open_log(log_path)?;
        let stderr = log
            .try_clone()
            .with_context(|| format!("Failed to clone log handle {}", log_path.display()))?;

        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(&self.target_env, target.rows.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = Command::from(command);
        command.kill_on_drop(true);
        Ok(command)
    }

    /// Run the loader to completion. A non-zero exit is an error.
    pub async fn run_to(&self, target: LoadTarget, log_path: &Path) -> Result<()> {
        info!(rows = target.rows, program = %self.program, "running loader");
        let mut child = self
            .command(target, log_path)?
            .spawn()
            .with_context(|| format!("Failed to run loader '{}'", self.program))?;
        let _group = ProcessGroup::of(&child);
        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for loader '{}'", self.program))?;

        anyhow::ensure!(
            status.success(),
            "loader exited with {status} while loading to {} rows (log: {})",
            target.rows,
            log_path.display()
        );
        debug!(rows = target.rows, "loader finished");
        Ok(())
    }

    /// Start the loader without waiting for it.
    pub fn spawn(&self, target: LoadTarget, log_path: &Path) -> Result<BackgroundLoader> {
        let child = self
            .command(target, log_path)?
            .spawn()
            .with_context(|| format!("Failed to spawn loader '{}'", self.program))?;
        info!(rows = target.rows, pid = ?child.id(), "background loader started");
        Ok(BackgroundLoader {
            group: ProcessGroup::of(&child),
            child,
            target,
            exit: None,
        })
    }
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open loader log {}", path.display()))
}

/// Process group led by a loader child. Dropping it kills whatever is left.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> bool {
        let Some(pgid) = self.pgid else {
            return false;
        };
        // SAFETY: a negative pid addresses the group the loader was spawned to lead.
        unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
    }

    /// Whether any member of the group still exists.
    #[cfg(unix)]
    fn alive(&self) -> bool {
        self.signal(0)
    }

    #[cfg(not(unix))]
    fn alive(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn kill(&self) -> bool {
        self.signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn kill(&self) -> bool {
        false
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.kill() {
            debug!(pgid = ?self.pgid, "killed leftover loader processes");
        }
    }
}

/// A loader running concurrently with the benchmarks, owned by its handle.
#[derive(Debug)]
pub struct BackgroundLoader {
    child: Child,
    group: ProcessGroup,
    target: LoadTarget,
    exit: Option<ExitStatus>,
}

impl BackgroundLoader {
    pub fn target(&self) -> LoadTarget {
        self.target
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has finished, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().context("Failed to poll background loader")?;
        }
        Ok(self.exit)
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_status(), Ok(None))
    }

    /// SIGTERM the loader's process group, wait up to `grace`, then SIGKILL
    /// whatever is left. The loader and every process it forked have exited
    /// when this returns.
    pub async fn stop(mut self, grace: Duration) -> Result<LoaderExit> {
        if let Some(status) = self.try_status()? {
            debug!(%status, "background loader had already exited");
            return Ok(LoaderExit::AlreadyExited(status));
        }

        let deadline = Instant::now() + grace;
        self.terminate();
        match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for background loader")?;
                self.drain(deadline).await;
                info!(%status, "background loader stopped");
                Ok(LoaderExit::Terminated(status))
            }
            Err(_) => {
                warn!(grace = ?grace, "background loader ignored SIGTERM; killing");
                self.group.kill();
                self.child
                    .kill()
                    .await
                    .context("Failed to kill background loader")?;
                Ok(LoaderExit::Killed)
            }
        }
    }

    /// Give forked workers until `deadline` to follow the loader out.
    async fn drain(&self, deadline: Instant) {
        while self.group.alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.group.kill() {
            warn!(pgid = ?self.group.pgid, "loader workers outlived the grace period; killed");
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if !self.group.signal(libc::SIGTERM) {
            warn!(pgid = ?self.group.pgid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to signal background loader");
        }
    }
}

// ----------------------------------------------------------------------------
// 14.4 Child Spawning
// ----------------------------------------------------------------------------

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};
use crate::logging::ChildLogSink;

/// Starts one instance of the supervised program.
pub trait Spawner: Send + Sync + fmt::Debug {
    fn program(&self) -> &str;

    fn spawn(&self) -> SupervisorResult<Child>;
}

/// Runs `program args...` in its own process group so it outlives the
/// watchdog, with stdout and stderr appended to a rotating sink.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    sink: Option<ChildLogSink>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            current_dir: None,
            sink: None,
        }
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_log_sink(mut self, sink: ChildLogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn spawn_failed(&self, source: io::Error) -> SupervisorError {
        SupervisorError::SpawnFailed {
            program: self.program.clone(),
            source,
        }
    }
}

impl Spawner for CommandSpawner {
    fn program(&self) -> &str {
        &self.program
    }

    fn spawn(&self) -> SupervisorResult<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).process_group(0);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        match &self.sink {
            Some(sink) => {
                let out = sink.open().map_err(|e| self.spawn_failed(e))?;
                let err = out.try_clone().map_err(|e| self.spawn_failed(e))?;
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| self.spawn_failed(e))?;
        debug!(
            target: "omega::supervisor",
            program = %self.program,
            args = ?self.args,
            pid = ?child.id(),
            "Child spawned"
        );
        Ok(child)
    }
}

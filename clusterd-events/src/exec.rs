use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use crate::error::EventError;

/// Runs external commands on behalf of the cluster core.
///
/// Execution is fire-and-forget: the call returns once the process has
/// been started, the caller never waits for it to exit.
pub trait CommandExecutor: Send + Sync + 'static {
    fn spawn(&self, argv: &[String], input: Option<Vec<u8>>) -> Result<(), EventError>;
}

#[derive(Debug, Default, Copy, Clone)]
/// Spawns commands as child processes of the daemon.
///
/// Any `input` is written to the child's stdin which is then closed. The
/// child is reaped by a detached thread.
pub struct ProcessExecutor;

impl CommandExecutor for ProcessExecutor {
    fn spawn(&self, argv: &[String], input: Option<Vec<u8>>) -> Result<(), EventError> {
        let (program, args) = argv.split_first().ok_or(EventError::EmptyCommand)?;

        let stdin = if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EventError::Spawn {
                program: program.clone(),
                source,
            })?;

        let program = program.clone();
        thread::Builder::new()
            .name("clusterd-exec".to_string())
            .spawn(move || {
                if let (Some(mut pipe), Some(input)) = (child.stdin.take(), input) {
                    if let Err(error) = pipe.write_all(&input) {
                        debug!(
                            program = %program,
                            error = ?error,
                            "Failed to write command input.",
                        );
                    }
                }

                match child.wait() {
                    Ok(status) if !status.success() => {
                        debug!(
                            program = %program,
                            status = %status,
                            "Command exited with a failure status.",
                        );
                    },
                    Ok(_) => {},
                    Err(error) => {
                        warn!(program = %program, error = ?error, "Failed to reap command.");
                    },
                }
            })?;

        Ok(())
    }
}

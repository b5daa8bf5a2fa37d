//! Running external programs (mostly `git`).
//!
//! Children are killed when the future awaiting them is dropped.

use std::{
    ffi::OsStr,
    path::Path,
    process::{Output, Stdio},
};

use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, instrument};

use crate::{Error, Outcome};

pub struct Program {
    cmd: Command,
    description: String,
}

impl Program {
    pub fn new(program: &str) -> Self {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        Self {
            cmd,
            description: program.to_string(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        let arg = arg.as_ref();
        self.description.push(' ');
        self.description.push_str(&arg.to_string_lossy());
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        args.into_iter().fold(self, |program, arg| program.arg(arg))
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.cmd.env(key, value);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cmd.current_dir(dir);
        self
    }

    /// Runs the program to completion, whatever its exit status.
    #[instrument(level = "debug", skip_all, fields(command = %self.description), err)]
    pub async fn output(mut self) -> Result<Output, Error> {
        let output = self
            .cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Fatal(format!("cannot run '{}': {e}", self.description)))?;
        debug!(status = %output.status, "command finished");
        Ok(output)
    }

    /// Runs the program and returns its stdout, failing on a non-zero exit.
    pub async fn run(self) -> Result<String, Error> {
        let description = self.description.clone();
        let output = self.output().await?;
        if !output.status.success() {
            return Err(Error::Command {
                command: description,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs the program, classifying a regular non-zero exit as
    /// [Outcome::NotFound] and death by signal as [Outcome::Fatal].
    pub async fn outcome(self) -> Outcome<Output> {
        let description = self.description.clone();
        match self.output().await {
            Ok(output) if output.status.success() => Outcome::Success(output),
            Ok(output) if output.status.code().is_some() => Outcome::NotFound(format!(
                "'{description}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(output) => Outcome::Fatal(format!("'{description}' {}", output.status)),
            Err(e) => Outcome::Fatal(e.to_string()),
        }
    }

    /// Starts the program with its stdout piped to the caller.
    pub fn spawn_stdout(mut self) -> Result<(Child, ChildStdout), Error> {
        let mut child = self
            .cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Fatal(format!("cannot run '{}': {e}", self.description)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Fatal(format!("no stdout for '{}'", self.description)))?;
        Ok((child, stdout))
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Waits for a child started by [Program::spawn_stdout] and checks its
/// exit status.
pub async fn wait_checked(mut child: Child, description: &str) -> Result<(), Error> {
    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::Command {
            command: description.to_string(),
            status: status.to_string(),
            stderr: String::new(),
        });
    }
    Ok(())
}

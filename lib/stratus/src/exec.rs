// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External program execution.
//!
//! Everything the driver does to the host outside of the hypervisor
//! management layer (image conversion, iSCSI session setup, firewall table
//! resync) goes through [`ProcessRunner`]. Commands are never retried here;
//! callers decide what a failure means.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use slog::{debug, Logger};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` exited with {code:?}: {stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// A command line to be executed on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub run_as_root: bool,
    /// Indices into `args` that are masked whenever the command is shown.
    pub secrets: Vec<usize>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an argument that never appears in logs or errors.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secrets.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn as_root(mut self) -> Self {
        self.run_as_root = true;
        self
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secrets.contains(&i) {
                f.write_str(" ******")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(out: impl Into<String>) -> Self {
        Self { stdout: out.into(), stderr: String::new() }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, cmd: Cmd) -> Result<CommandOutput, ExecError>;
}

/// Runs commands on the local host via tokio's process support.
pub struct HostRunner {
    root_helper: Vec<String>,
    log: Logger,
}

impl HostRunner {
    pub fn new(root_helper: &str, log: &Logger) -> Self {
        Self {
            root_helper: root_helper
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            log: log.new(slog::o!("component" => "exec")),
        }
    }

    fn argv(&self, cmd: &Cmd) -> Vec<String> {
        let mut argv = Vec::with_capacity(cmd.args.len() + 2);
        if cmd.run_as_root {
            argv.extend(self.root_helper.iter().cloned());
        }
        argv.push(cmd.program.clone());
        argv.extend(cmd.args.iter().cloned());
        argv
    }

    /// The command line as logged and reported, with secrets masked.
    fn display_line(&self, cmd: &Cmd) -> String {
        if cmd.run_as_root && !self.root_helper.is_empty() {
            format!("{} {cmd}", self.root_helper.join(" "))
        } else {
            cmd.to_string()
        }
    }
}

#[async_trait]
impl ProcessRunner for HostRunner {
    async fn run(&self, cmd: Cmd) -> Result<CommandOutput, ExecError> {
        let argv = self.argv(&cmd);
        let line = self.display_line(&cmd);
        debug!(self.log, "running command"; "cmd" => &line);

        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn { cmd: line.clone(), source })?;

        if let (Some(input), Some(mut pipe)) = (cmd.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|source| {
                ExecError::Spawn { cmd: line.clone(), source }
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ExecError::Spawn { cmd: line.clone(), source })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ExecError::Failed {
                cmd: line,
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

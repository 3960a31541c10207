// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrapper around running external commands (the supervisor's control
//! tool, launchable lifecycle scripts) with failure output captured.

use tokio::process::Command;

/// A command that ran to completion and exited unsuccessfully, with
/// everything it printed along the way.
#[derive(Debug)]
pub struct FailedCommand {
    pub command: String,
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for FailedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "`{}` exited with {}", self.command, self.status)?;
        if !self.stdout.trim().is_empty() {
            write!(f, "; stdout: {}", self.stdout.trim())?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "; stderr: {}", self.stderr.trim())?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("could not spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{0}")]
    Failed(Box<FailedCommand>),
}

fn command_line(command: &Command) -> String {
    let std_command = command.as_std();
    std::iter::once(std_command.get_program())
        .chain(std_command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

/// Run a command to completion, returning its output on success and a
/// captured description of the failure otherwise.
pub async fn execute(
    command: &mut Command,
) -> Result<std::process::Output, ExecutionError> {
    let output = command.output().await.map_err(|err| {
        ExecutionError::Spawn { command: command_line(command), err }
    })?;

    if !output.status.success() {
        return Err(ExecutionError::Failed(Box::new(FailedCommand {
            command: command_line(command),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })));
    }

    Ok(output)
}

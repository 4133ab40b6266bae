//! External command-line tools: the vendor programmer and the image manager.

use std::{fmt, path::Path, process::Command};

use log::{debug, error, info};
#[cfg(test)]
use mockall::automock;

use crate::error::*;

/// Exit status and captured output of a finished tool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Abstraction over running external programs, so the update sequence can
/// be tested without the tools installed.
#[cfg_attr(test, automock)]
pub trait CommandExecutor {
    fn execute(&self, program: &str, args: Vec<String>) -> DfuResult<ToolOutput>;
}

#[derive(Default)]
pub struct RealCommandExecutor;

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, program: &str, args: Vec<String>) -> DfuResult<ToolOutput> {
        let output = Command::new(program).args(&args).output().map_err(|e| {
            DfuError::ToolFailed {
                command: command_line(program, &args),
                status: format!("failed to start: {e}"),
            }
        })?;
        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One invocation of an external tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Run and require a zero exit status.
    pub fn run<E: CommandExecutor + ?Sized>(&self, executor: &E) -> DfuResult<ToolOutput> {
        let command = self.to_string();
        info!("Executing command: {command}");
        let output = executor.execute(&self.program, self.args.clone())?;
        if !output.stdout.is_empty() {
            info!("Command output: {}", output.stdout.trim_end());
        }
        if !output.stderr.is_empty() {
            error!("Command error: {}", output.stderr.trim_end());
        }
        if !output.success() {
            error!("Command failed: {command}");
            return Err(DfuError::ToolFailed {
                command,
                status: output.status(),
            });
        }
        Ok(output)
    }

    /// Run and ignore the outcome.
    pub fn run_tolerant<E: CommandExecutor + ?Sized>(&self, executor: &E) {
        match executor.execute(&self.program, self.args.clone()) {
            Ok(output) if output.success() => debug!("{self}: ok"),
            Ok(output) => debug!("{self}: {} (ignored)", output.status()),
            Err(e) => debug!("{self}: {e} (ignored)"),
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&command_line(&self.program, &self.args))
    }
}

/// `nrfutil device program` invocations.
pub struct Nrfutil<'a> {
    program: &'a str,
}

impl<'a> Nrfutil<'a> {
    pub fn new(program: &'a str) -> Self {
        Nrfutil { program }
    }

    pub fn program(&self, serial_number: &str, firmware: &Path) -> ToolCommand {
        ToolCommand {
            program: self.program.to_string(),
            args: vec![
                "device".into(),
                "program".into(),
                "--serial-number".into(),
                serial_number.into(),
                "--firmware".into(),
                firmware.display().to_string(),
            ],
        }
    }
}

/// `mcumgr` invocations over a serial SMP connection.
pub struct Mcumgr<'a> {
    program: &'a str,
    connstring: String,
}

impl<'a> Mcumgr<'a> {
    pub fn new(program: &'a str, port: &str, baud_rate: u32) -> Self {
        Mcumgr {
            program,
            connstring: format!("dev={port},baud={baud_rate}"),
        }
    }

    fn command(&self, subcommand: &[&str]) -> ToolCommand {
        let mut args: Vec<String> = vec![
            "--conntype".into(),
            "serial".into(),
            "--connstring".into(),
            self.connstring.clone(),
        ];
        args.extend(subcommand.iter().map(|s| s.to_string()));
        ToolCommand {
            program: self.program.to_string(),
            args,
        }
    }

    pub fn image_list(&self) -> ToolCommand {
        self.command(&["image", "list"])
    }

    /// Short-timeout listing that gets the SMP server talking.
    pub fn warm_up(&self) -> ToolCommand {
        self.command(&["image", "list", "-t", "1"])
    }

    pub fn image_upload(&self, image: &Path, image_number: u32) -> ToolCommand {
        let image = image.display().to_string();
        let number = image_number.to_string();
        self.command(&["image", "upload", &image, "-n", &number])
    }

    pub fn image_confirm(&self, digest: &str) -> ToolCommand {
        self.command(&["image", "confirm", digest])
    }

    pub fn reset(&self) -> ToolCommand {
        self.command(&["reset"])
    }
}

#[cfg(test)]
pub(crate) fn exited(code: i32) -> ToolOutput {
    ToolOutput {
        code: Some(code),
        ..Default::default()
    }
}

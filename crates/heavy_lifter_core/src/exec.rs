use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::info;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn program_path(program: &Path) -> Self {
        Self::new(program.to_string_lossy().to_string())
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn path_arg(self, value: &Path) -> Self {
        self.arg(value.to_string_lossy().to_string())
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait CommandRunner {
    fn run(&mut self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the host, echoing their output unless `quiet`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    pub quiet: bool,
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, command: &CommandSpec) -> Result<CommandOutput> {
        info!("[exec] {command}");
        let mut process = Command::new(&command.program);
        process.args(&command.args);
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }
        let output = process
            .output()
            .with_context(|| format!("failed to execute {}", command.program))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !self.quiet {
            if !stdout.is_empty() {
                print!("{stdout}");
            }
            if !stderr.is_empty() {
                eprint!("{stderr}");
            }
        }

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(1),
            stdout,
            stderr,
        })
    }
}

/// Ordered commands executed with stop-on-fail.
#[derive(Debug, Clone, Default)]
pub struct ExecStack {
    commands: Vec<CommandSpec>,
}

impl ExecStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: CommandSpec) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    /// Returns the number of commands run.
    pub fn run(&self, runner: &mut dyn CommandRunner) -> Result<usize> {
        for (index, command) in self.commands.iter().enumerate() {
            run_checked(runner, command).with_context(|| {
                format!(
                    "stopped at step {} of {}",
                    index + 1,
                    self.commands.len()
                )
            })?;
        }
        Ok(self.commands.len())
    }
}

/// Runs a single command and fails on a non-zero exit.
pub fn run_checked(runner: &mut dyn CommandRunner, command: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(command)?;
    if !output.success() {
        let stderr = output.stderr.trim();
        if stderr.is_empty() {
            bail!("`{command}` exited with status {}", output.code);
        }
        bail!("`{command}` exited with status {}: {stderr}", output.code);
    }
    Ok(output)
}

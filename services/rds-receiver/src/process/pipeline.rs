//! Explicit command pipelines (no shell strings)

use std::fmt;
use std::path::Path;

/// One program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
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

    /// Program file name without directories
    pub fn name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    /// Value following `flag`, e.g. `-f` → `100.2M`
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Ordered stages; stage N's stdout feeds stage N+1's stdin.
/// Runs as one unit with one process-group identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    stages: Vec<CommandSpec>,
}

impl PipelineSpec {
    pub fn single(command: CommandSpec) -> Self {
        Self {
            stages: vec![command],
        }
    }

    pub fn pipe(mut self, command: CommandSpec) -> Self {
        self.stages.push(command);
        self
    }

    pub fn stages(&self) -> &[CommandSpec] {
        &self.stages
    }

    pub fn first(&self) -> Option<&CommandSpec> {
        self.stages.first()
    }
}

impl From<CommandSpec> for PipelineSpec {
    fn from(command: CommandSpec) -> Self {
        Self::single(command)
    }
}

impl fmt::Display for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

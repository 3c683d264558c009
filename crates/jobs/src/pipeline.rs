//! Pipeline descriptions consumed by the job runner.
//!
//! A [`Pipeline`] is an ordered list of [`Command`]s with optional input and
//! output redirection and an output-capture flag. Argument words arrive here
//! already evaluated; building them from expression trees is the
//! interpreter's business, not the runner's.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One pipeline stage: a program name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    /// Start a command from its program name.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            words: vec![program.into()],
        }
    }

    /// Append one argument word.
    pub fn arg(mut self, word: impl Into<String>) -> Self {
        self.words.push(word.into());
        self
    }

    /// Append several argument words.
    pub fn args<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.words.extend(words.into_iter().map(Into::into));
        self
    }

    /// The program name (`argv[0]`).
    pub fn program(&self) -> &str {
        &self.words[0]
    }

    /// The full argv, program included.
    pub fn words(&self) -> &[String] {
        &self.words
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.words.join(" "))
    }
}

/// An ordered chain of commands with redirections and a capture flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    commands: Vec<Command>,
    input_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    capture_output: bool,
}

impl Pipeline {
    /// An empty pipeline; [`run`](crate::JobTable::run) rejects it until at
    /// least one command is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Redirect the first stage's stdin from a file.
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    /// Redirect the last stage's stdout to a file.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Capture the last stage's stdout into the job record instead of
    /// inheriting the parent's stdout.
    pub fn capture(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// `true` when the pipeline has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The stages in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Input redirection, if any.
    pub fn input_file(&self) -> Option<&Path> {
        self.input_file.as_deref()
    }

    /// Output redirection, if any.
    pub fn output_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    /// Whether the last stage's stdout is captured.
    pub fn captures_output(&self) -> bool {
        self.capture_output
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, command) in self.commands.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{command}")?;
            if i == 0 {
                if let Some(input) = &self.input_file {
                    write!(f, " < {}", input.display())?;
                }
            }
        }
        if let Some(output) = &self.output_file {
            write!(f, " > {}", output.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display() {
        let cmd = Command::new("tr").arg("h").arg("H");
        assert_eq!(cmd.to_string(), "tr h H");
        assert_eq!(cmd.program(), "tr");
    }

    #[test]
    fn pipeline_display_with_redirections() {
        let pipeline = Pipeline::new()
            .command(Command::new("grep").arg("-v").arg("noise"))
            .command(Command::new("sort"))
            .input("in.txt")
            .output("out.txt");
        assert_eq!(pipeline.to_string(), "grep -v noise < in.txt | sort > out.txt");
    }

    #[test]
    fn empty_pipeline() {
        assert!(Pipeline::new().is_empty());
        assert!(!Pipeline::new().command(Command::new("true")).is_empty());
    }

    #[test]
    fn serde_round_trip() {
        let pipeline = Pipeline::new()
            .command(Command::new("echo").arg("hi"))
            .capture(true);
        let json = serde_json::to_string(&pipeline).unwrap();
        let back: Pipeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pipeline);
    }
}

//! Command construction for POSIX and PowerShell targets

pub mod posix;
pub mod powershell;

pub use posix::{ExecuteOptions, PosixShell};
pub use powershell::PowerShell;

/// Shell family of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Posix,
    PowerShell,
}

/// A command as a literal line or as argv words to be quoted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Line(String),
    Argv(Vec<String>),
}

impl Cmd {
    /// Build an argv command
    pub fn argv<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Cmd::Argv(words.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Cmd {
    fn from(line: &str) -> Self {
        Cmd::Line(line.to_string())
    }
}

impl From<String> for Cmd {
    fn from(line: String) -> Self {
        Cmd::Line(line)
    }
}

impl From<Vec<String>> for Cmd {
    fn from(argv: Vec<String>) -> Self {
        Cmd::Argv(argv)
    }
}

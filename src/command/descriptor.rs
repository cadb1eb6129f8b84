//! Parsed command descriptors

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::experiment::ExperimentId;
use crate::{Error, Result};

macro_rules! command_kinds {
    ($($variant:ident => $name:literal,)+) => {
        /// Every command the tool understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandKind {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl CommandKind {
            /// All kinds, in `help` order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Command word.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }
    };
}

command_kinds! {
    ExpAttach => "expAttach",
    ExpClose => "expClose",
    ExpCreate => "expCreate",
    ExpDetach => "expDetach",
    ExpDisable => "expDisable",
    ExpEnable => "expEnable",
    ExpFocus => "expFocus",
    ExpGo => "expGo",
    ExpPause => "expPause",
    ExpRestore => "expRestore",
    ExpSave => "expSave",
    ExpSetParam => "expSetParam",
    ExpStatus => "expStatus",
    ExpView => "expView",
    ListBreaks => "listBreaks",
    ListExp => "listExp",
    ListHosts => "listHosts",
    ListMetrics => "listMetrics",
    ListObj => "listObj",
    ListParams => "listParams",
    ListPids => "listPids",
    ListRanks => "listRanks",
    ListSrc => "listSrc",
    ListStatus => "listStatus",
    ListThreads => "listThreads",
    ListTypes => "listTypes",
    ListViews => "listViews",
    ClearBreak => "clearBreak",
    Exit => "exit",
    Help => "help",
    History => "history",
    Log => "log",
    OpenGui => "openGui",
    Playback => "playback",
    Record => "record",
    SetBreak => "setBreak",
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidOperand(format!("unknown command '{s}'")))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command as handed over by the parser: its word, the focused experiment,
/// an optional output redirect, named options and positional operands.
///
/// ```rust
/// use perfex::command::{CommandKind, ParsedCommand};
///
/// let cmd = ParsedCommand::parse("expView -x 2 -v statements pcsamp")?;
/// assert_eq!(cmd.kind(), Some(CommandKind::ExpView));
/// assert_eq!(cmd.experiment(), Some(2));
/// assert_eq!(cmd.option("v"), Some("statements"));
/// assert_eq!(cmd.positionals(), ["pcsamp"]);
/// # Ok::<(), perfex::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    name: String,
    experiment: Option<ExperimentId>,
    redirect: Option<PathBuf>,
    options: Vec<(String, String)>,
    positionals: Vec<String>,
}

impl ParsedCommand {
    /// A command with no operands.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment: None,
            redirect: None,
            options: Vec::new(),
            positionals: Vec::new(),
        }
    }

    /// Split a command line on whitespace.
    ///
    /// `-x <id>` sets the experiment, `-o <file>` the redirect, any other
    /// `-<flag> <value>` becomes a named option, and the remaining words are
    /// positional.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperand`] for an empty line, a flag without a
    /// value, or a non-numeric experiment id.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| Error::InvalidOperand("empty command".into()))?;
        let mut command = Self::new(name);
        while let Some(word) = words.next() {
            let Some(flag) = word.strip_prefix('-').filter(|flag| !flag.is_empty()) else {
                command.positionals.push(word.to_string());
                continue;
            };
            let value = words
                .next()
                .ok_or_else(|| Error::InvalidOperand(format!("missing value for -{flag}")))?;
            match flag {
                "x" => {
                    let id = value.parse().map_err(|_| {
                        Error::InvalidOperand(format!("'{value}' is not an experiment id"))
                    })?;
                    command.experiment = Some(id);
                }
                "o" => command.redirect = Some(PathBuf::from(value)),
                _ => command.options.push((flag.to_string(), value.to_string())),
            }
        }
        Ok(command)
    }

    /// Focus on an experiment (`-x`).
    #[must_use]
    pub fn with_experiment(mut self, id: ExperimentId) -> Self {
        self.experiment = Some(id);
        self
    }

    /// Redirect output to a file (`-o`).
    #[must_use]
    pub fn with_redirect(mut self, path: impl Into<PathBuf>) -> Self {
        self.redirect = Some(path.into());
        self
    }

    /// Add a named option.
    #[must_use]
    pub fn with_option(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((flag.into(), value.into()));
        self
    }

    /// Add a positional operand.
    #[must_use]
    pub fn with_positional(mut self, value: impl Into<String>) -> Self {
        self.positionals.push(value.into());
        self
    }

    /// Command word as typed.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recognized kind, if any.
    #[must_use]
    pub fn kind(&self) -> Option<CommandKind> {
        self.name.parse().ok()
    }

    /// Focused experiment.
    #[must_use]
    pub const fn experiment(&self) -> Option<ExperimentId> {
        self.experiment
    }

    /// Redirect target.
    #[must_use]
    pub fn redirect(&self) -> Option<&Path> {
        self.redirect.as_deref()
    }

    /// Last value given for `flag`.
    #[must_use]
    pub fn option(&self, flag: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(name, _)| name == flag)
            .map(|(_, value)| value.as_str())
    }

    /// All named options in the order given.
    #[must_use]
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Positional operands.
    #[must_use]
    pub fn positionals(&self) -> &[String] {
        &self.positionals
    }
}

impl fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(id) = self.experiment {
            write!(f, " -x {id}")?;
        }
        for (flag, value) in &self.options {
            write!(f, " -{flag} {value}")?;
        }
        for value in &self.positionals {
            write!(f, " {value}")?;
        }
        if let Some(path) = &self.redirect {
            write!(f, " -o {}", path.display())?;
        }
        Ok(())
    }
}

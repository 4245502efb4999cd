//! Command Parsing
//!
//! Turns text lines into typed [`Command`]s.
//!
//! A line is split on whitespace. The first word names the command, and
//! the remaining words are converted one by one into the argument kinds the
//! command declares. When a command's last declared argument is text, it
//! takes the rest of the line, so `echo hello world` carries a single
//! `Text("hello world")` argument.
//!
//! Argument construction goes through [`ARG_FACTORIES`], a static table
//! from [`ArgKind`] to constructor function.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Errors raised while parsing commands.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' expects a {kind} argument")]
    MissingArgument { command: CommandKind, kind: ArgKind },

    #[error("'{command}' takes at most {expected} argument(s)")]
    TooManyArguments { command: CommandKind, expected: usize },

    #[error("invalid {kind} value '{value}'")]
    InvalidArgument { kind: ArgKind, value: String },

    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<CommandError>,
    },
}

/// The kind of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Int,
    Float,
    Bool,
    Text,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::Int => "integer",
            ArgKind::Float => "float",
            ArgKind::Bool => "boolean",
            ArgKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Arg {
    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Int(_) => ArgKind::Int,
            Arg::Float(_) => ArgKind::Float,
            Arg::Bool(_) => ArgKind::Bool,
            Arg::Text(_) => ArgKind::Text,
        }
    }

    /// Builds an argument of `kind` from its textual form.
    pub fn parse(kind: ArgKind, raw: &str) -> Result<Arg, CommandError> {
        let factory = ARG_FACTORIES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, factory)| *factory)
            .unwrap_or(make_text);
        factory(raw)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(s) => Some(s),
            _ => None,
        }
    }
}

// Floats hash by bit pattern so identical scripts hash identically
impl Hash for Arg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            Arg::Int(n) => n.hash(state),
            Arg::Float(x) => x.to_bits().hash(state),
            Arg::Bool(b) => b.hash(state),
            Arg::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(n) => write!(f, "{}", n),
            Arg::Float(x) => write!(f, "{}", x),
            Arg::Bool(b) => write!(f, "{}", b),
            Arg::Text(s) => f.write_str(s),
        }
    }
}

/// Constructor function for one argument kind.
pub type ArgFactory = fn(&str) -> Result<Arg, CommandError>;

/// Argument constructors, one per kind.
pub static ARG_FACTORIES: &[(ArgKind, ArgFactory)] = &[
    (ArgKind::Int, make_int),
    (ArgKind::Float, make_float),
    (ArgKind::Bool, make_bool),
    (ArgKind::Text, make_text),
];

fn make_int(raw: &str) -> Result<Arg, CommandError> {
    raw.parse().map(Arg::Int).map_err(|_| invalid(ArgKind::Int, raw))
}

fn make_float(raw: &str) -> Result<Arg, CommandError> {
    raw.parse()
        .map(Arg::Float)
        .map_err(|_| invalid(ArgKind::Float, raw))
}

fn make_bool(raw: &str) -> Result<Arg, CommandError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(Arg::Bool(true)),
        "false" | "no" | "off" | "0" => Ok(Arg::Bool(false)),
        _ => Err(invalid(ArgKind::Bool, raw)),
    }
}

fn make_text(raw: &str) -> Result<Arg, CommandError> {
    Ok(Arg::Text(raw.to_string()))
}

fn invalid(kind: ArgKind, raw: &str) -> CommandError {
    CommandError::InvalidArgument {
        kind,
        value: raw.to_string(),
    }
}

/// The commands the bundled interpreter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Help,
    Echo,
    Set,
    Get,
    Del,
    List,
    Size,
    Clear,
    Add,
    ExecuteScript,
    Exit,
}

impl CommandKind {
    /// Every command, in help order.
    pub const ALL: &'static [CommandKind] = &[
        CommandKind::Help,
        CommandKind::Echo,
        CommandKind::Set,
        CommandKind::Get,
        CommandKind::Del,
        CommandKind::List,
        CommandKind::Size,
        CommandKind::Clear,
        CommandKind::Add,
        CommandKind::ExecuteScript,
        CommandKind::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Help => "help",
            CommandKind::Echo => "echo",
            CommandKind::Set => "set",
            CommandKind::Get => "get",
            CommandKind::Del => "del",
            CommandKind::List => "list",
            CommandKind::Size => "size",
            CommandKind::Clear => "clear",
            CommandKind::Add => "add",
            CommandKind::ExecuteScript => "execute_script",
            CommandKind::Exit => "exit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|kind| kind.name() == lower)
    }

    /// Declared argument kinds, in order.
    pub fn signature(self) -> &'static [ArgKind] {
        match self {
            CommandKind::Help
            | CommandKind::List
            | CommandKind::Size
            | CommandKind::Clear
            | CommandKind::Exit => &[],
            CommandKind::Echo => &[ArgKind::Text],
            CommandKind::Set => &[ArgKind::Text, ArgKind::Text],
            CommandKind::Get | CommandKind::Del => &[ArgKind::Text],
            CommandKind::Add => &[ArgKind::Text, ArgKind::Int],
            CommandKind::ExecuteScript => &[ArgKind::Text],
        }
    }

    /// Usage line shown by `help`.
    pub fn usage(self) -> &'static str {
        match self {
            CommandKind::Help => "help - list commands",
            CommandKind::Echo => "echo <text> - print text",
            CommandKind::Set => "set <key> <value> - store a value",
            CommandKind::Get => "get <key> - print a value",
            CommandKind::Del => "del <key> - remove a value",
            CommandKind::List => "list - print every entry",
            CommandKind::Size => "size - print the number of entries",
            CommandKind::Clear => "clear - remove every entry",
            CommandKind::Add => "add <key> <int> - add to a numeric value",
            CommandKind::ExecuteScript => "execute_script <name> - run a client-side script",
            CommandKind::Exit => "exit - end the session",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Hash)]
pub struct Command {
    pub kind: CommandKind,
    pub args: Vec<Arg>,
}

impl Command {
    pub fn new(kind: CommandKind, args: Vec<Arg>) -> Self {
        Self { kind, args }
    }

    /// Parses one command line.
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let line = line.trim();
        let (name, mut rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim_start()),
            None => (line, ""),
        };
        if name.is_empty() {
            return Err(CommandError::Empty);
        }

        let kind = CommandKind::from_name(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        let signature = kind.signature();

        let mut args = Vec::with_capacity(signature.len());
        for (i, arg_kind) in signature.iter().enumerate() {
            let last = i + 1 == signature.len();
            let raw = if last && *arg_kind == ArgKind::Text {
                std::mem::take(&mut rest).trim_end()
            } else {
                let (word, tail) = match rest.split_once(char::is_whitespace) {
                    Some((word, tail)) => (word, tail.trim_start()),
                    None => (rest, ""),
                };
                rest = tail;
                word
            };

            if raw.is_empty() {
                return Err(CommandError::MissingArgument {
                    command: kind,
                    kind: *arg_kind,
                });
            }
            args.push(Arg::parse(*arg_kind, raw)?);
        }

        if !rest.trim().is_empty() {
            return Err(CommandError::TooManyArguments {
                command: kind,
                expected: signature.len(),
            });
        }

        Ok(Command { kind, args })
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Parses a script body, one command per line.
///
/// Blank lines and lines starting with `#` are skipped. The first bad line
/// fails the whole script.
pub fn parse_script(text: &str) -> Result<Vec<Command>, CommandError> {
    let mut commands = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let command = Command::parse(trimmed).map_err(|e| CommandError::Line {
            line: index + 1,
            source: Box::new(e),
        })?;
        commands.push(command);
    }
    Ok(commands)
}

/*!
Command allow-list: turns a raw, client-supplied command line into a fixed operation
plus positional arguments.

The gateway owns every flag passed to the entry point. Client tokens are placed after a
`--` separator so they can only ever be positional arguments of the chosen operation.
*/

use std::fmt;

/// Default cap on argument tokens after the command token.
pub const DEFAULT_MAX_ARGS: usize = 64;
/// Default cap on a single argument token, in bytes.
pub const DEFAULT_MAX_ARG_LEN: usize = 4096;

/// Operations the gateway will run. Anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ask,
    RunAgent,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::Ask, Operation::RunAgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Ask => "ask",
            Operation::RunAgent => "run_agent",
        }
    }

    /// Exact, case-sensitive match against the allow-list.
    pub fn from_token(token: &str) -> Option<Self> {
        Operation::ALL.into_iter().find(|op| op.as_str() == token)
    }

    /// Flags the gateway always passes for this operation.
    pub fn fixed_flags(&self) -> &'static [&'static str] {
        match self {
            Operation::Ask => &["--stream"],
            Operation::RunAgent => &["--stream"],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No command provided")]
    MissingCommand,
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Too many arguments ({count} > {max})")]
    TooManyArguments { count: usize, max: usize },
    #[error("Argument {index} too long ({len} > {max} bytes)")]
    ArgumentTooLong { index: usize, len: usize, max: usize },
    #[error("Argument {index} contains control characters")]
    InvalidArgument { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLimits {
    pub max_args: usize,
    pub max_arg_len: usize,
}

impl Default for CommandLimits {
    fn default() -> Self {
        CommandLimits {
            max_args: DEFAULT_MAX_ARGS,
            max_arg_len: DEFAULT_MAX_ARG_LEN,
        }
    }
}

/// A validated command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    operation: Operation,
    args: Vec<String>,
}

impl ResolvedCommand {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Client-supplied argument tokens, in order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Arguments handed to the entry point:
    /// `<operation> <fixed flags...> -- <client args...>`.
    pub fn argv(&self) -> Vec<String> {
        let flags = self.operation.fixed_flags();
        let mut out = Vec::with_capacity(2 + flags.len() + self.args.len());
        out.push(self.operation.as_str().to_string());
        out.extend(flags.iter().map(|f| f.to_string()));
        out.push("--".to_string());
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Resolve with the default limits.
pub fn resolve(raw: &str) -> Result<ResolvedCommand, ValidationError> {
    resolve_with(raw, &CommandLimits::default())
}

pub fn resolve_with(raw: &str, limits: &CommandLimits) -> Result<ResolvedCommand, ValidationError> {
    let mut tokens = raw.split_whitespace();
    let head = tokens.next().ok_or(ValidationError::MissingCommand)?;
    let operation = Operation::from_token(head).ok_or(ValidationError::UnknownCommand)?;

    let rest: Vec<&str> = tokens.collect();
    if rest.len() > limits.max_args {
        return Err(ValidationError::TooManyArguments {
            count: rest.len(),
            max: limits.max_args,
        });
    }

    let mut args = Vec::with_capacity(rest.len());
    for (index, tok) in rest.into_iter().enumerate() {
        if tok.len() > limits.max_arg_len {
            return Err(ValidationError::ArgumentTooLong {
                index,
                len: tok.len(),
                max: limits.max_arg_len,
            });
        }
        if tok.chars().any(char::is_control) {
            return Err(ValidationError::InvalidArgument { index });
        }
        args.push(tok.to_string());
    }

    Ok(ResolvedCommand { operation, args })
}

use std::marker::PhantomData;
use async_trait::async_trait;
use clap::{CommandFactory, FromArgMatches, Parser};
use clap::error::ErrorKind;
use crate::shell::credentials::CredentialError;
use crate::shell::path::{Capability, LookupError};
use crate::shell::size::SizeParseError;
use crate::vim::ApiError;
use super::context::CommandContext;

/// Result type for command execution
pub type CommandResult = Result<String, CommandError>;

/// Errors that can occur during command execution
#[derive(Debug)]
pub enum CommandError {
    /// Malformed input, rejected before any remote call
    InvalidArguments(String),
    /// A path did not resolve to what the command needs
    Lookup(LookupError),
    /// The server rejected a call
    Fault(String),
    /// At least one tracked task ended in error
    TaskFailed { report: String, failed: usize, total: usize },
    /// A wait ran out of time
    Timeout(String),
    /// Ctrl-C while the command was waiting
    Interrupted,
    Io(std::io::Error),
    /// Command not found
    NotFound(String),
    /// Generic execution error
    Execution(String),
    /// `--help` output; printed like regular output
    Help(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::InvalidArguments(msg) => write!(f, "{}", msg.trim_end()),
            CommandError::Lookup(err) => write!(f, "{}", err),
            CommandError::Fault(msg) => write!(f, "{}", msg),
            CommandError::TaskFailed { report, failed, total } => write!(f, "{}{} of {} tasks failed", report, failed, total),
            CommandError::Timeout(msg) => write!(f, "{}", msg),
            CommandError::Interrupted => write!(f, "Interrupted"),
            CommandError::Io(err) => write!(f, "{}", err),
            CommandError::NotFound(msg) => write!(f, "{}", msg),
            CommandError::Execution(msg) => write!(f, "{}", msg),
            CommandError::Help(text) => write!(f, "{}", text.trim_end()),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<ApiError> for CommandError {
    fn from(err: ApiError) -> Self {
        CommandError::Fault(err.to_string())
    }
}

impl From<LookupError> for CommandError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::Api(api) => api.into(),
            other => CommandError::Lookup(other),
        }
    }
}

impl From<SizeParseError> for CommandError {
    fn from(err: SizeParseError) -> Self {
        CommandError::InvalidArguments(err.to_string())
    }
}

impl From<CredentialError> for CommandError {
    fn from(err: CredentialError) -> Self {
        CommandError::Execution(err.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::Io(err)
    }
}

impl From<clap::Error> for CommandError {
    fn from(err: clap::Error) -> Self {
        let text = err.render().to_string();
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => CommandError::Help(text),
            _ => CommandError::InvalidArguments(text),
        }
    }
}

/// Something the dispatcher can run by name
#[async_trait]
pub trait Command: Send + Sync {
    /// Module the command belongs to (`basic`, `vm`, ...)
    fn module(&self) -> &str;

    /// Name within the module
    fn name(&self) -> &str;

    /// Short names that work without the module prefix
    fn aliases(&self) -> Vec<&'static str> {
        vec![]
    }

    /// One line shown by `help`
    fn summary(&self) -> String;

    /// Full usage text
    fn help(&self) -> String;

    /// What kind of object the command operates on, for `help <path>`
    fn applies_to(&self) -> Option<Capability> {
        None
    }

    /// Execute the command with the given arguments and context
    async fn execute(&self, args: &[String], context: &mut CommandContext) -> CommandResult;

    fn qualified_name(&self) -> String {
        format!("{}.{}", self.module(), self.name())
    }
}

/// The body of a command whose options are declared with clap
#[async_trait]
pub trait Invocation: Parser + Send + 'static {
    async fn run(self, context: &mut CommandContext) -> CommandResult;
}

/// Adapts an [`Invocation`] to [`Command`]: parses the words, then runs
pub struct ParsedCommand<A> {
    module: &'static str,
    name: String,
    aliases: Vec<&'static str>,
    applies_to: Option<Capability>,
    args: PhantomData<fn() -> A>,
}

impl<A: Invocation> ParsedCommand<A> {
    pub fn new(module: &'static str) -> Self {
        Self {
            module,
            name: A::command().get_name().to_string(),
            aliases: Vec::new(),
            applies_to: None,
            args: PhantomData,
        }
    }

    pub fn alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn operates_on(mut self, capability: Capability) -> Self {
        self.applies_to = Some(capability);
        self
    }

    fn clap_command(&self) -> clap::Command {
        A::command().bin_name(format!("{}.{}", self.module, self.name))
    }
}

#[async_trait]
impl<A: Invocation> Command for ParsedCommand<A> {
    fn module(&self) -> &str {
        self.module
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn aliases(&self) -> Vec<&'static str> {
        self.aliases.clone()
    }

    fn summary(&self) -> String {
        A::command().get_about().map(|about| about.to_string()).unwrap_or_default()
    }

    fn help(&self) -> String {
        self.clap_command().render_help().to_string()
    }

    fn applies_to(&self) -> Option<Capability> {
        self.applies_to
    }

    async fn execute(&self, args: &[String], context: &mut CommandContext) -> CommandResult {
        let argv = std::iter::once(self.qualified_name()).chain(args.iter().cloned());
        let matches = self.clap_command().try_get_matches_from(argv)?;
        let parsed = A::from_arg_matches(&matches)?;
        parsed.run(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clap_help_is_not_an_error() {
        #[derive(Parser, Debug)]
        #[command(name = "sample")]
        struct Sample {
            #[arg(long)]
            count: u32,
        }

        let err = Sample::try_parse_from(["basic.sample", "--help"]).unwrap_err();
        assert!(matches!(CommandError::from(err), CommandError::Help(_)));

        let err = Sample::try_parse_from(["basic.sample", "--count", "many"]).unwrap_err();
        let err = CommandError::from(err);
        assert!(matches!(err, CommandError::InvalidArguments(_)));
        assert!(err.to_string().contains("--count"));
    }

    #[test]
    fn test_task_failed_display_keeps_report() {
        let err = CommandError::TaskFailed {
            report: "a: success\nb: error: boom\n".to_string(),
            failed: 1,
            total: 2,
        };
        assert_eq!(err.to_string(), "a: success\nb: error: boom\n1 of 2 tasks failed");
    }

    #[test]
    fn test_lookup_api_error_becomes_fault() {
        let err = CommandError::from(LookupError::Api(ApiError::fault("NoPermission", "denied")));
        assert!(matches!(err, CommandError::Fault(ref msg) if msg == "NoPermission: denied"));
    }
}

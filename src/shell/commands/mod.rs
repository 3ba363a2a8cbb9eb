// Command handlers, one module per command namespace

pub mod command_trait;
pub mod context;
pub mod registry;
pub mod dispatcher;
pub mod basic;
pub mod host;
pub mod vm;
pub mod vm_guest;

#[allow(unused)]
pub use command_trait::{Command, CommandError, CommandResult, Invocation, ParsedCommand};
pub use context::{CommandContext, Target};
pub use registry::CommandRegistry;
pub use dispatcher::CommandDispatcher;

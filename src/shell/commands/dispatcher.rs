use std::sync::Arc;
use super::command_trait::{CommandError, CommandResult};
use super::context::CommandContext;
use super::registry::CommandRegistry;

/// Handles command parsing and execution
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    /// Run one line and return what it produced, or the error
    pub async fn dispatch(&self, command_line: &str, context: &mut CommandContext) -> CommandResult {
        let words = tokenize(command_line)?;
        let Some((name, args)) = words.split_first() else {
            return Ok(String::new());
        };
        let command = self.registry.get(name)
            .cloned()
            .ok_or_else(|| CommandError::NotFound(format!("{}: command not found", name)))?;
        log::debug!("running {} {:?}", command.qualified_name(), args);
        command.execute(args, context).await
    }

    /// Run one line; errors come back as text like any other output
    pub async fn execute(&self, command_line: &str, context: &mut CommandContext) -> String {
        match self.dispatch(command_line, context).await {
            Ok(output) => output,
            Err(CommandError::Help(text)) => text,
            Err(error) => format!("{}\n", error),
        }
    }
}

/// Split a line into words. Single quotes are literal, double quotes allow `\` escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('\''), _) => current.push(c),
            (_, '\\') => {
                let escaped = chars.next().ok_or_else(|| CommandError::InvalidArguments("trailing backslash".to_string()))?;
                current.push(escaped);
                in_word = true;
            }
            (Some(_), _) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, _) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(CommandError::InvalidArguments("unterminated quote".to_string()));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vim::simulator::Simulator;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("  vm.on  a b ").unwrap(), vec!["vm.on", "a", "b"]);
        assert_eq!(tokenize(r#"vm.annotate web "ip: 10.0.0.5" 'it''s'"#).unwrap(), vec!["vm.annotate", "web", "ip: 10.0.0.5", "its"]);
        assert_eq!(tokenize(r#"mark x "" a\ b"#).unwrap(), vec!["mark", "x", "", "a b"]);
        assert_eq!(tokenize(r#"echo "a \"b\"""#).unwrap(), vec!["echo", r#"a "b""#]);
        assert!(tokenize("ls 'open").is_err());
        assert!(tokenize("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut ctx = CommandContext::simulated(Arc::new(Simulator::new()));
        let dispatcher = CommandDispatcher::new(ctx.registry.clone());
        assert_eq!(dispatcher.execute("frobnicate now", &mut ctx).await, "frobnicate: command not found\n");
        assert_eq!(dispatcher.execute("   ", &mut ctx).await, "");
    }

    #[tokio::test]
    async fn test_help_flag_is_plain_output() {
        let mut ctx = CommandContext::simulated(Arc::new(Simulator::new()));
        let dispatcher = CommandDispatcher::new(ctx.registry.clone());
        let output = dispatcher.execute("vm.create --help", &mut ctx).await;
        assert!(output.contains("Usage: vm.create"));
        assert!(output.contains("--disksize"));
    }
}

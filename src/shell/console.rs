use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Password, Select};

/// Interactive input a command may need halfway through
pub trait Prompter: Send + Sync {
    /// Read a secret without echo
    fn password(&self, prompt: &str) -> io::Result<String>;

    /// Pick one of `items`; `None` when the user backs out
    fn select(&self, prompt: &str, items: &[String]) -> io::Result<Option<usize>>;
}

/// Prompts on the controlling terminal
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn password(&self, prompt: &str) -> io::Result<String> {
        Password::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
            .map_err(io::Error::other)
    }

    fn select(&self, prompt: &str, items: &[String]) -> io::Result<Option<usize>> {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .items(items)
            .default(0)
            .interact_opt()
            .map_err(io::Error::other)
    }
}

/// Canned answers, consumed in order
#[cfg(test)]
#[derive(Default)]
pub struct ScriptedPrompter {
    passwords: Mutex<Vec<String>>,
    selections: Mutex<Vec<Option<usize>>>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new(passwords: Vec<&str>, selections: Vec<Option<usize>>) -> Self {
        Self {
            passwords: Mutex::new(passwords.into_iter().rev().map(str::to_string).collect()),
            selections: Mutex::new(selections.into_iter().rev().collect()),
        }
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn password(&self, _prompt: &str) -> io::Result<String> {
        self.passwords.lock()
            .map_err(|_| io::Error::other("prompter poisoned"))?
            .pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted password left"))
    }

    fn select(&self, _prompt: &str, _items: &[String]) -> io::Result<Option<usize>> {
        self.selections.lock()
            .map_err(|_| io::Error::other("prompter poisoned"))?
            .pop()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted selection left"))
    }
}

/// Terminal side channel: the rewritable status line and prompts.
/// Regular command output is returned as a string instead.
#[derive(Clone)]
pub struct Console {
    status_line: bool,
    prompter: Arc<dyn Prompter>,
}

impl Console {
    pub fn terminal() -> Self {
        Self {
            status_line: io::stderr().is_terminal(),
            prompter: Arc::new(TerminalPrompter),
        }
    }

    /// No status line, answers come from `prompter`
    #[cfg(test)]
    pub fn detached(prompter: Arc<dyn Prompter>) -> Self {
        Self {
            status_line: false,
            prompter,
        }
    }

    /// Replace the status line in place
    pub fn status(&self, line: &str) {
        if self.status_line {
            let mut err = io::stderr();
            let _ = write!(err, "\r\x1b[K{}", line);
            let _ = err.flush();
        }
    }

    pub fn clear_status(&self) {
        if self.status_line {
            let mut err = io::stderr();
            let _ = write!(err, "\r\x1b[K");
            let _ = err.flush();
        }
    }

    pub fn password(&self, prompt: &str) -> io::Result<String> {
        self.prompter.password(prompt)
    }

    pub fn select(&self, prompt: &str, items: &[String]) -> io::Result<Option<usize>> {
        self.prompter.select(prompt, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_prompter_answers_in_order() {
        let console = Console::detached(Arc::new(ScriptedPrompter::new(vec!["first", "second"], vec![Some(2), None])));
        assert_eq!(console.password("password: ").unwrap(), "first");
        assert_eq!(console.password("password: ").unwrap(), "second");
        assert!(console.password("password: ").is_err());
        assert_eq!(console.select("pick", &[]).unwrap(), Some(2));
        assert_eq!(console.select("pick", &[]).unwrap(), None);
    }
}

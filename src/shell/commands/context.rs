use std::future::Future;
use std::sync::Arc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use crate::config::ShellSettings;
use crate::shell::console::Console;
use crate::shell::credentials::{CredentialCache, VmKey};
use crate::shell::path::{self, Capability, Location, LookupError};
use crate::shell::progress::{self, ProgressReport, Submission, TrackOptions};
use crate::shell::session::Session;
use crate::vim::{ApiError, Connection, ManagedObjectRef};
use super::command_trait::{CommandError, CommandResult};
use super::registry::CommandRegistry;

/// A resolved inventory object together with the connection it lives on
#[derive(Clone, Debug)]
pub struct Target {
    pub location: Location,
    pub connection: Connection,
    pub obj: ManagedObjectRef,
}

impl Target {
    pub fn name(&self) -> &str {
        self.location.name()
    }

    pub fn path(&self) -> String {
        self.location.to_string()
    }

    pub fn vm_key(&self) -> VmKey {
        (self.connection.name().to_string(), self.obj.clone())
    }
}

/// State every command may read or change. Owned by the REPL loop.
pub struct CommandContext {
    pub session: Session,
    pub credentials: CredentialCache,
    pub settings: ShellSettings,
    pub console: Console,
    pub registry: Arc<CommandRegistry>,
    /// Set by `quit`
    pub should_exit: bool,
    /// Cancelled on Ctrl-C; the REPL hands out a fresh one per line
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn new(session: Session, settings: ShellSettings, console: Console, registry: Arc<CommandRegistry>) -> Self {
        Self {
            session,
            credentials: CredentialCache::new(),
            settings,
            console,
            registry,
            should_exit: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn track_options(&self) -> TrackOptions {
        TrackOptions {
            poll_interval: self.settings.poll_interval(),
            timeout: self.settings.task_timeout(),
        }
    }

    pub async fn resolve(&self, paths: &[String], capability: Capability) -> Result<Vec<Location>, CommandError> {
        Ok(path::resolve_many(&self.session, paths, capability).await?)
    }

    pub async fn resolve_single(&self, path: &str, capability: Capability) -> Result<Location, CommandError> {
        Ok(path::resolve_single(&self.session, path, capability).await?)
    }

    pub async fn resolve_parent(&self, path: &str, capability: Capability) -> Result<(Target, String), CommandError> {
        let (parent, name) = path::resolve_parent(&self.session, path, capability).await?;
        Ok((self.target_of(parent)?, name))
    }

    pub fn connection_of(&self, location: &Location) -> Result<Connection, CommandError> {
        Ok(path::connection_for(&self.session, location)?.clone())
    }

    pub fn target_of(&self, location: Location) -> Result<Target, CommandError> {
        let obj = location.entity().cloned().ok_or_else(|| LookupError::WrongType {
            path: location.to_string(),
            expected: Capability::ManagedEntity.describe(),
        })?;
        let connection = self.connection_of(&location)?;
        Ok(Target { location, connection, obj })
    }

    /// Every object named by `paths`; globs and marks may expand to many
    pub async fn targets(&self, paths: &[String], capability: Capability) -> Result<Vec<Target>, CommandError> {
        self.resolve(paths, capability).await?
            .into_iter()
            .map(|location| self.target_of(location))
            .collect()
    }

    pub async fn target(&self, path: &str, capability: Capability) -> Result<Target, CommandError> {
        let location = self.resolve_single(path, capability).await?;
        self.target_of(location)
    }

    /// Like [`Self::target`] for an optional argument
    pub async fn optional_target(&self, path: Option<&str>, capability: Capability) -> Result<Option<Target>, CommandError> {
        match path {
            Some(path) => Ok(Some(self.target(path, capability).await?)),
            None => Ok(None),
        }
    }

    /// Run `work` until it completes or the command is interrupted.
    /// On interruption `work` is dropped and the caller gets `Interrupted`,
    /// so server-side cleanup must happen after this returns.
    pub async fn interruptible<T>(&self, work: impl Future<Output = Result<T, CommandError>>) -> Result<T, CommandError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CommandError::Interrupted),
            result = work => result,
        }
    }

    /// Wait for already submitted tasks; fails when any of them failed
    pub async fn track(&self, submissions: Vec<Submission>) -> Result<ProgressReport, CommandError> {
        let options = self.track_options();
        self.interruptible(progress::track(&self.console, submissions, &options)).await?.into_result()
    }

    /// Start `method` on every target, then wait for all of them
    pub async fn run_tasks(&self, targets: &[Target], method: &str, params: Value) -> CommandResult {
        let mut submissions = Vec::with_capacity(targets.len());
        for target in targets {
            let task = target.connection.call_task(&target.obj, method, params.clone()).await;
            submissions.push(Submission::new(target.name(), target.connection.clone(), task));
        }
        Ok(self.track(submissions).await?.render())
    }

    /// Wait for a single task and hand back its result
    pub async fn wait_for_task(&self, target: &Target, task: Result<ManagedObjectRef, ApiError>) -> Result<Option<Value>, CommandError> {
        let submission = Submission::new(target.name(), target.connection.clone(), task);
        let options = self.track_options();
        let report = self.interruptible(progress::track(&self.console, vec![submission], &options)).await?;
        match report.outcomes().first().map(|o| o.result.clone()) {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(CommandError::Fault(message)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::shell::console::{Prompter, ScriptedPrompter};
    use crate::shell::commands::dispatcher::CommandDispatcher;
    use crate::vim::simulator::Simulator;

    impl CommandContext {
        /// A context connected to `sim` as `vc`, answering prompts from `prompter`
        pub fn simulated_with(sim: Arc<Simulator>, prompter: Arc<dyn Prompter>) -> Self {
            let mut session = Session::new();
            session.add_connection(Connection::new("vc", sim));
            let settings = ShellSettings {
                poll_interval_ms: 10,
                ..ShellSettings::default()
            };
            Self::new(session, settings, Console::detached(prompter), Arc::new(CommandRegistry::standard()))
        }

        pub fn simulated(sim: Arc<Simulator>) -> Self {
            Self::simulated_with(sim, Arc::new(ScriptedPrompter::default()))
        }

        /// Dispatch one command line
        pub async fn run(&mut self, line: &str) -> CommandResult {
            CommandDispatcher::new(self.registry.clone()).dispatch(line, self).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vim::simulator::Simulator;

    #[tokio::test]
    async fn test_targets_expand_globs() {
        let sim = Arc::new(Simulator::demo());
        let ctx = CommandContext::simulated(sim);
        let targets = ctx.targets(&["/vc/lab/vms/*".to_string()], Capability::VirtualMachine).await.unwrap();
        let names: Vec<&str> = targets.iter().map(Target::name).collect();
        assert_eq!(names, vec!["web01", "db01"]);
        assert_eq!(targets[0].path(), "/vc/lab/vms/web01");
    }

    #[tokio::test]
    async fn test_run_tasks_reports_each_target() {
        let sim = Arc::new(Simulator::demo());
        let ctx = CommandContext::simulated(sim);
        let targets = ctx.targets(&["/vc/lab/vms/*".to_string()], Capability::VirtualMachine).await.unwrap();
        let err = ctx.run_tasks(&targets, "PowerOnVM_Task", serde_json::json!({})).await.unwrap_err();
        // web01 is already running
        assert_eq!(err.to_string(), format!(
            "web01: error: {}\ndb01: success\n1 of 2 tasks failed",
            "The attempted operation cannot be performed in the current state (Powered on)."
        ));
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use clap::Parser;
use serde_json::{json, Value};
use crate::shell::path::{self, Capability, Location, Node};
use crate::vim::{Connection, EntityKind, ManagedObjectRef, ObjectContent};
use super::command_trait::{Command, CommandError, CommandResult, Invocation, ParsedCommand};
use super::context::CommandContext;
use super::registry::CommandRegistry;

pub fn register(registry: &mut CommandRegistry) {
    registry.register_command(Arc::new(ParsedCommand::<Help>::new("basic").alias("help")));
    registry.register_command(Arc::new(ParsedCommand::<DebugToggle>::new("basic").alias("debug")));
    registry.register_command(Arc::new(ParsedCommand::<Cd>::new("basic").alias("cd")));
    registry.register_command(Arc::new(ParsedCommand::<Ls>::new("basic").alias("ls").alias("l")));
    registry.register_command(Arc::new(ParsedCommand::<Info>::new("basic").alias("info").alias("i").alias("show").operates_on(Capability::Any)));
    registry.register_command(Arc::new(ParsedCommand::<What>::new("basic").alias("what").alias("w").operates_on(Capability::Any)));
    registry.register_command(Arc::new(ParsedCommand::<Destroy>::new("basic").alias("destroy").operates_on(Capability::ManagedEntity)));
    registry.register_command(Arc::new(ParsedCommand::<ReloadEntity>::new("basic").alias("reload_entity").operates_on(Capability::ManagedEntity)));
    registry.register_command(Arc::new(ParsedCommand::<Mv>::new("basic").alias("mv").operates_on(Capability::ManagedEntity)));
    registry.register_command(Arc::new(ParsedCommand::<Rename>::new("basic").alias("rename").operates_on(Capability::ManagedEntity)));
    registry.register_command(Arc::new(ParsedCommand::<Disconnect>::new("basic").alias("disconnect").operates_on(Capability::Connection)));
    registry.register_command(Arc::new(ParsedCommand::<Mkdir>::new("basic").alias("mkdir").operates_on(Capability::Folder)));
    registry.register_command(Arc::new(ParsedCommand::<Events>::new("basic").alias("events").operates_on(Capability::ManagedEntity)));
    registry.register_command(Arc::new(ParsedCommand::<Mark>::new("basic").alias("mark").alias("m")));
    registry.register_command(Arc::new(ParsedCommand::<Quit>::new("basic").alias("quit").alias("exit")));
}

fn help_summary(command: &dyn Command) -> String {
    let aliases = command.aliases();
    let aliases = if aliases.is_empty() { String::new() } else { format!(" ({})", aliases.join(", ")) };
    format!("{}{}: {}\n", command.qualified_name(), aliases, command.summary())
}

/// Display this text
#[derive(Parser, Debug)]
#[command(name = "help")]
struct Help {
    /// Module, command, or a path to limit commands to those applicable to it
    topic: Option<String>,
}

#[async_trait]
impl Invocation for Help {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let registry = ctx.registry.clone();
        if let Some(topic) = self.topic.as_deref() {
            if registry.has_module(topic) {
                return Ok(registry.commands()
                    .filter(|c| c.module() == topic)
                    .map(|c| help_summary(c.as_ref()))
                    .collect());
            }
            if let Some(command) = registry.get(topic) {
                return Ok(command.help());
            }
        }

        let location = match self.topic.as_deref() {
            Some(topic) => Some(ctx.resolve_single(topic, Capability::Any).await?),
            None => None,
        };

        let mut out = match &location {
            Some(location) => format!("Relevant commands for {}:\n", location.node().type_label()),
            None => "All commands:\n".to_string(),
        };
        for command in registry.commands() {
            let relevant = match &location {
                None => true,
                Some(location) => command.applies_to().is_some_and(|cap| cap.accepts(location.node())),
            };
            if relevant {
                out.push_str(&help_summary(command.as_ref()));
            }
        }
        if location.is_none() {
            out.push_str("\nTo see detailed help for a command, use its --help option.\n");
            out.push_str("To show only commands relevant to a specific object, use \"help /path/to/object\".\n");
        }
        Ok(out)
    }
}

/// Toggle management API logging to stderr
#[derive(Parser, Debug)]
#[command(name = "debug")]
struct DebugToggle {}

#[async_trait]
impl Invocation for DebugToggle {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let enabled = ctx.session.toggle_debug();
        Ok(format!("debug mode {}abled\n", if enabled { "en" } else { "dis" }))
    }
}

/// Change directory
#[derive(Parser, Debug)]
#[command(name = "cd")]
struct Cd {
    /// Directory to change to
    #[arg(default_value = "/")]
    path: String,
}

#[async_trait]
impl Invocation for Cd {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let location = ctx.resolve_single(&self.path, Capability::Any).await?;
        ctx.session.set_cwd(location);
        Ok(String::new())
    }
}

/// Properties fetched by `ls` for each kind, on top of `name` and `overallStatus`
fn ls_properties(kind: &EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::VirtualMachine => &["runtime.powerState"],
        EntityKind::HostSystem => &["runtime.connectionState", "runtime.inMaintenanceMode"],
        EntityKind::Datastore => &["summary.capacity", "summary.freeSpace"],
        _ => &[],
    }
}

fn gigabytes(content: &ObjectContent, name: &str) -> f64 {
    content.get(name).and_then(Value::as_f64).unwrap_or(0.0) / (1024.0 * 1024.0 * 1024.0)
}

fn ls_text(kind: &EntityKind, content: &ObjectContent) -> String {
    match kind {
        EntityKind::Folder | EntityKind::Datacenter | EntityKind::ComputeResource
        | EntityKind::ClusterComputeResource | EntityKind::ResourcePool | EntityKind::VirtualApp => "/".to_string(),
        EntityKind::VirtualMachine => format!(": {}", content.get_str("runtime.powerState").unwrap_or("unknown")),
        EntityKind::HostSystem => {
            let maintenance = content.get("runtime.inMaintenanceMode").and_then(Value::as_bool).unwrap_or(false);
            format!(" (host): {}{}", content.get_str("runtime.connectionState").unwrap_or("unknown"), if maintenance { ", maintenance mode" } else { "" })
        }
        EntityKind::Datastore => format!(
            " (datastore): {:.1}GB free of {:.1}GB",
            gigabytes(content, "summary.freeSpace"),
            gigabytes(content, "summary.capacity")
        ),
        EntityKind::Network | EntityKind::DistributedVirtualPortgroup => " (network)".to_string(),
        EntityKind::Other => String::new(),
    }
}

/// List objects in a directory
#[derive(Parser, Debug)]
#[command(name = "ls")]
struct Ls {
    /// Directory to list
    #[arg(default_value = ".")]
    path: String,
}

#[async_trait]
impl Invocation for Ls {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let dir = ctx.resolve_single(&self.path, Capability::Any).await?;
        let children = path::children(&ctx.session, &dir).await?;
        let (entities, synthetic): (Vec<_>, Vec<_>) = children.into_iter().partition(|(_, node)| node.entity().is_some());

        let mut out = String::new();
        let mut listed = Vec::new();
        for (name, node) in synthetic {
            out.push_str(&format!("{} {}/\n", listed.len(), name));
            listed.push(dir.child(name, node));
        }

        if !entities.is_empty() {
            let conn = ctx.connection_of(&dir)?;
            let contents = fetch_ls_properties(&conn, &entities).await?;
            for (name, node) in entities {
                let Some(obj) = node.entity() else { continue };
                let Some(content) = contents.iter().find(|c| &c.obj == obj) else {
                    out.push_str(&format!("{} {} (error)\n", listed.len(), name));
                    listed.push(dir.child(name, node));
                    continue;
                };
                let real_name = content.get_str("name").filter(|real| *real != name);
                out.push_str(&format!(
                    "{} {}{}{}\n",
                    listed.len(),
                    name,
                    real_name.map(|real| format!(" [{}]", real)).unwrap_or_default(),
                    ls_text(&obj.entity_kind(), content)
                ));
                listed.push(dir.child(name, node));
            }
        }

        ctx.session.set_numeric_marks(listed);
        Ok(out)
    }
}

/// One retrieve per entity kind, so every kind only asks for properties it has
async fn fetch_ls_properties(conn: &Connection, entities: &[(String, Node)]) -> Result<Vec<ObjectContent>, CommandError> {
    let mut by_kind: HashMap<String, Vec<ManagedObjectRef>> = HashMap::new();
    for obj in entities.iter().filter_map(|(_, node)| node.entity()) {
        by_kind.entry(obj.kind.clone()).or_default().push(obj.clone());
    }
    let mut contents = Vec::new();
    for (kind, objs) in by_kind {
        let mut paths = vec!["name", "overallStatus"];
        paths.extend_from_slice(ls_properties(&EntityKind::from_type_name(&kind)));
        contents.extend(conn.retrieve(&objs, &paths).await?);
    }
    Ok(contents)
}

/// Display information about an object
#[derive(Parser, Debug)]
#[command(name = "info")]
struct Info {
    path: String,
}

#[async_trait]
impl Invocation for Info {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let location = ctx.resolve_single(&self.path, Capability::Any).await?;
        let mut out = format!("path: {}\n", location);
        match location.node() {
            Node::Connection(name) => {
                out.push_str("class: Connection\n");
                if let Some(about) = ctx.session.connection(name).and_then(|c| c.content().about.clone()) {
                    out.push_str(&format!("product: {}\napi version: {}\n", about.full_name, about.api_version));
                }
            }
            Node::Entity(obj) => {
                out.push_str(&format!("class: {}\n", obj.kind));
                let conn = ctx.connection_of(&location)?;
                out.push_str(&display_info(&conn, obj).await?);
            }
            Node::DatastoreFile { .. } => {
                out.push_str("class: DatastoreFile\n");
                if let Some(path) = location.datastore_path() {
                    out.push_str(&format!("datastore path: {}\n", path));
                }
            }
            node => out.push_str(&format!("class: {}\n", node.type_label())),
        }
        Ok(out)
    }
}

async fn display_info(conn: &Connection, obj: &ManagedObjectRef) -> Result<String, CommandError> {
    let fields: &[(&str, &str)] = match obj.entity_kind() {
        EntityKind::VirtualMachine => &[
            ("name", "name"),
            ("power state", "runtime.powerState"),
            ("cpus", "config.hardware.numCPU"),
            ("memory", "config.hardware.memoryMB"),
            ("ip", "summary.guest.ipAddress"),
            ("vmx", "summary.config.vmPathName"),
            ("annotation", "config.annotation"),
        ],
        EntityKind::HostSystem => &[
            ("name", "name"),
            ("connection state", "runtime.connectionState"),
            ("power state", "runtime.powerState"),
            ("maintenance mode", "runtime.inMaintenanceMode"),
            ("cpu cores", "summary.hardware.numCpuCores"),
            ("memory", "summary.hardware.memorySize"),
        ],
        EntityKind::Datastore => &[
            ("name", "name"),
            ("capacity", "summary.capacity"),
            ("free space", "summary.freeSpace"),
            ("accessible", "summary.accessible"),
        ],
        _ => &[("name", "name"), ("status", "overallStatus")],
    };

    let mut out = String::new();
    for (label, property) in fields {
        let text = match conn.get(obj, property).await? {
            Value::Null => continue,
            Value::String(s) if s.is_empty() => continue,
            Value::String(s) => s,
            other => other.to_string(),
        };
        let text = match *label {
            "memory" if obj.entity_kind() == EntityKind::VirtualMachine => format!("{}MB", text),
            _ => text,
        };
        out.push_str(&format!("{}: {}\n", label, text));
    }
    Ok(out)
}

/// Basic information about the given objects
#[derive(Parser, Debug)]
#[command(name = "what")]
struct What {
    #[arg(default_value = ".")]
    paths: Vec<String>,
}

#[async_trait]
impl Invocation for What {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        Ok(ctx.resolve(&self.paths, Capability::Any).await?
            .iter()
            .map(|location| format!("{}: {}\n", location, location.node().type_label()))
            .collect())
    }
}

/// Destroy managed entities
#[derive(Parser, Debug)]
#[command(name = "destroy")]
struct Destroy {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[async_trait]
impl Invocation for Destroy {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let targets = ctx.targets(&self.paths, Capability::ManagedEntity).await?;
        ctx.run_tasks(&targets, "Destroy_Task", json!({})).await
    }
}

/// Synchronize management server state
#[derive(Parser, Debug)]
#[command(name = "reload_entity")]
struct ReloadEntity {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[async_trait]
impl Invocation for ReloadEntity {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        for target in ctx.targets(&self.paths, Capability::ManagedEntity).await? {
            target.connection.call(&target.obj, "Reload", json!({})).await?;
        }
        Ok(String::new())
    }
}

/// Move entities to another folder
///
/// The entities' names are unchanged. The last argument is the destination.
#[derive(Parser, Debug)]
#[command(name = "mv")]
struct Mv {
    /// Entities to move, followed by the destination folder
    #[arg(required = true)]
    paths: Vec<String>,
}

#[async_trait]
impl Invocation for Mv {
    async fn run(mut self, ctx: &mut CommandContext) -> CommandResult {
        if self.paths.len() < 2 {
            return Err(CommandError::InvalidArguments("Destination entity missing".to_string()));
        }
        let destination = self.paths.pop().unwrap_or_default();
        let destination = ctx.target(&destination, Capability::Folder).await?;
        let objs: Vec<ManagedObjectRef> = ctx.targets(&self.paths, Capability::ManagedEntity).await?
            .into_iter()
            .map(|t| t.obj)
            .collect();
        let task = destination.connection.call_task(&destination.obj, "MoveIntoFolder_Task", json!({"list": objs})).await;
        ctx.wait_for_task(&destination, task).await?;
        Ok(String::new())
    }
}

/// Rename an entity
#[derive(Parser, Debug)]
#[command(name = "rename")]
struct Rename {
    /// Entity to rename
    path: String,
    /// New name
    name: String,
}

#[async_trait]
impl Invocation for Rename {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let target = ctx.target(&self.path, Capability::ManagedEntity).await?;
        let task = target.connection.call_task(&target.obj, "Rename_Task", json!({"newName": self.name})).await;
        ctx.wait_for_task(&target, task).await?;
        Ok(String::new())
    }
}

/// Disconnect from a server
#[derive(Parser, Debug)]
#[command(name = "disconnect")]
struct Disconnect {
    /// Connection name or path
    connection: String,
}

#[async_trait]
impl Invocation for Disconnect {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let name = if ctx.session.connection(&self.connection).is_some() {
            self.connection
        } else {
            let location = ctx.resolve_single(&self.connection, Capability::Connection).await?;
            location.name().to_string()
        };
        ctx.session.remove_connection(&name);
        log::info!("disconnected from {}", name);
        Ok(String::new())
    }
}

/// Create a folder
#[derive(Parser, Debug)]
#[command(name = "mkdir")]
struct Mkdir {
    /// Folder to create
    path: String,
}

#[async_trait]
impl Invocation for Mkdir {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let (parent, name) = ctx.resolve_parent(&self.path, Capability::Folder).await?;
        parent.connection.call(&parent.obj, "CreateFolder", json!({"name": name})).await?;
        Ok(String::new())
    }
}

/// Show recent events
#[derive(Parser, Debug)]
#[command(name = "events")]
struct Events {
    #[arg(default_value = ".")]
    path: String,
    /// Output the last N events
    #[arg(short = 'n', long = "lines", default_value_t = 10)]
    lines: u32,
}

#[async_trait]
impl Invocation for Events {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let location = ctx.resolve_single(&self.path, Capability::Any).await?;
        let conn = ctx.connection_of(&location)
            .map_err(|_| CommandError::InvalidArguments("'events' not supported at this level".to_string()))?;
        let entity = match location.node() {
            Node::Entity(obj) => obj.clone(),
            Node::Connection(_) => conn.root_folder().clone(),
            _ => return Err(CommandError::InvalidArguments("'events' not supported at this level".to_string())),
        };
        let manager = conn.content().event_manager.clone()
            .ok_or_else(|| CommandError::Execution("server has no event manager".to_string()))?;

        let categories: HashMap<String, String> = match conn.get(&manager, "description.eventInfo").await? {
            Value::Array(infos) => infos.iter()
                .filter_map(|info| Some((info.get("key")?.as_str()?.to_string(), info.get("category")?.as_str()?.to_string())))
                .collect(),
            _ => HashMap::new(),
        };

        let filter = json!({
            "_typeName": "EventFilterSpec",
            "entity": {"_typeName": "EventFilterSpecByEntity", "entity": entity, "recursion": "all"},
        });
        let collector: ManagedObjectRef = serde_json::from_value(
            conn.call(&manager, "CreateCollectorForEvents", json!({"filter": filter})).await?
        ).map_err(|e| CommandError::Fault(e.to_string()))?;

        let page = ctx.interruptible(read_latest_page(&conn, &collector, self.lines)).await;
        if let Err(e) = conn.call(&collector, "DestroyCollector", json!({})).await {
            log::warn!("failed to destroy event collector {}: {}", collector, e);
        }

        let mut out = String::new();
        for event in page?.iter().rev() {
            let time = event.get("createdTime").and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Local).format("%m/%d/%Y %I:%M %p").to_string())
                .unwrap_or_default();
            let category = crate::vim::type_name_of(event)
                .and_then(|kind| categories.get(kind))
                .map(String::as_str)
                .unwrap_or("unknown");
            let message = event.get("fullFormattedMessage").and_then(Value::as_str).unwrap_or("").trim();
            out.push_str(&format!("[{}] [{}] {}\n", time, category, message));
        }
        Ok(out)
    }
}

async fn read_latest_page(conn: &Connection, collector: &ManagedObjectRef, lines: u32) -> Result<Vec<Value>, CommandError> {
    conn.call(collector, "SetCollectorPageSize", json!({"maxCount": lines})).await?;
    match conn.get(collector, "latestPage").await? {
        Value::Array(events) => Ok(events),
        _ => Ok(Vec::new()),
    }
}

/// Save a set of objects as a named mark
///
/// Without paths the mark is removed. Without arguments every mark is listed.
#[derive(Parser, Debug)]
#[command(name = "mark")]
struct Mark {
    name: Option<String>,
    paths: Vec<String>,
}

#[async_trait]
impl Invocation for Mark {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let Some(name) = self.name else {
            let mut marks: Vec<(&String, &Vec<Location>)> = ctx.session.user_marks().collect();
            marks.sort_by(|a, b| a.0.cmp(b.0));
            return Ok(marks.into_iter()
                .map(|(name, locations)| {
                    let paths: Vec<String> = locations.iter().map(Location::to_string).collect();
                    format!("{}: {}\n", name, paths.join(" "))
                })
                .collect());
        };
        if name.is_empty() || name == "@" || name.chars().all(|c| c.is_ascii_digit()) {
            return Err(CommandError::InvalidArguments(format!("mark name {:?} is reserved", name)));
        }
        let locations = ctx.resolve(&self.paths, Capability::Any).await?;
        ctx.session.set_mark(&name, locations);
        Ok(String::new())
    }
}

/// Exit the shell
#[derive(Parser, Debug)]
#[command(name = "quit")]
struct Quit {}

#[async_trait]
impl Invocation for Quit {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        ctx.should_exit = true;
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::vim::simulator::Simulator;
    use super::*;

    fn demo() -> (Arc<Simulator>, CommandContext) {
        let sim = Arc::new(Simulator::demo());
        let ctx = CommandContext::simulated(sim.clone());
        (sim, ctx)
    }

    async fn vm(ctx: &CommandContext, name: &str) -> ManagedObjectRef {
        ctx.target(&format!("/vc/lab/vms/{}", name), Capability::VirtualMachine).await.unwrap().obj
    }

    #[tokio::test]
    async fn test_ls_lists_and_sets_numeric_marks() {
        let (_sim, mut ctx) = demo();
        let output = ctx.run("ls /vc/lab/vms").await.unwrap();
        assert_eq!(output, "0 web01: poweredOn\n1 db01: poweredOff\n");

        let output = ctx.run("what 1").await.unwrap();
        assert_eq!(output, "/vc/lab/vms/db01: VirtualMachine\n");

        let output = ctx.run("l /vc/lab").await.unwrap();
        assert!(output.starts_with("0 vms [vm]/\n1 computers [host]/\n"));
    }

    #[tokio::test]
    async fn test_ls_groups_come_first() {
        let (_sim, mut ctx) = demo();
        let output = ctx.run("ls /vc/lab/computers/cluster1").await.unwrap();
        assert_eq!(output, "0 hosts/\n1 resourcePool [Resources]/\n");
        let output = ctx.run("ls 0").await.unwrap();
        assert_eq!(output, "0 esx1.lab (host): connected\n1 esx2.lab (host): connected\n");
    }

    #[tokio::test]
    async fn test_cd_and_relative_paths() {
        let (_sim, mut ctx) = demo();
        ctx.run("cd /vc/lab/vms").await.unwrap();
        assert_eq!(ctx.session.prompt(), "/vc/lab/vms> ");
        let output = ctx.run("what web01 ~/datastores").await.unwrap();
        assert_eq!(output, "/vc/lab/vms/web01: VirtualMachine\n/vc/lab/datastores: Folder\n");
        assert!(matches!(ctx.run("cd nowhere").await, Err(CommandError::Lookup(_))));
    }

    #[tokio::test]
    async fn test_info_vm() {
        let (_sim, mut ctx) = demo();
        let output = ctx.run("info /vc/lab/vms/web01").await.unwrap();
        assert!(output.starts_with("path: /vc/lab/vms/web01\nclass: VirtualMachine\nname: web01\npower state: poweredOn\n"));
        assert!(output.contains("memory: 512MB\n"));
        assert!(output.contains("ip: 10.0.0.11\n"));
    }

    #[tokio::test]
    async fn test_show_is_info() {
        let (_sim, mut ctx) = demo();
        let info = ctx.run("info /vc/lab/vms/web01").await.unwrap();
        assert_eq!(ctx.run("show /vc/lab/vms/web01").await.unwrap(), info);
        assert_eq!(ctx.run("basic.show /vc/lab/vms/web01").await.unwrap(), info);
    }

    #[tokio::test]
    async fn test_mkdir_rename_and_destroy() {
        let (sim, mut ctx) = demo();
        ctx.run("mkdir /vc/lab/vms/staging").await.unwrap();
        ctx.run("rename /vc/lab/vms/staging archive").await.unwrap();
        let output = ctx.run("ls /vc/lab/vms").await.unwrap();
        assert!(output.contains("2 archive/\n"));

        let db = vm(&ctx, "db01").await;
        let output = ctx.run("destroy /vc/lab/vms/db01 /vc/lab/vms/archive").await.unwrap();
        assert_eq!(output, "db01: success\narchive: success\n");
        assert!(!sim.exists(&db));
    }

    #[tokio::test]
    async fn test_mv_needs_destination() {
        let (sim, mut ctx) = demo();
        let err = ctx.run("mv /vc/lab/vms/web01").await.unwrap_err();
        assert_eq!(err.to_string(), "Destination entity missing");

        ctx.run("mkdir /vc/lab/vms/prod").await.unwrap();
        ctx.run("mv /vc/lab/vms/web01 /vc/lab/vms/db01 /vc/lab/vms/prod").await.unwrap();
        let output = ctx.run("ls /vc/lab/vms/prod").await.unwrap();
        assert_eq!(output, "0 web01: poweredOn\n1 db01: poweredOff\n");
        assert_eq!(sim.calls_to("MoveIntoFolder_Task").len(), 1);
    }

    #[tokio::test]
    async fn test_events_prints_oldest_first_and_releases_collector() {
        let (sim, mut ctx) = demo();
        let web = vm(&ctx, "web01").await;
        sim.add_event(&web, "VmPoweredOffEvent", "2026-01-02T10:00:00Z", "web01 is powered off");
        sim.add_event(&web, "VmFailedToPowerOnEvent", "2026-01-02T11:00:00Z", "web01 cannot power on ");
        sim.add_event(&web, "VmPoweredOnEvent", "2026-01-02T12:00:00Z", "web01 is powered on");

        let output = ctx.run("events -n 2 /vc/lab/vms/web01").await.unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] [error] web01 cannot power on"));
        assert!(lines[1].ends_with("] [info] web01 is powered on"));
        assert!(lines[0].starts_with("[01/0"));
        assert_eq!(sim.calls_to("DestroyCollector").len(), 1);
    }

    #[tokio::test]
    async fn test_events_interrupted_still_releases_collector() {
        let (sim, mut ctx) = demo();
        ctx.cancel.cancel();
        let err = ctx.run("events /vc/lab/vms/web01").await.unwrap_err();
        assert!(matches!(err, CommandError::Interrupted));
        assert_eq!(sim.calls_to("DestroyCollector").len(), 1);
    }

    #[tokio::test]
    async fn test_events_on_connection_covers_everything() {
        let (sim, mut ctx) = demo();
        let web = vm(&ctx, "web01").await;
        let db = vm(&ctx, "db01").await;
        sim.add_event(&web, "VmPoweredOnEvent", "2026-01-02T12:00:00Z", "web01 is powered on");
        sim.add_event(&db, "AlarmStatusChangedEvent", "2026-01-02T12:30:00Z", "alarm on db01");
        let output = ctx.run("events /vc").await.unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.contains("[warning] alarm on db01"));
        let collector = sim.calls_to("DestroyCollector")[0].obj.clone();
        assert_eq!(collector.kind, "EventHistoryCollector");
        assert!(!sim.exists(&collector));
    }

    #[tokio::test]
    async fn test_help_listings() {
        let (_sim, mut ctx) = demo();
        let output = ctx.run("help").await.unwrap();
        assert!(output.starts_with("All commands:\nbasic.help (help): Display this text\n"));
        assert!(output.contains("basic.ls (ls, l): List objects in a directory\n"));
        assert!(output.contains("To see detailed help for a command, use its --help option."));

        let output = ctx.run("help /vc/lab/vms/web01").await.unwrap();
        assert!(output.starts_with("Relevant commands for VirtualMachine:\n"));
        assert!(output.contains("vm.on (on): "));
        assert!(!output.contains("host.reboot"));

        let output = ctx.run("help host").await.unwrap();
        assert!(output.lines().all(|line| line.starts_with("host.")));

        let output = ctx.run("help ls").await.unwrap();
        assert!(output.contains("Usage: basic.ls"));
    }

    #[tokio::test]
    async fn test_marks() {
        let (_sim, mut ctx) = demo();
        ctx.run("mark web /vc/lab/vms/web*").await.unwrap();
        ctx.run("m all /vc/lab/vms/*").await.unwrap();
        let output = ctx.run("mark").await.unwrap();
        assert_eq!(output, "all: /vc/lab/vms/web01 /vc/lab/vms/db01\nweb: /vc/lab/vms/web01\n");
        assert_eq!(ctx.run("what ~all").await.unwrap().lines().count(), 2);

        ctx.run("mark web").await.unwrap();
        assert!(ctx.run("what ~web").await.is_err());
        assert!(ctx.run("mark 3 /vc").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_and_quit() {
        let (_sim, mut ctx) = demo();
        ctx.run("cd /vc/lab").await.unwrap();
        ctx.run("disconnect vc").await.unwrap();
        assert!(ctx.session.connection("vc").is_none());
        assert!(ctx.session.cwd().is_root());

        ctx.run("exit").await.unwrap();
        assert!(ctx.should_exit);
    }

    #[tokio::test]
    async fn test_debug_toggles() {
        let (_sim, mut ctx) = demo();
        assert_eq!(ctx.run("debug").await.unwrap(), "debug mode enabled\n");
        assert_eq!(ctx.run("debug").await.unwrap(), "debug mode disabled\n");
    }
}

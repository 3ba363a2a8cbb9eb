//! Inventory paths.
//!
//! A path such as `/vc1/lab/vms/web01` is resolved one segment at a time
//! against the live inventory. Every resolved object is kept as a
//! [`Location`]: the whole chain from `/` down to the object, which is what
//! makes `..` and printable paths work no matter how the object was reached
//! (absolute path, mark, or numeric index from `ls`).
//!
//! Prefixes handled before name lookup:
//! - `/` the root, whose children are the open connections
//! - `~` the datacenter of the current directory, `~name` a user mark
//! - `@` / `~@` the connection of the current directory
//! - a bare number, the n-th entry of the last `ls`
//!
//! A segment containing `*` matches every child whose name fits the glob.

use std::fmt;
use regex::Regex;
use serde_json::Value;
use crate::vim::{ApiError, Connection, EntityKind, ManagedObjectRef};
use super::session::Session;

/// Synthetic child listings that have no object of their own on the server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Hosts,
    Vms,
    Datastores,
    Pools,
}

impl GroupKind {
    /// Property on the owner holding the members
    fn property(self) -> &'static str {
        match self {
            GroupKind::Hosts => "host",
            GroupKind::Vms => "vm",
            GroupKind::Datastores => "datastore",
            GroupKind::Pools => "resourcePool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Root,
    Connection(String),
    Entity(ManagedObjectRef),
    Group { owner: ManagedObjectRef, kind: GroupKind },
    DatastoreFile { datastore: ManagedObjectRef, path: String },
}

impl Node {
    pub fn entity(&self) -> Option<&ManagedObjectRef> {
        match self {
            Node::Entity(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        self.entity().map(ManagedObjectRef::entity_kind)
    }

    /// Name shown by `what`
    pub fn type_label(&self) -> String {
        match self {
            Node::Root => "Root".to_string(),
            Node::Connection(_) => "Connection".to_string(),
            Node::Entity(obj) => obj.kind.clone(),
            Node::Group { .. } => "Group".to_string(),
            Node::DatastoreFile { .. } => "DatastoreFile".to_string(),
        }
    }
}

/// What a command argument has to point at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Any,
    Connection,
    ManagedEntity,
    Folder,
    ComputeResource,
    HostSystem,
    ResourcePool,
    VirtualMachine,
    Datastore,
    DatastoreFile,
}

impl Capability {
    pub fn accepts(self, node: &Node) -> bool {
        let kind = node.entity_kind();
        match self {
            Capability::Any => true,
            Capability::Connection => matches!(node, Node::Connection(_)),
            Capability::ManagedEntity => kind.is_some_and(|k| k.is_managed_entity()),
            Capability::Folder => kind == Some(EntityKind::Folder),
            Capability::ComputeResource => kind.is_some_and(|k| k.is_compute_resource()),
            Capability::HostSystem => kind == Some(EntityKind::HostSystem),
            Capability::ResourcePool => kind.is_some_and(|k| k.is_resource_pool()),
            Capability::VirtualMachine => kind == Some(EntityKind::VirtualMachine),
            Capability::Datastore => kind == Some(EntityKind::Datastore),
            Capability::DatastoreFile => matches!(node, Node::DatastoreFile { .. }),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Capability::Any => "object",
            Capability::Connection => "connection",
            Capability::ManagedEntity => "managed entity",
            Capability::Folder => "Folder",
            Capability::ComputeResource => "ComputeResource",
            Capability::HostSystem => "HostSystem",
            Capability::ResourcePool => "ResourcePool",
            Capability::VirtualMachine => "VirtualMachine",
            Capability::Datastore => "Datastore",
            Capability::DatastoreFile => "datastore file",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("path {path} is ambiguous ({count} matches)")]
    Ambiguous { path: String, count: usize },
    #[error("{path} is not a {expected}")]
    WrongType { path: String, expected: &'static str },
    #[error("not connected: {0}")]
    NoConnection(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A node together with the chain of names that led to it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    chain: Vec<(String, Node)>,
}

impl Default for Location {
    fn default() -> Self {
        Self::root()
    }
}

impl Location {
    pub fn root() -> Self {
        Self {
            chain: vec![(String::new(), Node::Root)],
        }
    }

    pub fn child(&self, name: impl Into<String>, node: Node) -> Self {
        let mut chain = self.chain.clone();
        chain.push((name.into(), node));
        Self { chain }
    }

    /// Parent location; the root is its own parent
    pub fn parent(&self) -> Self {
        let mut chain = self.chain.clone();
        if chain.len() > 1 {
            chain.pop();
        }
        Self { chain }
    }

    pub fn node(&self) -> &Node {
        &self.chain[self.chain.len() - 1].1
    }

    pub fn name(&self) -> &str {
        &self.chain[self.chain.len() - 1].0
    }

    pub fn is_root(&self) -> bool {
        self.chain.len() == 1
    }

    pub fn entity(&self) -> Option<&ManagedObjectRef> {
        self.node().entity()
    }

    /// Name of the connection this location lives under
    pub fn connection_name(&self) -> Option<&str> {
        match self.chain.get(1) {
            Some((name, Node::Connection(_))) => Some(name),
            _ => None,
        }
    }

    /// Closest ancestor (or self) holding an entity of `kind`
    pub fn ancestor_of_kind(&self, kind: &EntityKind) -> Option<Location> {
        (1..=self.chain.len()).rev()
            .find(|&len| self.chain[len - 1].1.entity_kind().as_ref() == Some(kind))
            .map(|len| Location { chain: self.chain[..len].to_vec() })
    }

    /// Location of the connection node
    pub fn connection_location(&self) -> Option<Location> {
        self.connection_name()?;
        Some(Location { chain: self.chain[..2].to_vec() })
    }

    /// `[datastore] path` form used by the API for datastore files
    pub fn datastore_path(&self) -> Option<String> {
        let Node::DatastoreFile { path, .. } = self.node() else {
            return None;
        };
        let ds_index = self.chain.iter().rposition(|(_, node)| node.entity_kind() == Some(EntityKind::Datastore))?;
        Some(format!("[{}] {}", self.chain[ds_index].0, path))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for (name, _) in &self.chain[1..] {
            write!(f, "/{}", name)?;
        }
        Ok(())
    }
}

/// Collapse `.` and `..` and duplicate slashes in a path string
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut resolved: Vec<&str> = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match segment {
            "." => {}
            ".." if resolved.last().is_some_and(|last| *last != "..") => {
                resolved.pop();
            }
            ".." if absolute => {}
            _ => resolved.push(segment),
        }
    }
    let joined = resolved.join("/");
    if absolute { format!("/{}", joined) } else if joined.is_empty() { ".".to_string() } else { joined }
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).ok()
}

pub fn connection_for<'a>(session: &'a Session, location: &Location) -> Result<&'a Connection, LookupError> {
    let name = location.connection_name().ok_or_else(|| LookupError::NoConnection(location.to_string()))?;
    session.connection(name).ok_or_else(|| LookupError::NoConnection(name.to_string()))
}

async fn named_entities(conn: &Connection, refs: Vec<ManagedObjectRef>) -> Result<Vec<(String, Node)>, LookupError> {
    let contents = conn.retrieve(&refs, &["name"]).await?;
    Ok(refs.into_iter().map(|obj| {
        let name = contents.iter()
            .find(|c| c.obj == obj)
            .and_then(|c| c.get_str("name"))
            .unwrap_or(&obj.value)
            .to_string();
        (name, Node::Entity(obj))
    }).collect())
}

/// Children of a location, in server order
pub async fn children(session: &Session, location: &Location) -> Result<Vec<(String, Node)>, LookupError> {
    let conn = match location.node() {
        Node::Root => {
            return Ok(session.connections().map(|c| (c.name().to_string(), Node::Connection(c.name().to_string()))).collect());
        }
        _ => connection_for(session, location)?,
    };

    match location.node() {
        Node::Root => Ok(Vec::new()),
        Node::Connection(_) => {
            let refs = conn.get_refs(conn.root_folder(), "childEntity").await?;
            named_entities(conn, refs).await
        }
        Node::Group { owner, kind } => {
            let refs = match conn.get(owner, kind.property()).await? {
                Value::Null => Vec::new(),
                // a compute resource has exactly one root pool
                value @ Value::Object(_) => vec![serde_json::from_value(value).map_err(ApiError::from)?],
                value => serde_json::from_value(value).map_err(ApiError::from)?,
            };
            named_entities(conn, refs).await
        }
        Node::DatastoreFile { .. } => Ok(Vec::new()),
        Node::Entity(obj) => match obj.entity_kind() {
            EntityKind::Folder => {
                let refs = conn.get_refs(obj, "childEntity").await?;
                named_entities(conn, refs).await
            }
            EntityKind::Datacenter => {
                let mut out = Vec::new();
                for (label, prop) in [("vms", "vmFolder"), ("computers", "hostFolder"), ("datastores", "datastoreFolder"), ("networks", "networkFolder")] {
                    if let Ok(folder) = serde_json::from_value::<ManagedObjectRef>(conn.get(obj, prop).await?) {
                        out.push((label.to_string(), Node::Entity(folder)));
                    }
                }
                Ok(out)
            }
            EntityKind::ComputeResource | EntityKind::ClusterComputeResource => {
                let mut out = vec![("hosts".to_string(), Node::Group { owner: obj.clone(), kind: GroupKind::Hosts })];
                if let Ok(pool) = serde_json::from_value::<ManagedObjectRef>(conn.get(obj, "resourcePool").await?) {
                    out.push(("resourcePool".to_string(), Node::Entity(pool)));
                }
                Ok(out)
            }
            EntityKind::HostSystem => Ok(vec![
                ("vms".to_string(), Node::Group { owner: obj.clone(), kind: GroupKind::Vms }),
                ("datastores".to_string(), Node::Group { owner: obj.clone(), kind: GroupKind::Datastores }),
            ]),
            EntityKind::ResourcePool | EntityKind::VirtualApp => Ok(vec![
                ("pools".to_string(), Node::Group { owner: obj.clone(), kind: GroupKind::Pools }),
                ("vms".to_string(), Node::Group { owner: obj.clone(), kind: GroupKind::Vms }),
            ]),
            _ => Ok(Vec::new()),
        },
    }
}

/// Resolve one plain (non-glob) name below `location`
async fn child_named(session: &Session, location: &Location, name: &str) -> Result<Option<Location>, LookupError> {
    // Datastore contents are addressed without asking the server
    match location.node() {
        Node::Entity(obj) if obj.entity_kind() == EntityKind::Datastore => {
            return Ok(Some(location.child(name, Node::DatastoreFile { datastore: obj.clone(), path: name.to_string() })));
        }
        Node::DatastoreFile { datastore, path } => {
            let path = format!("{}/{}", path, name);
            return Ok(Some(location.child(name, Node::DatastoreFile { datastore: datastore.clone(), path })));
        }
        _ => {}
    }

    Ok(children(session, location).await?
        .into_iter()
        .find(|(child, _)| child == name)
        .map(|(child, node)| location.child(child, node)))
}

/// Resolve a path to every location it names
pub async fn resolve(session: &Session, path: &str) -> Result<Vec<Location>, LookupError> {
    let (mut current, rest) = starting_points(session, path)?;

    let rest = normalize(rest);
    for segment in rest.split('/').filter(|s| !s.is_empty() && *s != ".") {
        let mut next = Vec::new();
        for location in &current {
            match segment {
                ".." => next.push(location.parent()),
                glob if glob.contains('*') => {
                    let re = glob_regex(glob).ok_or_else(|| LookupError::NotFound(path.to_string()))?;
                    for (name, node) in children(session, location).await? {
                        if re.is_match(&name) {
                            next.push(location.child(name, node));
                        }
                    }
                }
                name => match child_named(session, location, name).await? {
                    Some(found) => next.push(found),
                    None => return Err(LookupError::NotFound(path.to_string())),
                },
            }
        }
        if next.is_empty() {
            return Err(LookupError::NotFound(path.to_string()));
        }
        current = next;
    }

    Ok(current)
}

/// Split off the prefix of `path` and return the locations it starts from
fn starting_points<'p>(session: &Session, path: &'p str) -> Result<(Vec<Location>, &'p str), LookupError> {
    if let Some(rest) = path.strip_prefix('/') {
        return Ok((vec![Location::root()], rest));
    }

    let (first, rest) = path.split_once('/').unwrap_or((path, ""));
    let mark = match first {
        "@" | "~@" => Some("@"),
        "~" => Some(""),
        m if m.starts_with('~') => Some(&m[1..]),
        n if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) && session.mark(n).is_some() => Some(n),
        _ => None,
    };

    match mark {
        Some(name) => {
            let locations = session.mark(name).cloned().unwrap_or_default();
            if locations.is_empty() {
                return Err(LookupError::NotFound(path.to_string()));
            }
            Ok((locations, rest))
        }
        None => Ok((vec![session.cwd().clone()], path)),
    }
}

/// Resolve and require every result to satisfy `capability`
pub async fn resolve_as(session: &Session, path: &str, capability: Capability) -> Result<Vec<Location>, LookupError> {
    let locations = resolve(session, path).await?;
    if let Some(bad) = locations.iter().find(|l| !capability.accepts(l.node())) {
        return Err(LookupError::WrongType { path: bad.to_string(), expected: capability.describe() });
    }
    Ok(locations)
}

/// Exactly one match
pub async fn resolve_single(session: &Session, path: &str, capability: Capability) -> Result<Location, LookupError> {
    let mut locations = resolve_as(session, path, capability).await?;
    match locations.len() {
        1 => Ok(locations.remove(0)),
        0 => Err(LookupError::NotFound(path.to_string())),
        count => Err(LookupError::Ambiguous { path: path.to_string(), count }),
    }
}

/// Every path in turn, concatenated
pub async fn resolve_many(session: &Session, paths: &[String], capability: Capability) -> Result<Vec<Location>, LookupError> {
    let mut out = Vec::new();
    for path in paths {
        out.extend(resolve_as(session, path, capability).await?);
    }
    Ok(out)
}

/// Parent of a not yet existing object, plus the new object's name
pub async fn resolve_parent(session: &Session, path: &str, capability: Capability) -> Result<(Location, String), LookupError> {
    let trimmed = path.trim_end_matches('/');
    let (parent, base) = match trimmed.rsplit_once('/') {
        Some(("", base)) => ("/", base),
        Some((parent, base)) => (parent, base),
        None => (".", trimmed),
    };
    if base.is_empty() || base == "." || base == ".." {
        return Err(LookupError::NotFound(path.to_string()));
    }
    let parent = resolve_single(session, parent, capability).await?;
    Ok((parent, base.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::vim::simulator::Simulator;

    fn session_with(sim: Arc<Simulator>) -> Session {
        let mut session = Session::new();
        session.add_connection(Connection::new("vc", sim));
        session
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../../"), "/");
        assert_eq!(normalize("a//b/"), "a/b");
        assert_eq!(normalize("../x"), "../x");
        assert_eq!(normalize("a/.."), ".");
    }

    #[test]
    fn test_location_display_and_parent() {
        let dc = ManagedObjectRef::new("Datacenter", "datacenter-2");
        let loc = Location::root()
            .child("vc", Node::Connection("vc".to_string()))
            .child("lab", Node::Entity(dc.clone()));
        assert_eq!(loc.to_string(), "/vc/lab");
        assert_eq!(loc.parent().to_string(), "/vc");
        assert_eq!(Location::root().parent(), Location::root());
        assert_eq!(loc.connection_name(), Some("vc"));
        assert_eq!(loc.ancestor_of_kind(&EntityKind::Datacenter).unwrap().entity(), Some(&dc));
    }

    #[test]
    fn test_capability_predicates() {
        let vm = Node::Entity(ManagedObjectRef::new("VirtualMachine", "vm-1"));
        let cluster = Node::Entity(ManagedObjectRef::new("ClusterComputeResource", "domain-c1"));
        assert!(Capability::VirtualMachine.accepts(&vm));
        assert!(Capability::ManagedEntity.accepts(&vm));
        assert!(!Capability::HostSystem.accepts(&vm));
        assert!(Capability::ComputeResource.accepts(&cluster));
        assert!(!Capability::ManagedEntity.accepts(&Node::Root));
    }

    #[tokio::test]
    async fn test_resolve_absolute_and_relative() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        let vm = sim.add_vm(&dc, &host, "web01", "poweredOn");
        let mut session = session_with(sim);

        let found = resolve_single(&session, "/vc/lab/vms/web01", Capability::VirtualMachine).await.unwrap();
        assert_eq!(found.entity(), Some(&vm));
        assert_eq!(found.to_string(), "/vc/lab/vms/web01");

        let dc_loc = resolve_single(&session, "/vc/lab", Capability::ManagedEntity).await.unwrap();
        session.set_cwd(dc_loc);
        let found = resolve_single(&session, "vms/../vms/./web01", Capability::Any).await.unwrap();
        assert_eq!(found.entity(), Some(&vm));
        let found = resolve_single(&session, "~/computers/esx1/hosts/esx1", Capability::HostSystem).await.unwrap();
        assert_eq!(found.entity(), Some(&host));
    }

    #[tokio::test]
    async fn test_resolve_failures() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        sim.add_vm(&dc, &host, "web01", "poweredOn");
        sim.add_vm(&dc, &host, "web02", "poweredOn");
        let session = session_with(sim);

        assert!(matches!(resolve(&session, "/vc/lab/vms/nope").await, Err(LookupError::NotFound(_))));
        assert!(matches!(
            resolve_single(&session, "/vc/lab/vms/web*", Capability::VirtualMachine).await,
            Err(LookupError::Ambiguous { count: 2, .. })
        ));
        assert!(matches!(
            resolve_single(&session, "/vc/lab", Capability::VirtualMachine).await,
            Err(LookupError::WrongType { .. })
        ));
        assert_eq!(resolve(&session, "/vc/lab/vms/*").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_marks_and_datastore_files() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let host = sim.add_host(&dc, "esx1");
        sim.add_datastore(&dc, "ds1", &[host]);
        let mut session = session_with(sim);

        let ds = resolve_single(&session, "/vc/lab/datastores/ds1", Capability::Datastore).await.unwrap();
        session.set_mark("data", vec![ds]);
        let iso = resolve_single(&session, "~data/isos/ubuntu.iso", Capability::DatastoreFile).await.unwrap();
        assert_eq!(iso.datastore_path().as_deref(), Some("[ds1] isos/ubuntu.iso"));

        session.set_numeric_marks(vec![iso.clone()]);
        assert_eq!(resolve_single(&session, "0", Capability::Any).await.unwrap(), iso);
        assert!(matches!(resolve(&session, "~missing").await, Err(LookupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolve_parent() {
        let sim = Arc::new(Simulator::new());
        sim.add_datacenter("lab");
        let session = session_with(sim);
        let (parent, name) = resolve_parent(&session, "/vc/lab/vms/new", Capability::Folder).await.unwrap();
        assert_eq!(parent.to_string(), "/vc/lab/vms");
        assert_eq!(name, "new");
        assert!(resolve_parent(&session, "/vc/lab/vms/", Capability::Folder).await.is_ok());
        assert!(resolve_parent(&session, "/vc/lab/nothere/new", Capability::Folder).await.is_err());
    }
}

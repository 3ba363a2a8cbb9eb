use std::collections::{BTreeMap, HashMap};
use crate::vim::{Connection, EntityKind};
use super::path::{Location, Node};

/// Interactive state: open connections, current directory and marks.
/// Lives as long as the shell process.
#[derive(Debug, Default)]
pub struct Session {
    connections: BTreeMap<String, Connection>,
    cwd: Location,
    marks: HashMap<String, Vec<Location>>,
    debug: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and make it the current directory
    pub fn add_connection(&mut self, connection: Connection) {
        let name = connection.name().to_string();
        connection.api().set_debug(self.debug);
        self.connections.insert(name.clone(), connection);
        let location = Location::root().child(name.clone(), Node::Connection(name));
        self.set_cwd(location);
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Drop a connection, and every mark and directory that pointed into it
    pub fn remove_connection(&mut self, name: &str) -> Option<Connection> {
        let removed = self.connections.remove(name)?;
        self.marks.retain(|_, locations| {
            locations.retain(|l| l.connection_name() != Some(name));
            !locations.is_empty()
        });
        if self.cwd.connection_name() == Some(name) {
            self.set_cwd(Location::root());
        }
        Some(removed)
    }

    pub fn cwd(&self) -> &Location {
        &self.cwd
    }

    /// Change directory. Refreshes `~` and `@`, forgets the numeric marks of the last listing.
    pub fn set_cwd(&mut self, location: Location) {
        let datacenter = location.ancestor_of_kind(&EntityKind::Datacenter);
        let connection = location.connection_location();
        self.set_mark("", datacenter.into_iter().collect());
        self.set_mark("@", connection.into_iter().collect());
        self.clear_numeric_marks();
        self.cwd = location;
    }

    pub fn mark(&self, name: &str) -> Option<&Vec<Location>> {
        self.marks.get(name)
    }

    /// An empty set removes the mark
    pub fn set_mark(&mut self, name: &str, locations: Vec<Location>) {
        if locations.is_empty() {
            self.marks.remove(name);
        } else {
            self.marks.insert(name.to_string(), locations);
        }
    }

    pub fn user_marks(&self) -> impl Iterator<Item = (&String, &Vec<Location>)> {
        self.marks.iter().filter(|(name, _)| !name.is_empty() && *name != "@" && !is_numeric(name))
    }

    fn clear_numeric_marks(&mut self) {
        self.marks.retain(|name, _| !is_numeric(name));
    }

    /// Index the entries of a listing as `0`, `1`, ...
    pub fn set_numeric_marks(&mut self, locations: Vec<Location>) {
        self.clear_numeric_marks();
        for (i, location) in locations.into_iter().enumerate() {
            self.marks.insert(i.to_string(), vec![location]);
        }
    }

    /// Flip wire logging on every connection; returns the new state
    pub fn toggle_debug(&mut self) -> bool {
        self.debug = !self.debug;
        for connection in self.connections.values() {
            connection.api().set_debug(self.debug);
        }
        self.debug
    }

    pub fn prompt(&self) -> String {
        format!("{}> ", self.cwd)
    }
}

fn is_numeric(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::vim::ManagedObjectRef;
    use crate::vim::simulator::Simulator;

    fn datacenter_location() -> Location {
        Location::root()
            .child("vc", Node::Connection("vc".to_string()))
            .child("lab", Node::Entity(ManagedObjectRef::new("Datacenter", "datacenter-2")))
    }

    #[test]
    fn test_cd_refreshes_marks() {
        let mut session = Session::new();
        session.add_connection(Connection::new("vc", Arc::new(Simulator::new())));
        assert_eq!(session.cwd().to_string(), "/vc");
        assert!(session.mark("").is_none());

        session.set_numeric_marks(vec![Location::root(), Location::root()]);
        assert!(session.mark("1").is_some());

        let dc = datacenter_location();
        session.set_cwd(dc.child("vms", Node::Entity(ManagedObjectRef::new("Folder", "group-v3"))));
        assert_eq!(session.mark("").unwrap()[0], dc);
        assert_eq!(session.mark("@").unwrap()[0].to_string(), "/vc");
        assert!(session.mark("1").is_none());
        assert_eq!(session.prompt(), "/vc/lab/vms> ");
    }

    #[test]
    fn test_remove_connection_drops_marks() {
        let mut session = Session::new();
        session.add_connection(Connection::new("vc", Arc::new(Simulator::new())));
        session.set_mark("lab", vec![datacenter_location()]);
        session.set_cwd(datacenter_location());

        assert!(session.remove_connection("vc").is_some());
        assert!(session.mark("lab").is_none());
        assert!(session.cwd().is_root());
        assert!(session.remove_connection("vc").is_none());
    }

    #[test]
    fn test_user_marks_skip_reserved() {
        let mut session = Session::new();
        session.set_mark("lab", vec![datacenter_location()]);
        session.set_numeric_marks(vec![Location::root()]);
        session.set_cwd(datacenter_location());
        let names: Vec<&String> = session.user_marks().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["lab"]);
    }
}

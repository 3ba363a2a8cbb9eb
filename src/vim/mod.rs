// Management API object model and transports
pub mod types;
pub mod connection;
pub mod client;
pub mod simulator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde::ser::SerializeStruct;
use serde_json::Value;

pub use connection::Connection;
#[allow(unused)]
pub use types::*;

/// Reference to a server-side object. The server owns its lifecycle, we only hold the handle.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedObjectRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        EntityKind::from_type_name(&self.kind)
    }
}

impl Serialize for ManagedObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ManagedObjectReference", 3)?;
        state.serialize_field("_typeName", "ManagedObjectReference")?;
        state.serialize_field("type", &self.kind)?;
        state.serialize_field("value", &self.value)?;
        state.end()
    }
}

impl std::fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// The finite set of inventory kinds the shell knows how to navigate
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Folder,
    Datacenter,
    ComputeResource,
    ClusterComputeResource,
    HostSystem,
    ResourcePool,
    VirtualApp,
    VirtualMachine,
    Datastore,
    Network,
    DistributedVirtualPortgroup,
    Other,
}

impl EntityKind {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "Folder" => EntityKind::Folder,
            "Datacenter" => EntityKind::Datacenter,
            "ComputeResource" => EntityKind::ComputeResource,
            "ClusterComputeResource" => EntityKind::ClusterComputeResource,
            "HostSystem" => EntityKind::HostSystem,
            "ResourcePool" => EntityKind::ResourcePool,
            "VirtualApp" => EntityKind::VirtualApp,
            "VirtualMachine" => EntityKind::VirtualMachine,
            "Datastore" => EntityKind::Datastore,
            "Network" | "OpaqueNetwork" => EntityKind::Network,
            "DistributedVirtualPortgroup" => EntityKind::DistributedVirtualPortgroup,
            _ => EntityKind::Other,
        }
    }

    /// Everything in the inventory tree except non-entity helpers (tasks, managers, ...)
    pub fn is_managed_entity(&self) -> bool {
        !matches!(self, EntityKind::Other)
    }

    pub fn is_compute_resource(&self) -> bool {
        matches!(self, EntityKind::ComputeResource | EntityKind::ClusterComputeResource)
    }

    pub fn is_resource_pool(&self) -> bool {
        matches!(self, EntityKind::ResourcePool | EntityKind::VirtualApp)
    }
}

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server rejected the call with a fault
    #[error("{kind}: {message}")]
    Fault { kind: String, message: String },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Unexpected response: {0}")]
    Decode(String),
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),
}

impl ApiError {
    pub fn fault(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Fault {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Name of the remote fault type, if this is a fault
    pub fn fault_kind(&self) -> Option<&str> {
        match self {
            ApiError::Fault { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Narrow surface every transport has to provide. Everything else is built on top.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Root handles of the connected server
    fn service_content(&self) -> &ServiceContent;

    /// Invoke `method` on `obj` with named parameters
    async fn invoke(&self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<Value, ApiError>;

    /// Read one top-level property of `obj`
    async fn property(&self, obj: &ManagedObjectRef, name: &str) -> Result<Value, ApiError>;

    /// PUT `data` to a signed transfer URL
    async fn upload(&self, url: &str, data: Vec<u8>) -> Result<(), ApiError>;

    /// GET the contents behind a signed transfer URL
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError>;

    /// Toggle wire logging
    fn set_debug(&self, _enabled: bool) {}
}

/// Remove `{_typeName, _value}` boxing the server applies to values in `anyType` positions
pub fn unbox(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("_value") && map.len() <= 2 => {
            map.remove("_value").map(unbox).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(unbox).collect()),
        other => other,
    }
}

/// Walk a dotted property path (e.g. `runtime.powerState`) inside a JSON value
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Name of the data object type carried in a JSON value
pub fn type_name_of(value: &Value) -> Option<&str> {
    value.get("_typeName").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_moref_serializes_with_type_name() {
        let vm = ManagedObjectRef::new("VirtualMachine", "vm-42");
        let value = serde_json::to_value(&vm).unwrap();
        assert_eq!(value["_typeName"], "ManagedObjectReference");
        assert_eq!(value["type"], "VirtualMachine");
        assert_eq!(value["value"], "vm-42");

        let back: ManagedObjectRef = serde_json::from_value(value).unwrap();
        assert_eq!(back, vm);
    }

    #[test]
    fn test_unbox_nested() {
        let boxed = json!({"_typeName": "ArrayOfString", "_value": [{"_typeName": "string", "_value": "a"}, "b"]});
        assert_eq!(unbox(boxed), json!(["a", "b"]));
        let plain = json!({"name": "vm1"});
        assert_eq!(unbox(plain.clone()), plain);
    }

    #[test]
    fn test_value_at() {
        let summary = json!({"runtime": {"powerState": "poweredOn"}});
        assert_eq!(value_at(&summary, "runtime.powerState"), Some(&json!("poweredOn")));
        assert_eq!(value_at(&summary, "runtime.missing"), None);
        assert_eq!(value_at(&summary, ""), Some(&summary));
    }

    #[test]
    fn test_entity_kind_predicates() {
        assert!(EntityKind::from_type_name("ClusterComputeResource").is_compute_resource());
        assert!(EntityKind::from_type_name("VirtualApp").is_resource_pool());
        assert!(!EntityKind::from_type_name("Task").is_managed_entity());
        assert_eq!(EntityKind::from_type_name("Task"), EntityKind::Other);
    }
}

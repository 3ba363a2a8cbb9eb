//! Data objects exchanged with the management server.
//!
//! Field names follow the remote schema exactly (camelCase, with a few
//! irregular acronyms renamed by hand). Objects that sit in polymorphic
//! positions carry their `_typeName`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use super::ManagedObjectRef;

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub api_version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    pub property_collector: ManagedObjectRef,
    pub session_manager: Option<ManagedObjectRef>,
    pub event_manager: Option<ManagedObjectRef>,
    pub guest_operations_manager: Option<ManagedObjectRef>,
    pub about: Option<AboutInfo>,
}

/// `TaskInfo.state`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedMethodFault {
    #[serde(default)]
    pub localized_message: Option<String>,
    #[serde(default)]
    pub fault: Option<Value>,
}

impl LocalizedMethodFault {
    pub fn describe(&self) -> String {
        let kind = self.fault.as_ref().and_then(super::type_name_of);
        match (&self.localized_message, kind) {
            (Some(msg), _) if !msg.is_empty() => msg.clone(),
            (_, Some(kind)) => kind.to_string(),
            _ => "unknown fault".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub state: TaskState,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub error: Option<LocalizedMethodFault>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub description_id: Option<String>,
}

// Property collector

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "PropertySpec", rename_all = "camelCase")]
pub struct PropertySpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub all: bool,
    pub path_set: Vec<String>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "ObjectSpec")]
pub struct ObjectSpec {
    pub obj: ManagedObjectRef,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "PropertyFilterSpec", rename_all = "camelCase")]
pub struct PropertyFilterSpec {
    pub prop_set: Vec<PropertySpec>,
    pub object_set: Vec<ObjectSpec>,
}

impl PropertyFilterSpec {
    /// Same property paths for every object, one prop spec per distinct type
    pub fn for_objects(objs: &[ManagedObjectRef], paths: &[&str]) -> Self {
        let mut kinds: Vec<&str> = objs.iter().map(|o| o.kind.as_str()).collect();
        kinds.sort();
        kinds.dedup();
        Self {
            prop_set: kinds.into_iter().map(|kind| PropertySpec {
                kind: kind.to_string(),
                all: false,
                path_set: paths.iter().map(|p| p.to_string()).collect(),
            }).collect(),
            object_set: objs.iter().map(|obj| ObjectSpec { obj: obj.clone() }).collect(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DynamicProperty {
    pub name: String,
    #[serde(default)]
    pub val: Value,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ObjectContent {
    pub obj: ManagedObjectRef,
    #[serde(default)]
    pub prop_set: Vec<DynamicProperty>,
}

impl ObjectContent {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.prop_set.iter().find(|p| p.name == name).map(|p| &p.val)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct RetrieveResult {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub objects: Vec<ObjectContent>,
}

// Virtual machine configuration

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Destroy,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "VirtualDeviceConfigSpec", rename_all = "camelCase")]
pub struct VirtualDeviceConfigSpec {
    pub operation: DeviceOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: Value,
}

impl VirtualDeviceConfigSpec {
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: None,
            device: device.into_value(),
        }
    }

    pub fn create(device: VirtualDevice) -> Self {
        Self {
            file_operation: Some(FileOperation::Create),
            ..Self::add(device)
        }
    }

    pub fn edit(device: Value) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            file_operation: None,
            device,
        }
    }

    pub fn remove(device: Value, file_operation: Option<FileOperation>) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation,
            device,
        }
    }
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "VirtualMachineFileInfo", rename_all = "camelCase")]
pub struct VirtualMachineFileInfo {
    pub vm_path_name: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "OptionValue")]
pub struct OptionValue {
    pub key: String,
    pub value: Value,
}

impl OptionValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: serde_json::json!({"_typeName": "string", "_value": value.into()}),
        }
    }
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(tag = "_typeName", rename = "VirtualMachineBootOptions", rename_all = "camelCase")]
pub struct VirtualMachineBootOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_delay: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_retry_delay: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_retry_enabled: Option<bool>,
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(tag = "_typeName", rename = "VirtualMachineConfigSpec", rename_all = "camelCase")]
pub struct VirtualMachineConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<VirtualMachineFileInfo>,
    #[serde(rename = "numCPUs", skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,
    #[serde(rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<VirtualDeviceConfigSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_config: Vec<OptionValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_options: Option<VirtualMachineBootOptions>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    MoveChildMostDiskBacking,
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(tag = "_typeName", rename = "VirtualMachineRelocateSpec", rename_all = "camelCase")]
pub struct VirtualMachineRelocateSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<DiskMoveType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<ManagedObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<ManagedObjectRef>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "VirtualMachineCloneSpec", rename_all = "camelCase")]
pub struct VirtualMachineCloneSpec {
    pub location: VirtualMachineRelocateSpec,
    pub template: bool,
    pub power_on: bool,
}

// Virtual devices

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "Description")]
pub struct Description {
    pub label: String,
    pub summary: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "VirtualDeviceConnectInfo", rename_all = "camelCase")]
pub struct VirtualDeviceConnectInfo {
    pub allow_guest_control: bool,
    pub connected: bool,
    pub start_connected: bool,
}

impl VirtualDeviceConnectInfo {
    pub fn connected() -> Self {
        Self {
            allow_guest_control: true,
            connected: true,
            start_connected: true,
        }
    }
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename_all = "camelCase")]
pub enum DeviceBacking {
    #[serde(rename = "VirtualDiskFlatVer2BackingInfo", rename_all = "camelCase")]
    FlatDisk {
        file_name: String,
        disk_mode: String,
        thin_provisioned: bool,
    },
    #[serde(rename = "VirtualCdromIsoBackingInfo", rename_all = "camelCase")]
    CdromIso { file_name: String },
    #[serde(rename = "VirtualCdromAtapiBackingInfo", rename_all = "camelCase")]
    CdromAtapi {
        device_name: String,
        use_auto_detect: bool,
    },
    #[serde(rename = "VirtualEthernetCardNetworkBackingInfo", rename_all = "camelCase")]
    Network { device_name: String },
}

/// Devices the shell knows how to build from scratch
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName")]
pub enum VirtualDevice {
    #[serde(rename = "VirtualLsiLogicController", rename_all = "camelCase")]
    LsiLogicController {
        key: i32,
        bus_number: i32,
        shared_bus: String,
    },
    #[serde(rename = "VirtualDisk", rename_all = "camelCase")]
    Disk {
        key: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_info: Option<Description>,
        backing: DeviceBacking,
        controller_key: i32,
        unit_number: i32,
        #[serde(rename = "capacityInKB")]
        capacity_in_kb: u64,
    },
    #[serde(rename = "VirtualCdrom", rename_all = "camelCase")]
    Cdrom {
        key: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_info: Option<Description>,
        connectable: VirtualDeviceConnectInfo,
        backing: DeviceBacking,
        controller_key: i32,
        unit_number: i32,
    },
    #[serde(rename = "VirtualE1000", rename_all = "camelCase")]
    E1000 {
        key: i32,
        device_info: Description,
        backing: DeviceBacking,
        address_type: String,
    },
    #[serde(rename = "VirtualVmxnet3", rename_all = "camelCase")]
    Vmxnet3 {
        key: i32,
        device_info: Description,
        backing: DeviceBacking,
        address_type: String,
    },
}

impl VirtualDevice {
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Read-side view over a device returned by the server. The raw JSON is kept for edits.
#[derive(Clone, Debug)]
pub struct DeviceView {
    pub raw: Value,
}

impl DeviceView {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn type_name(&self) -> &str {
        super::type_name_of(&self.raw).unwrap_or("VirtualDevice")
    }

    pub fn key(&self) -> Option<i64> {
        self.raw.get("key").and_then(Value::as_i64)
    }

    pub fn label(&self) -> &str {
        super::value_at(&self.raw, "deviceInfo.label").and_then(Value::as_str).unwrap_or("")
    }

    pub fn summary(&self) -> &str {
        super::value_at(&self.raw, "deviceInfo.summary").and_then(Value::as_str).unwrap_or("")
    }

    pub fn controller_key(&self) -> Option<i64> {
        self.raw.get("controllerKey").and_then(Value::as_i64)
    }

    pub fn unit_number(&self) -> Option<i64> {
        self.raw.get("unitNumber").and_then(Value::as_i64)
    }

    /// `None` for devices that cannot be connected/disconnected
    pub fn connected(&self) -> Option<bool> {
        super::value_at(&self.raw, "connectable.connected").and_then(Value::as_bool)
    }

    pub fn backing_file_name(&self) -> Option<&str> {
        super::value_at(&self.raw, "backing.fileName").and_then(Value::as_str)
    }

    /// File backed devices own a file that gets destroyed on removal
    pub fn has_file_backing(&self) -> bool {
        self.backing_file_name().is_some()
    }

    pub fn is_cdrom(&self) -> bool {
        self.type_name() == "VirtualCdrom"
    }

    pub fn is_disk(&self) -> bool {
        self.type_name() == "VirtualDisk"
    }

    pub fn is_lsi_logic_controller(&self) -> bool {
        self.type_name() == "VirtualLsiLogicController"
    }
}

// Host configuration

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "HostConnectSpec", rename_all = "camelCase")]
pub struct HostConnectSpec {
    pub force: bool,
    pub user_name: String,
    pub password: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "HostInternetScsiHbaStaticTarget", rename_all = "camelCase")]
pub struct HostInternetScsiHbaStaticTarget {
    pub address: String,
    #[serde(rename = "iScsiName")]
    pub iscsi_name: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "HostNasVolumeSpec", rename_all = "camelCase")]
pub struct HostNasVolumeSpec {
    pub access_mode: String,
    pub local_path: String,
    pub remote_host: String,
    pub remote_path: String,
}

// Guest operations

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "_typeName", rename = "NamePasswordAuthentication", rename_all = "camelCase")]
pub struct NamePasswordAuthentication {
    pub username: String,
    pub password: String,
    pub interactive_session: bool,
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(tag = "_typeName", rename = "GuestPosixFileAttributes", rename_all = "camelCase")]
pub struct GuestPosixFileAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<i64>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "_typeName", rename = "GuestProgramSpec", rename_all = "camelCase")]
pub struct GuestProgramSpec {
    pub program_path: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_variables: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GuestFileInfo {
    pub path: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GuestListFileInfo {
    #[serde(default)]
    pub files: Vec<GuestFileInfo>,
    #[serde(default)]
    pub remaining: i64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GuestProcessInfo {
    pub pid: i64,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FileTransferInformation {
    pub url: String,
}

// Evacuation

#[derive(Deserialize, Clone, Debug)]
pub struct HostVMotionCompatibility {
    pub host: ManagedObjectRef,
    #[serde(default)]
    pub compatibility: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_spec_uses_remote_field_names() {
        let spec = VirtualMachineConfigSpec {
            num_cpus: Some(2),
            memory_mb: Some(256),
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["_typeName"], "VirtualMachineConfigSpec");
        assert_eq!(value["numCPUs"], 2);
        assert_eq!(value["memoryMB"], 256);
        assert!(value.get("deviceChange").is_none());
        assert!(value.get("name").is_none());
    }

    #[test]
    fn test_disk_device_shape() {
        let disk = VirtualDevice::Disk {
            key: -1,
            device_info: None,
            backing: DeviceBacking::FlatDisk {
                file_name: "[ds1]".to_string(),
                disk_mode: "persistent".to_string(),
                thin_provisioned: true,
            },
            controller_key: 1000,
            unit_number: 0,
            capacity_in_kb: 4096,
        };
        let value = VirtualDeviceConfigSpec::create(disk);
        let value = serde_json::to_value(&value).unwrap();
        assert_eq!(value["operation"], "add");
        assert_eq!(value["fileOperation"], "create");
        assert_eq!(value["device"]["_typeName"], "VirtualDisk");
        assert_eq!(value["device"]["capacityInKB"], 4096);
        assert_eq!(value["device"]["controllerKey"], 1000);
        assert_eq!(value["device"]["backing"]["_typeName"], "VirtualDiskFlatVer2BackingInfo");
        assert_eq!(value["device"]["backing"]["thinProvisioned"], true);
    }

    #[test]
    fn test_device_view() {
        let view = DeviceView::new(json!({
            "_typeName": "VirtualCdrom",
            "key": 3000,
            "deviceInfo": {"label": "CD/DVD drive 1", "summary": "ISO"},
            "connectable": {"connected": false},
            "backing": {"_typeName": "VirtualCdromIsoBackingInfo", "fileName": "[ds1] a.iso"}
        }));
        assert!(view.is_cdrom());
        assert_eq!(view.label(), "CD/DVD drive 1");
        assert_eq!(view.connected(), Some(false));
        assert!(view.has_file_backing());
        assert_eq!(view.key(), Some(3000));
    }

    #[test]
    fn test_task_info_decode() {
        let info: TaskInfo = serde_json::from_value(json!({
            "state": "error",
            "error": {"localizedMessage": "The operation is not allowed in the current state."}
        })).unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert_eq!(info.error.unwrap().describe(), "The operation is not allowed in the current state.");
    }
}

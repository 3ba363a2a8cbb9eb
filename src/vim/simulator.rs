/*!
# In-memory management server

The simulator keeps a small inventory in memory and answers the same
`invoke`/`property` calls a real server would. It is what `--simulate` runs
against and what the command tests use as their server.

## Layout
Every object is a JSON property map keyed by its `ManagedObjectRef`. Dotted
paths (`summary.runtime.powerState`) address nested values. Containers keep
their children in the same array properties the real API uses
(`childEntity`, `host`, `vm`, `datastore`).

## Behaviour
- `*_Task` methods apply their side effect immediately and return a task whose
  `info.state` is already terminal.
- Faults can be injected per `(object, method)`, either as a call fault or as a
  failed task.
- Every invocation is appended to a call log.
- Property filters, `WaitForUpdatesEx` and event collectors are bookkept so
  tests can check they were released.
- Each VM carries a guest file system, credentials and scripted processes.
*/
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use super::{unbox, value_at, AboutInfo, ApiError, ManagedObjectRef, ManagementApi, ServiceContent};

/// One recorded `invoke`
#[cfg(test)]
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub obj: ManagedObjectRef,
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Debug)]
struct ScriptedProcess {
    exit_code: i64,
    polls_before_exit: u32,
}

#[derive(Default)]
struct GuestState {
    passwords: HashMap<String, String>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    scripts: HashMap<String, ScriptedProcess>,
    processes: HashMap<i64, ScriptedProcess>,
    next_pid: i64,
}

enum Transfer {
    ToGuest { vm: ManagedObjectRef, path: String },
    FromGuest(Vec<u8>),
}

#[derive(Default)]
struct SimState {
    objects: HashMap<ManagedObjectRef, Map<String, Value>>,
    next_id: u64,
    #[cfg(test)]
    calls: Vec<RecordedCall>,
    #[cfg(test)]
    latency: Option<std::time::Duration>,
    call_faults: HashMap<(ManagedObjectRef, String), (String, String)>,
    task_faults: HashMap<(ManagedObjectRef, String), String>,
    pending_updates: VecDeque<Vec<(ManagedObjectRef, String, Value)>>,
    version: u64,
    live_filters: HashSet<ManagedObjectRef>,
    destroyed_filters: Vec<ManagedObjectRef>,
    compatibility: HashMap<ManagedObjectRef, Vec<String>>,
    datastore_files: HashMap<ManagedObjectRef, Vec<String>>,
    events: Vec<(ManagedObjectRef, Value)>,
    guests: HashMap<ManagedObjectRef, GuestState>,
    transfers: HashMap<String, Transfer>,
}

pub struct Simulator {
    content: ServiceContent,
    state: Mutex<SimState>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

fn fault(kind: &str, message: impl Into<String>) -> ApiError {
    ApiError::fault(kind, message)
}

fn moref_param(params: &Value, name: &str) -> Option<ManagedObjectRef> {
    params.get(name).cloned().and_then(|v| serde_json::from_value(v).ok())
}

fn str_param<'a>(params: &'a Value, name: &str) -> &'a str {
    params.get(name).and_then(Value::as_str).unwrap_or("")
}

fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map.entry(head.to_string()).or_insert_with(|| json!({}));
            if !entry.is_object() {
                *entry = json!({});
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}

impl SimState {
    fn allocate(&mut self, kind: &str) -> ManagedObjectRef {
        self.next_id += 1;
        let prefix = match kind {
            "Folder" => "group-".to_string(),
            "Datacenter" => "datacenter-".to_string(),
            "HostSystem" => "host-".to_string(),
            "ComputeResource" => "domain-s".to_string(),
            "ClusterComputeResource" => "domain-c".to_string(),
            "ResourcePool" => "resgroup-".to_string(),
            "VirtualMachine" => "vm-".to_string(),
            "Datastore" => "datastore-".to_string(),
            "Network" => "network-".to_string(),
            "Task" => "task-".to_string(),
            other => format!("{}-", other.to_lowercase()),
        };
        ManagedObjectRef::new(kind, format!("{}{}", prefix, self.next_id))
    }

    fn create(&mut self, kind: &str, props: Value) -> ManagedObjectRef {
        let obj = self.allocate(kind);
        let map = match props {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.objects.insert(obj.clone(), map);
        obj
    }

    fn props(&self, obj: &ManagedObjectRef) -> Result<&Map<String, Value>, ApiError> {
        self.objects.get(obj).ok_or_else(|| fault("ManagedObjectNotFound", format!("The object '{}' has already been deleted or has not been completely created", obj)))
    }

    fn get(&self, obj: &ManagedObjectRef, path: &str) -> Value {
        let Some(map) = self.objects.get(obj) else {
            return Value::Null;
        };
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        map.get(head).and_then(|v| value_at(v, rest)).cloned().unwrap_or(Value::Null)
    }

    fn set(&mut self, obj: &ManagedObjectRef, path: &str, value: Value) {
        if let Some(map) = self.objects.get_mut(obj) {
            set_path(map, path, value);
        }
    }

    fn refs(&self, obj: &ManagedObjectRef, path: &str) -> Vec<ManagedObjectRef> {
        serde_json::from_value(self.get(obj, path)).unwrap_or_default()
    }

    fn push_ref(&mut self, obj: &ManagedObjectRef, path: &str, child: &ManagedObjectRef) {
        let mut list = self.refs(obj, path);
        list.push(child.clone());
        self.set(obj, path, json!(list));
    }

    fn detach(&mut self, target: &ManagedObjectRef) {
        for map in self.objects.values_mut() {
            for key in ["childEntity", "vm", "host", "datastore"] {
                if let Some(Value::Array(items)) = map.get_mut(key) {
                    items.retain(|item| serde_json::from_value::<ManagedObjectRef>(item.clone()).ok().as_ref() != Some(target));
                }
            }
        }
    }

    fn set_power_state(&mut self, vm: &ManagedObjectRef, state: &str) {
        self.set(vm, "runtime.powerState", json!(state));
        self.set(vm, "summary.runtime.powerState", json!(state));
    }

    fn create_vm(&mut self, folder: &ManagedObjectRef, name: &str, config: &Value, pool: Option<ManagedObjectRef>, host: Option<ManagedObjectRef>) -> ManagedObjectRef {
        let devices: Vec<Value> = config.get("deviceChange").and_then(Value::as_array)
            .map(|changes| changes.iter().filter_map(|c| c.get("device").cloned()).collect())
            .unwrap_or_default();
        let vm_path = value_at(config, "files.vmPathName").and_then(Value::as_str).unwrap_or("[]").to_string();
        let vm = self.create("VirtualMachine", json!({
            "name": name,
            "parent": folder,
            "config": {
                "annotation": config.get("annotation").cloned().unwrap_or(json!("")),
                "hardware": {
                    "numCPU": config.get("numCPUs").cloned().unwrap_or(json!(1)),
                    "memoryMB": config.get("memoryMB").cloned().unwrap_or(json!(128)),
                    "device": devices,
                },
                "extraConfig": [],
                "bootOptions": {"bootDelay": 0, "bootRetryDelay": 10000, "bootRetryEnabled": false},
            },
            "summary": {
                "runtime": {"powerState": "poweredOff"},
                "guest": {},
                "config": {"annotation": "", "vmPathName": format!("{} {}/{}.vmx", vm_path, name, name)},
            },
            "runtime": {"powerState": "poweredOff"},
            "datastore": [],
            "layoutEx": {"file": []},
            "overallStatus": "green",
        }));
        self.push_ref(folder, "childEntity", &vm);
        if let Some(pool) = pool {
            self.set(&vm, "resourcePool", json!(pool));
            self.push_ref(&pool, "vm", &vm);
        }
        if let Some(host) = host {
            self.set(&vm, "runtime.host", json!(host));
            self.push_ref(&host, "vm", &vm);
        }
        self.guests.entry(vm.clone()).or_default();
        vm
    }

    fn reconfigure(&mut self, vm: &ManagedObjectRef, spec: &Value) -> Result<(), String> {
        if let Some(annotation) = spec.get("annotation") {
            self.set(vm, "config.annotation", annotation.clone());
            self.set(vm, "summary.config.annotation", annotation.clone());
        }
        if let Some(cpus) = spec.get("numCPUs") {
            self.set(vm, "config.hardware.numCPU", cpus.clone());
        }
        if let Some(memory) = spec.get("memoryMB") {
            self.set(vm, "config.hardware.memoryMB", memory.clone());
        }
        if let Some(Value::Array(options)) = spec.get("extraConfig") {
            let mut current: Vec<Value> = self.get(vm, "config.extraConfig").as_array().cloned().unwrap_or_default();
            for option in options {
                let key = str_param(option, "key").to_string();
                let value = unbox(option.get("value").cloned().unwrap_or(Value::Null));
                current.retain(|o| str_param(o, "key") != key);
                if value.as_str() != Some("") {
                    current.push(json!({"key": key, "value": value}));
                }
            }
            self.set(vm, "config.extraConfig", json!(current));
        }
        if let Some(Value::Object(boot)) = spec.get("bootOptions") {
            for (key, value) in boot {
                if key != "_typeName" {
                    self.set(vm, &format!("config.bootOptions.{}", key), value.clone());
                }
            }
        }
        if let Some(Value::Array(changes)) = spec.get("deviceChange") {
            let mut devices: Vec<Value> = self.get(vm, "config.hardware.device").as_array().cloned().unwrap_or_default();
            for change in changes {
                let device = change.get("device").cloned().unwrap_or(Value::Null);
                let key = device.get("key").and_then(Value::as_i64);
                match str_param(change, "operation") {
                    "add" => {
                        let mut device = device;
                        if key.is_none_or(|k| k < 0) {
                            let next = devices.iter().filter_map(|d| d.get("key").and_then(Value::as_i64)).max().unwrap_or(4000) + 1;
                            device["key"] = json!(next);
                        }
                        if device.get("deviceInfo").is_none() {
                            let label = format!("{} {}", super::type_name_of(&device).unwrap_or("Device"), devices.len() + 1);
                            device["deviceInfo"] = json!({"label": label, "summary": ""});
                        }
                        devices.push(device);
                    }
                    "edit" => {
                        let slot = devices.iter_mut().find(|d| d.get("key").and_then(Value::as_i64) == key)
                            .ok_or_else(|| "Invalid device key".to_string())?;
                        *slot = device;
                    }
                    "remove" => {
                        let before = devices.len();
                        devices.retain(|d| d.get("key").and_then(Value::as_i64) != key);
                        if devices.len() == before {
                            return Err("Invalid device key".to_string());
                        }
                    }
                    other => return Err(format!("Invalid operation '{}'", other)),
                }
            }
            self.set(vm, "config.hardware.device", json!(devices));
        }
        Ok(())
    }

    /// Side effect of a `*_Task` method: `Ok(result)` or the task's error message
    fn run_task(&mut self, obj: &ManagedObjectRef, method: &str, params: &Value) -> Result<Value, String> {
        match method {
            "PowerOnVM_Task" => {
                if self.get(obj, "runtime.powerState") == json!("poweredOn") {
                    return Err("The attempted operation cannot be performed in the current state (Powered on).".to_string());
                }
                self.set_power_state(obj, "poweredOn");
            }
            "PowerOffVM_Task" => {
                if self.get(obj, "runtime.powerState") == json!("poweredOff") {
                    return Err("The attempted operation cannot be performed in the current state (Powered off).".to_string());
                }
                self.set_power_state(obj, "poweredOff");
            }
            "SuspendVM_Task" => self.set_power_state(obj, "suspended"),
            "Destroy_Task" => {
                self.detach(obj);
                self.objects.remove(obj);
                self.guests.remove(obj);
            }
            "Rename_Task" => self.set(obj, "name", json!(str_param(params, "newName"))),
            "MoveIntoFolder_Task" => {
                let list: Vec<ManagedObjectRef> = params.get("list").cloned()
                    .and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default();
                for item in list {
                    let parent: Option<ManagedObjectRef> = serde_json::from_value(self.get(&item, "parent")).ok();
                    if let Some(parent) = parent {
                        let mut children = self.refs(&parent, "childEntity");
                        children.retain(|c| c != &item);
                        self.set(&parent, "childEntity", json!(children));
                    }
                    self.push_ref(obj, "childEntity", &item);
                    self.set(&item, "parent", json!(obj));
                }
            }
            "CreateVM_Task" => {
                let config = params.get("config").cloned().unwrap_or(Value::Null);
                let name = str_param(&config, "name").to_string();
                let vm = self.create_vm(obj, &name, &config, moref_param(params, "pool"), moref_param(params, "host"));
                return Ok(json!(vm));
            }
            "RegisterVM_Task" => {
                let path = str_param(params, "path");
                let name = path.rsplit('/').next().unwrap_or(path).trim_end_matches(".vmx").to_string();
                let vm = self.create_vm(obj, &name, &json!({}), moref_param(params, "pool"), moref_param(params, "host"));
                return Ok(json!(vm));
            }
            "CloneVM_Task" => {
                let folder = moref_param(params, "folder").ok_or_else(|| "missing folder".to_string())?;
                let name = str_param(params, "name").to_string();
                let config = json!({"deviceChange": self.get(obj, "config.hardware.device").as_array().cloned().unwrap_or_default()
                    .into_iter().map(|d| json!({"device": d})).collect::<Vec<_>>()});
                let vm = self.create_vm(&folder, &name, &config, None, None);
                if value_at(params, "spec.powerOn").and_then(Value::as_bool) == Some(true) {
                    self.set_power_state(&vm, "poweredOn");
                }
                return Ok(json!(vm));
            }
            "ReconfigVM_Task" => {
                let spec = params.get("spec").cloned().unwrap_or(Value::Null);
                self.reconfigure(obj, &spec)?;
            }
            "MigrateVM_Task" => {
                if let Some(host) = moref_param(params, "host") {
                    if let Ok(old) = serde_json::from_value::<ManagedObjectRef>(self.get(obj, "runtime.host")) {
                        let mut vms = self.refs(&old, "vm");
                        vms.retain(|v| v != obj);
                        self.set(&old, "vm", json!(vms));
                    }
                    self.push_ref(&host, "vm", obj);
                    self.set(obj, "runtime.host", json!(host));
                }
            }
            "EnterMaintenanceMode_Task" => self.set(obj, "runtime.inMaintenanceMode", json!(true)),
            "ExitMaintenanceMode_Task" => self.set(obj, "runtime.inMaintenanceMode", json!(false)),
            "DisconnectHost_Task" => self.set(obj, "runtime.connectionState", json!("disconnected")),
            "ReconnectHost_Task" => self.set(obj, "runtime.connectionState", json!("connected")),
            "SearchDatastoreSubFolders_Task" => {
                let datastore: Option<ManagedObjectRef> = serde_json::from_value(self.get(obj, "datastore")).ok();
                let Some(datastore) = datastore else {
                    return Err("browser is not attached to a datastore".to_string());
                };
                let ds_name = self.get(&datastore, "name").as_str().unwrap_or("").to_string();
                let mut folders: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for file in self.datastore_files.get(&datastore).cloned().unwrap_or_default() {
                    if !file.ends_with(".vmx") {
                        continue;
                    }
                    let (folder, name) = file.rsplit_once('/').unwrap_or(("", file.as_str()));
                    folders.entry(format!("[{}] {}", ds_name, folder)).or_default().push(json!({"path": name}));
                }
                let results: Vec<Value> = folders.into_iter().map(|(folder_path, file)| json!({"folderPath": folder_path, "file": file})).collect();
                return Ok(json!(results));
            }
            _ => {}
        }
        Ok(Value::Null)
    }

    fn create_task(&mut self, obj: &ManagedObjectRef, method: &str, outcome: Result<Value, String>) -> ManagedObjectRef {
        let info = match outcome {
            Ok(result) => json!({"state": "success", "progress": 100, "result": result, "descriptionId": method, "entity": obj}),
            Err(message) => json!({"state": "error", "error": {"localizedMessage": message}, "descriptionId": method, "entity": obj}),
        };
        self.create("Task", json!({"info": info}))
    }

    fn guest(&mut self, params: &Value) -> Result<(ManagedObjectRef, &mut GuestState), ApiError> {
        let vm = moref_param(params, "vm").ok_or_else(|| fault("InvalidArgument", "vm"))?;
        let username = value_at(params, "auth.username").and_then(Value::as_str).unwrap_or("").to_string();
        let password = value_at(params, "auth.password").and_then(Value::as_str).unwrap_or("").to_string();
        let guest = self.guests.get_mut(&vm).ok_or_else(|| fault("GuestOperationsUnavailable", "The guest operations agent could not be contacted."))?;
        if guest.passwords.get(&username) != Some(&password) {
            return Err(fault("InvalidGuestLogin", "Failed to authenticate with the guest operating system using the supplied credentials."));
        }
        Ok((vm, guest))
    }

    fn guest_op(&mut self, method: &str, params: &Value) -> Result<Value, ApiError> {
        self.next_id += 1;
        let transfer_id = self.next_id;
        let (vm, guest) = self.guest(params)?;
        let not_found = |path: &str| fault("FileNotFound", format!("File {} was not found", path));
        match method {
            "ValidateCredentialsInGuest" => Ok(Value::Null),
            "MakeDirectoryInGuest" => {
                let path = normalize_dir(str_param(params, "directoryPath"));
                if guest.dirs.contains(&path) {
                    return Err(fault("FileAlreadyExists", format!("File {} already exists", path)));
                }
                let create_parents = params.get("createParentDirectories").and_then(Value::as_bool).unwrap_or(false);
                let mut missing = Vec::new();
                let mut cursor = path.clone();
                while !guest.dirs.contains(&cursor) {
                    missing.push(cursor.clone());
                    cursor = parent_dir(&cursor);
                }
                if missing.len() > 1 && !create_parents {
                    return Err(not_found(&parent_dir(&path)));
                }
                guest.dirs.extend(missing);
                Ok(Value::Null)
            }
            "ListFilesInGuest" => {
                let dir = normalize_dir(str_param(params, "filePath"));
                if !guest.dirs.contains(&dir) {
                    return Err(not_found(&dir));
                }
                let pattern = params.get("matchPattern").and_then(Value::as_str)
                    .and_then(|p| regex::Regex::new(p).ok());
                let children = guest.dirs.iter().filter(|d| **d != dir && parent_dir(d) == dir)
                    .chain(guest.files.keys().filter(|f| parent_dir(f) == dir))
                    .filter_map(|p| p.rsplit('/').next())
                    .filter(|name| pattern.as_ref().is_none_or(|re| re.is_match(name)))
                    .map(|name| json!({"path": name}))
                    .collect::<Vec<_>>();
                Ok(json!({"files": children, "remaining": 0}))
            }
            "DeleteFileInGuest" => {
                let path = str_param(params, "filePath");
                guest.files.remove(path).map(|_| Value::Null).ok_or_else(|| not_found(path))
            }
            "DeleteDirectoryInGuest" => {
                let path = normalize_dir(str_param(params, "directoryPath"));
                if !guest.dirs.remove(&path) {
                    return Err(not_found(&path));
                }
                let prefix = format!("{}/", path);
                guest.dirs.retain(|d| !d.starts_with(&prefix));
                guest.files.retain(|f, _| !f.starts_with(&prefix));
                Ok(Value::Null)
            }
            "MoveFileInGuest" => {
                let src = str_param(params, "srcFilePath");
                let dst = str_param(params, "dstFilePath").to_string();
                let overwrite = params.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
                if guest.files.contains_key(&dst) && !overwrite {
                    return Err(fault("FileAlreadyExists", format!("File {} already exists", dst)));
                }
                let data = guest.files.remove(src).ok_or_else(|| not_found(src))?;
                guest.files.insert(dst, data);
                Ok(Value::Null)
            }
            "MoveDirectoryInGuest" => {
                let src = normalize_dir(str_param(params, "srcDirectoryPath"));
                let dst = normalize_dir(str_param(params, "dstDirectoryPath"));
                if !guest.dirs.remove(&src) {
                    return Err(not_found(&src));
                }
                guest.dirs.insert(dst);
                Ok(Value::Null)
            }
            "ChangeFileAttributesInGuest" => {
                let path = str_param(params, "guestFilePath");
                if guest.files.contains_key(path) || guest.dirs.contains(path) {
                    Ok(Value::Null)
                } else {
                    Err(not_found(path))
                }
            }
            "CreateTemporaryFileInGuest" | "CreateTemporaryDirectoryInGuest" => {
                let dir = params.get("directoryPath").and_then(Value::as_str).unwrap_or("/tmp");
                let path = format!("{}/{}{}{}", normalize_dir(dir).trim_end_matches('/'), str_param(params, "prefix"), transfer_id, str_param(params, "suffix"));
                if method == "CreateTemporaryFileInGuest" {
                    guest.files.insert(path.clone(), Vec::new());
                } else {
                    guest.dirs.insert(path.clone());
                }
                Ok(json!(path))
            }
            "InitiateFileTransferToGuest" => {
                let path = str_param(params, "guestFilePath").to_string();
                let overwrite = params.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
                if guest.files.contains_key(&path) && !overwrite {
                    return Err(fault("FileAlreadyExists", format!("File {} already exists", path)));
                }
                if !guest.dirs.contains(&parent_dir(&path)) {
                    return Err(not_found(&parent_dir(&path)));
                }
                let url = format!("https://*:443/guestFile?id={}&token=upload", transfer_id);
                self.transfers.insert(url.clone(), Transfer::ToGuest { vm, path });
                Ok(json!(url))
            }
            "InitiateFileTransferFromGuest" => {
                let path = str_param(params, "guestFilePath");
                let data = guest.files.get(path).cloned().ok_or_else(|| not_found(path))?;
                let size = data.len();
                let url = format!("https://*:443/guestFile?id={}&token=download", transfer_id);
                self.transfers.insert(url.clone(), Transfer::FromGuest(data));
                Ok(json!({"_typeName": "FileTransferInformation", "url": url, "size": size}))
            }
            "StartProgramInGuest" => {
                let program = value_at(params, "spec.programPath").and_then(Value::as_str).unwrap_or("");
                let script = guest.scripts.get(program).cloned().unwrap_or(ScriptedProcess { exit_code: 0, polls_before_exit: 0 });
                guest.next_pid += 1;
                let pid = 1000 + guest.next_pid;
                guest.processes.insert(pid, script);
                Ok(json!(pid))
            }
            "ListProcessesInGuest" => {
                let pids: Vec<i64> = params.get("pids").cloned().and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default();
                let mut infos = Vec::new();
                for pid in pids {
                    let Some(process) = guest.processes.get_mut(&pid) else { continue };
                    if process.polls_before_exit > 0 {
                        process.polls_before_exit -= 1;
                        infos.push(json!({"pid": pid}));
                    } else {
                        infos.push(json!({"pid": pid, "endTime": "2026-01-01T00:00:00Z", "exitCode": process.exit_code}));
                    }
                }
                Ok(json!(infos))
            }
            other => Err(fault("MethodNotFound", other.to_string())),
        }
    }

    fn retrieve(&self, params: &Value) -> Value {
        let mut objects = Vec::new();
        for spec in params.get("specSet").and_then(Value::as_array).into_iter().flatten() {
            let prop_specs = spec.get("propSet").and_then(Value::as_array).cloned().unwrap_or_default();
            for object_spec in spec.get("objectSet").and_then(Value::as_array).into_iter().flatten() {
                let Some(obj) = moref_param(object_spec, "obj") else { continue };
                if !self.objects.contains_key(&obj) {
                    continue;
                }
                let mut prop_set = Vec::new();
                for prop_spec in prop_specs.iter().filter(|p| str_param(p, "type") == obj.kind) {
                    for path in prop_spec.get("pathSet").and_then(Value::as_array).into_iter().flatten().filter_map(Value::as_str) {
                        let val = self.get(&obj, path);
                        if !val.is_null() {
                            prop_set.push(json!({"name": path, "val": val}));
                        }
                    }
                }
                objects.push(json!({"obj": obj, "propSet": prop_set}));
            }
        }
        json!({"objects": objects})
    }

    fn invoke(&mut self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<Value, ApiError> {
        #[cfg(test)]
        self.calls.push(RecordedCall {
            obj: obj.clone(),
            method: method.to_string(),
            params: params.clone(),
        });
        if let Some((kind, message)) = self.call_faults.get(&(obj.clone(), method.to_string())) {
            return Err(fault(kind, message.clone()));
        }
        self.props(obj)?;

        match method {
            "RetrievePropertiesEx" => Ok(self.retrieve(&params)),
            "CreateFilter" => {
                let filter = self.create("PropertyFilter", json!({"spec": params.get("spec").cloned().unwrap_or(Value::Null)}));
                self.live_filters.insert(filter.clone());
                Ok(json!(filter))
            }
            "DestroyPropertyFilter" => {
                self.live_filters.remove(obj);
                self.destroyed_filters.push(obj.clone());
                self.objects.remove(obj);
                Ok(Value::Null)
            }
            "WaitForUpdatesEx" => match self.pending_updates.pop_front() {
                Some(batch) => {
                    for (target, path, value) in batch {
                        self.set(&target, &path, value);
                    }
                    self.version += 1;
                    Ok(json!({"version": self.version.to_string(), "filterSet": []}))
                }
                None => Ok(Value::Null),
            },
            "CreateCollectorForEvents" => {
                let entity = params.get("filter").and_then(|f| moref_param(f, "entity").or_else(|| f.get("entity").and_then(|e| moref_param(e, "entity"))));
                let events: Vec<Value> = self.events.iter()
                    .filter(|(target, _)| entity.as_ref().is_none_or(|e| e == target || e == &self.objects_root()))
                    .map(|(_, event)| event.clone())
                    .collect();
                Ok(json!(self.create("EventHistoryCollector", json!({"all": events, "latestPage": []}))))
            }
            "SetCollectorPageSize" => {
                let max = params.get("maxCount").and_then(Value::as_u64).unwrap_or(10) as usize;
                let all = self.get(obj, "all").as_array().cloned().unwrap_or_default();
                let page: Vec<Value> = all.into_iter().rev().take(max).collect();
                self.set(obj, "latestPage", json!(page));
                Ok(Value::Null)
            }
            "DestroyCollector" => {
                self.objects.remove(obj);
                Ok(Value::Null)
            }
            "QueryVMotionCompatibility" => {
                let hosts: Vec<ManagedObjectRef> = params.get("host").cloned().and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default();
                let result: Vec<Value> = hosts.into_iter().map(|host| {
                    let compatibility = self.compatibility.get(&host).cloned().unwrap_or_else(|| vec!["cpu".to_string(), "software".to_string()]);
                    json!({"host": host, "compatibility": compatibility})
                }).collect();
                Ok(json!(result))
            }
            "CreateFolder" => {
                let name = str_param(&params, "name");
                let existing = self.refs(obj, "childEntity");
                if existing.iter().any(|c| self.get(c, "name") == json!(name)) {
                    return Err(fault("DuplicateName", format!("The name '{}' already exists.", name)));
                }
                let folder = self.create("Folder", json!({"name": name, "parent": obj, "childEntity": []}));
                self.push_ref(obj, "childEntity", &folder);
                Ok(json!(folder))
            }
            "ShutdownGuest" => {
                self.set_power_state(obj, "poweredOff");
                Ok(Value::Null)
            }
            "UnregisterVM" => {
                self.detach(obj);
                self.objects.remove(obj);
                Ok(Value::Null)
            }
            "AnswerVM" => {
                self.set(obj, "runtime.question", Value::Null);
                Ok(Value::Null)
            }
            m if m.ends_with("InGuest") => self.guest_op(m, &params),
            m if m.ends_with("_Task") => {
                let outcome = match self.task_faults.get(&(obj.clone(), m.to_string())) {
                    Some(message) => Err(message.clone()),
                    None => self.run_task(obj, m, &params),
                };
                Ok(json!(self.create_task(obj, m, outcome)))
            }
            _ => Ok(Value::Null),
        }
    }

    fn objects_root(&self) -> ManagedObjectRef {
        ManagedObjectRef::new("Folder", "group-d1")
    }
}

impl Simulator {
    /// Empty inventory with the service singletons in place
    pub fn new() -> Self {
        let mut state = SimState::default();
        let root = ManagedObjectRef::new("Folder", "group-d1");
        state.objects.insert(root.clone(), Map::from_iter([
            ("name".to_string(), json!("Datacenters")),
            ("childEntity".to_string(), json!([])),
        ]));
        let property_collector = state.create("PropertyCollector", json!({}));
        let session_manager = state.create("SessionManager", json!({}));
        let event_manager = state.create("EventManager", json!({
            "description": {"eventInfo": [
                {"key": "VmPoweredOnEvent", "category": "info"},
                {"key": "VmPoweredOffEvent", "category": "info"},
                {"key": "VmFailedToPowerOnEvent", "category": "error"},
                {"key": "AlarmStatusChangedEvent", "category": "warning"},
            ]}
        }));
        let auth_manager = state.create("GuestAuthManager", json!({}));
        let file_manager = state.create("GuestFileManager", json!({}));
        let process_manager = state.create("GuestProcessManager", json!({}));
        let guest_operations_manager = state.create("GuestOperationsManager", json!({
            "authManager": auth_manager,
            "fileManager": file_manager,
            "processManager": process_manager,
        }));
        state.objects.insert(ManagedObjectRef::new("ServiceInstance", "ServiceInstance"), Map::new());

        let content = ServiceContent {
            root_folder: root,
            property_collector,
            session_manager: Some(session_manager),
            event_manager: Some(event_manager),
            guest_operations_manager: Some(guest_operations_manager),
            about: Some(AboutInfo {
                full_name: "vshell simulator".to_string(),
                api_version: "8.0.1.0".to_string(),
            }),
        };

        Self {
            content,
            state: Mutex::new(state),
        }
    }

    /// Small ready-made inventory for offline use
    pub fn demo() -> Self {
        let sim = Self::new();
        let dc = sim.add_datacenter("lab");
        let (_cluster, hosts) = sim.add_cluster(&dc, "cluster1", &["esx1.lab", "esx2.lab"]);
        let ds = sim.add_datastore(&dc, "datastore1", &hosts);
        sim.add_datastore_file(&ds, "isos/ubuntu.iso");
        sim.add_datastore_file(&ds, "orphan/orphan.vmx");
        sim.add_network(&dc, "VM Network");
        let web = sim.add_vm(&dc, &hosts[0], "web01", "poweredOn");
        sim.set_property(&web, "summary.guest.ipAddress", json!("10.0.0.11"));
        sim.add_vm(&dc, &hosts[1], "db01", "poweredOff");
        sim.set_guest_password(&web, "root", "vmware");
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_datacenter(&self, name: &str) -> ManagedObjectRef {
        let mut state = self.lock();
        let dc = state.allocate("Datacenter");
        let mut folders = Map::new();
        for (prop, folder_name) in [("vmFolder", "vm"), ("hostFolder", "host"), ("datastoreFolder", "datastore"), ("networkFolder", "network")] {
            let folder = state.create("Folder", json!({"name": folder_name, "parent": dc, "childEntity": []}));
            folders.insert(prop.to_string(), json!(folder));
        }
        let mut props = folders;
        props.insert("name".to_string(), json!(name));
        props.insert("parent".to_string(), json!(self.content.root_folder));
        props.insert("overallStatus".to_string(), json!("green"));
        state.objects.insert(dc.clone(), props);
        state.push_ref(&self.content.root_folder, "childEntity", &dc);
        dc
    }

    fn folder_of(&self, dc: &ManagedObjectRef, prop: &str) -> ManagedObjectRef {
        serde_json::from_value(self.lock().get(dc, prop)).unwrap_or_else(|_| self.content.root_folder.clone())
    }

    fn new_host(state: &mut SimState, parent: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        state.create("HostSystem", json!({
            "name": name,
            "parent": parent,
            "runtime": {"connectionState": "connected", "powerState": "poweredOn", "inMaintenanceMode": false},
            "summary": {"hardware": {"numCpuCores": 8, "memorySize": 34359738368u64}},
            "vm": [],
            "datastore": [],
            "configManager": {},
            "overallStatus": "green",
        }))
    }

    pub fn add_cluster(&self, dc: &ManagedObjectRef, name: &str, host_names: &[&str]) -> (ManagedObjectRef, Vec<ManagedObjectRef>) {
        let host_folder = self.folder_of(dc, "hostFolder");
        let mut state = self.lock();
        let cluster = state.create("ClusterComputeResource", json!({"name": name, "parent": host_folder, "host": []}));
        let pool = state.create("ResourcePool", json!({"name": "Resources", "parent": cluster, "resourcePool": [], "vm": []}));
        state.set(&cluster, "resourcePool", json!(pool));
        let mut hosts = Vec::new();
        for host_name in host_names {
            let host = Self::new_host(&mut state, &cluster, host_name);
            Self::attach_host_managers(&mut state, &host);
            state.push_ref(&cluster, "host", &host);
            hosts.push(host);
        }
        state.push_ref(&host_folder, "childEntity", &cluster);
        (cluster, hosts)
    }

    fn attach_host_managers(state: &mut SimState, host: &ManagedObjectRef) {
        let storage = state.create("HostStorageSystem", json!({
            "storageDeviceInfo": {"hostBusAdapter": [
                {"_typeName": "HostBlockHba", "device": "vmhba0"},
                {"_typeName": "HostInternetScsiHba", "device": "vmhba33"},
            ]}
        }));
        let datastore_system = state.create("HostDatastoreSystem", json!({}));
        state.set(host, "configManager.storageSystem", json!(storage));
        state.set(host, "configManager.datastoreSystem", json!(datastore_system));
    }

    pub fn add_datastore(&self, dc: &ManagedObjectRef, name: &str, hosts: &[ManagedObjectRef]) -> ManagedObjectRef {
        let folder = self.folder_of(dc, "datastoreFolder");
        let mut state = self.lock();
        let ds = state.create("Datastore", json!({
            "name": name,
            "parent": folder,
            "summary": {"name": name, "capacity": 1099511627776u64, "freeSpace": 549755813888u64, "accessible": true},
            "overallStatus": "green",
        }));
        let browser = state.create("HostDatastoreBrowser", json!({"datastore": ds}));
        state.set(&ds, "browser", json!(browser));
        state.set(&ds, "host", json!(hosts.iter().map(|h| json!({"key": h})).collect::<Vec<_>>()));
        for host in hosts {
            state.push_ref(host, "datastore", &ds);
        }
        state.push_ref(&folder, "childEntity", &ds);
        ds
    }

    pub fn add_datastore_file(&self, ds: &ManagedObjectRef, path: &str) {
        self.lock().datastore_files.entry(ds.clone()).or_default().push(path.to_string());
    }

    pub fn add_network(&self, dc: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let folder = self.folder_of(dc, "networkFolder");
        let mut state = self.lock();
        let net = state.create("Network", json!({"name": name, "parent": folder, "overallStatus": "green"}));
        state.push_ref(&folder, "childEntity", &net);
        net
    }

    /// VM in the datacenter's VM folder, running on `host` with a default device set
    pub fn add_vm(&self, dc: &ManagedObjectRef, host: &ManagedObjectRef, name: &str, power_state: &str) -> ManagedObjectRef {
        let folder = self.folder_of(dc, "vmFolder");
        let mut state = self.lock();
        let pool: Option<ManagedObjectRef> = serde_json::from_value(state.get(host, "parent"))
            .ok()
            .and_then(|cr: ManagedObjectRef| serde_json::from_value(state.get(&cr, "resourcePool")).ok());
        let config = json!({
            "numCPUs": 1,
            "memoryMB": 512,
            "files": {"vmPathName": "[datastore1]"},
            "deviceChange": [
                {"device": {"_typeName": "VirtualLsiLogicController", "key": 1000, "busNumber": 0, "deviceInfo": {"label": "SCSI controller 0", "summary": "LSI Logic"}}},
                {"device": {"_typeName": "VirtualDisk", "key": 2000, "controllerKey": 1000, "unitNumber": 0, "capacityInKB": 4194304,
                    "deviceInfo": {"label": "Hard disk 1", "summary": "4,194,304 KB"},
                    "backing": {"_typeName": "VirtualDiskFlatVer2BackingInfo", "fileName": format!("[datastore1] {}/{}.vmdk", name, name)}}},
                {"device": {"_typeName": "VirtualCdrom", "key": 3000, "controllerKey": 200, "unitNumber": 0,
                    "deviceInfo": {"label": "CD/DVD drive 1", "summary": "Remote device"},
                    "connectable": {"allowGuestControl": true, "connected": false, "startConnected": false},
                    "backing": {"_typeName": "VirtualCdromRemotePassthroughBackingInfo", "deviceName": ""}}},
                {"device": {"_typeName": "VirtualE1000", "key": 4000,
                    "deviceInfo": {"label": "Network adapter 1", "summary": "VM Network"},
                    "connectable": {"allowGuestControl": true, "connected": true, "startConnected": true},
                    "backing": {"_typeName": "VirtualEthernetCardNetworkBackingInfo", "deviceName": "VM Network"}}},
            ],
        });
        let vm = state.create_vm(&folder, name, &config, pool, Some(host.clone()));
        state.set_power_state(&vm, power_state);
        let datastores = state.get(host, "datastore");
        state.set(&vm, "datastore", datastores);
        state.set(&vm, "layoutEx.file", json!([
            {"type": "config", "name": format!("[datastore1] {}/{}.vmx", name, name)},
            {"type": "diskDescriptor", "name": format!("[datastore1] {}/{}.vmdk", name, name)},
        ]));
        if let Some(guest) = state.guests.get_mut(&vm) {
            guest.dirs.insert("/".to_string());
            guest.dirs.insert("/tmp".to_string());
        }
        vm
    }

    pub fn set_property(&self, obj: &ManagedObjectRef, path: &str, value: Value) {
        self.lock().set(obj, path, value);
    }

    pub fn set_guest_password(&self, vm: &ManagedObjectRef, username: &str, password: &str) {
        self.lock().guests.entry(vm.clone()).or_default().passwords.insert(username.to_string(), password.to_string());
    }
}

/// Inventory builders, fault injection and inspection for tests
#[cfg(test)]
impl Simulator {
    /// Standalone host wrapped in its own compute resource
    pub fn add_host(&self, dc: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let host_folder = self.folder_of(dc, "hostFolder");
        let mut state = self.lock();
        let cr = state.create("ComputeResource", json!({"name": name, "parent": host_folder, "host": []}));
        let pool = state.create("ResourcePool", json!({"name": "Resources", "parent": cr, "resourcePool": [], "vm": []}));
        state.set(&cr, "resourcePool", json!(pool));
        let host = Self::new_host(&mut state, &cr, name);
        Self::attach_host_managers(&mut state, &host);
        state.push_ref(&cr, "host", &host);
        state.push_ref(&host_folder, "childEntity", &cr);
        host
    }

    pub fn property_value(&self, obj: &ManagedObjectRef, path: &str) -> Value {
        self.lock().get(obj, path)
    }

    pub fn exists(&self, obj: &ManagedObjectRef) -> bool {
        self.lock().objects.contains_key(obj)
    }

    /// Property changes applied by the next `WaitForUpdatesEx`
    pub fn queue_update(&self, changes: Vec<(ManagedObjectRef, &str, Value)>) {
        let batch = changes.into_iter().map(|(obj, path, value)| (obj, path.to_string(), value)).collect();
        self.lock().pending_updates.push_back(batch);
    }

    /// Make `method` on `obj` fail synchronously with a fault
    pub fn fail_call(&self, obj: &ManagedObjectRef, method: &str, kind: &str, message: &str) {
        self.lock().call_faults.insert((obj.clone(), method.to_string()), (kind.to_string(), message.to_string()));
    }

    /// Make the task created by `method` on `obj` end in error
    pub fn fail_task(&self, obj: &ManagedObjectRef, method: &str, message: &str) {
        self.lock().task_faults.insert((obj.clone(), method.to_string()), message.to_string());
    }

    pub fn set_vmotion_compatibility(&self, host: &ManagedObjectRef, checks: &[&str]) {
        self.lock().compatibility.insert(host.clone(), checks.iter().map(|c| c.to_string()).collect());
    }

    pub fn add_event(&self, entity: &ManagedObjectRef, type_name: &str, created: &str, message: &str) {
        let mut state = self.lock();
        let key = state.events.len();
        state.events.push((entity.clone(), json!({
            "_typeName": type_name,
            "key": key,
            "createdTime": created,
            "fullFormattedMessage": message,
        })));
    }

    pub fn add_guest_dir(&self, vm: &ManagedObjectRef, path: &str) {
        self.lock().guests.entry(vm.clone()).or_default().dirs.insert(normalize_dir(path));
    }

    pub fn guest_dirs(&self, vm: &ManagedObjectRef) -> Vec<String> {
        self.lock().guests.get(vm).map(|g| g.dirs.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn guest_file(&self, vm: &ManagedObjectRef, path: &str) -> Option<Vec<u8>> {
        self.lock().guests.get(vm).and_then(|g| g.files.get(path).cloned())
    }

    pub fn put_guest_file(&self, vm: &ManagedObjectRef, path: &str, data: &[u8]) {
        self.lock().guests.entry(vm.clone()).or_default().files.insert(path.to_string(), data.to_vec());
    }

    /// Processes started from `program` stay running for `polls_before_exit` status checks
    pub fn script_process(&self, vm: &ManagedObjectRef, program: &str, exit_code: i64, polls_before_exit: u32) {
        self.lock().guests.entry(vm.clone()).or_default().scripts.insert(program.to_string(), ScriptedProcess { exit_code, polls_before_exit });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.lock().calls.iter().filter(|c| c.method == method).cloned().collect()
    }

    pub fn live_filters(&self) -> usize {
        self.lock().live_filters.len()
    }

    pub fn destroyed_filters(&self) -> Vec<ManagedObjectRef> {
        self.lock().destroyed_filters.clone()
    }

    /// Delay every `invoke` by `latency`
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.lock().latency = Some(latency);
    }
}

#[async_trait]
impl ManagementApi for Simulator {
    fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn invoke(&self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<Value, ApiError> {
        #[cfg(test)]
        {
            let latency = self.lock().latency;
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
        }
        self.lock().invoke(obj, method, params)
    }

    async fn property(&self, obj: &ManagedObjectRef, name: &str) -> Result<Value, ApiError> {
        let state = self.lock();
        Ok(state.props(obj)?.get(name).cloned().unwrap_or(Value::Null))
    }

    async fn upload(&self, url: &str, data: Vec<u8>) -> Result<(), ApiError> {
        let mut state = self.lock();
        match state.transfers.remove(url) {
            Some(Transfer::ToGuest { vm, path }) => {
                state.guests.entry(vm).or_default().files.insert(path, data);
                Ok(())
            }
            _ => Err(fault("HttpError", format!("HTTP 404: no pending upload for {}", url))),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        match self.lock().transfers.remove(url) {
            Some(Transfer::FromGuest(data)) => Ok(data),
            _ => Err(fault("HttpError", format!("HTTP 404: no pending download for {}", url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_methods_apply_side_effects() {
        let sim = Simulator::new();
        let dc = sim.add_datacenter("dc1");
        let host = sim.add_host(&dc, "esx1");
        let vm = sim.add_vm(&dc, &host, "vm1", "poweredOff");

        let task = sim.invoke(&vm, "PowerOnVM_Task", Value::Null).await.unwrap();
        let task: ManagedObjectRef = serde_json::from_value(task).unwrap();
        assert_eq!(task.kind, "Task");
        assert_eq!(sim.property_value(&task, "info.state"), json!("success"));
        assert_eq!(sim.property_value(&vm, "summary.runtime.powerState"), json!("poweredOn"));

        let task = sim.invoke(&vm, "PowerOnVM_Task", Value::Null).await.unwrap();
        let task: ManagedObjectRef = serde_json::from_value(task).unwrap();
        assert_eq!(sim.property_value(&task, "info.state"), json!("error"));
    }

    #[tokio::test]
    async fn test_injected_call_fault() {
        let sim = Simulator::new();
        let dc = sim.add_datacenter("dc1");
        sim.fail_call(&dc, "Reload", "NoPermission", "Permission to perform this operation was denied.");
        let err = sim.invoke(&dc, "Reload", Value::Null).await.unwrap_err();
        assert_eq!(err.fault_kind(), Some("NoPermission"));
        assert_eq!(sim.calls_to("Reload").len(), 1);
    }

    #[tokio::test]
    async fn test_retrieve_properties_skips_unset() {
        let sim = Simulator::new();
        let dc = sim.add_datacenter("dc1");
        let result = sim.invoke(&sim.content.property_collector.clone(), "RetrievePropertiesEx", json!({
            "specSet": [{"propSet": [{"type": "Datacenter", "pathSet": ["name", "missing"]}], "objectSet": [{"obj": dc}]}]
        })).await.unwrap();
        let props = result["objects"][0]["propSet"].as_array().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0]["val"], "dc1");
    }

    #[tokio::test]
    async fn test_guest_upload_roundtrip() {
        let sim = Simulator::new();
        let dc = sim.add_datacenter("dc1");
        let host = sim.add_host(&dc, "esx1");
        let vm = sim.add_vm(&dc, &host, "vm1", "poweredOn");
        sim.set_guest_password(&vm, "root", "secret");
        let file_manager = sim.content.guest_operations_manager.clone().unwrap();
        let file_manager: ManagedObjectRef = serde_json::from_value(sim.property_value(&file_manager, "fileManager")).unwrap();
        let auth = json!({"username": "root", "password": "secret"});

        let url = sim.invoke(&file_manager, "InitiateFileTransferToGuest", json!({"vm": vm, "auth": auth, "guestFilePath": "/tmp/a.txt", "overwrite": false})).await.unwrap();
        sim.upload(url.as_str().unwrap(), b"hello".to_vec()).await.unwrap();
        assert_eq!(sim.guest_file(&vm, "/tmp/a.txt"), Some(b"hello".to_vec()));

        let bad = json!({"username": "root", "password": "wrong"});
        let err = sim.invoke(&file_manager, "ListFilesInGuest", json!({"vm": vm, "auth": bad, "filePath": "/tmp"})).await.unwrap_err();
        assert_eq!(err.fault_kind(), Some("InvalidGuestLogin"));
    }
}

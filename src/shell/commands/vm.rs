use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use clap::Parser;
use regex::Regex;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use crate::shell::path::Capability;
use crate::shell::progress::Submission;
use crate::shell::size::parse_size_kb;
use crate::vim::{
    Connection, DeviceBacking, DeviceOperation, DeviceView, Description, DiskMoveType, FileOperation, ManagedObjectRef, OptionValue,
    PropertyFilterSpec, VirtualDevice, VirtualDeviceConfigSpec, VirtualDeviceConnectInfo, VirtualMachineBootOptions,
    VirtualMachineCloneSpec, VirtualMachineConfigSpec, VirtualMachineFileInfo, VirtualMachineRelocateSpec,
};
use super::command_trait::{CommandError, CommandResult, Invocation, ParsedCommand};
use super::context::{CommandContext, Target};
use super::registry::CommandRegistry;

pub fn register(registry: &mut CommandRegistry) {
    fn vm<A: Invocation>() -> ParsedCommand<A> {
        ParsedCommand::<A>::new("vm").operates_on(Capability::VirtualMachine)
    }

    registry.register_command(Arc::new(vm::<On>().alias("on")));
    registry.register_command(Arc::new(vm::<Off>().alias("off")));
    registry.register_command(Arc::new(vm::<Reset>().alias("reset").alias("r")));
    registry.register_command(Arc::new(vm::<Suspend>().alias("suspend").alias("s")));
    registry.register_command(Arc::new(vm::<WaitForShutdown>()));
    registry.register_command(Arc::new(vm::<ShutdownGuest>()));
    registry.register_command(Arc::new(vm::<StandbyGuest>()));
    registry.register_command(Arc::new(vm::<RebootGuest>()));
    registry.register_command(Arc::new(ParsedCommand::<Create>::new("vm").operates_on(Capability::Folder)));
    registry.register_command(Arc::new(vm::<InsertCdrom>()));
    registry.register_command(Arc::new(ParsedCommand::<RegisterVm>::new("vm").operates_on(Capability::DatastoreFile)));
    registry.register_command(Arc::new(vm::<BootConfig>()));
    registry.register_command(Arc::new(vm::<Unregister>()));
    registry.register_command(Arc::new(vm::<Kill>().alias("kill").alias("k")));
    registry.register_command(Arc::new(vm::<Answer>()));
    registry.register_command(Arc::new(vm::<Layout>()));
    registry.register_command(Arc::new(vm::<Devices>()));
    registry.register_command(Arc::new(vm::<Connect>()));
    registry.register_command(Arc::new(vm::<Disconnect>()));
    registry.register_command(Arc::new(ParsedCommand::<Find>::new("vm").operates_on(Capability::Datastore)));
    registry.register_command(Arc::new(vm::<ExtraConfig>().alias("extraConfig")));
    registry.register_command(Arc::new(vm::<SetExtraConfig>().alias("setExtraConfig")));
    registry.register_command(Arc::new(vm::<Ssh>().alias("ssh")));
    registry.register_command(Arc::new(vm::<Ping>().alias("ping")));
    registry.register_command(Arc::new(vm::<Ip>()));
    registry.register_command(Arc::new(vm::<AddNetDevice>()));
    registry.register_command(Arc::new(vm::<AddDisk>()));
    registry.register_command(Arc::new(vm::<RemoveDevice>()));
    registry.register_command(Arc::new(vm::<Migrate>()));
    registry.register_command(Arc::new(vm::<CloneVm>()));
    registry.register_command(Arc::new(vm::<Annotate>()));
    registry.register_command(Arc::new(vm::<ModifyCpu>()));
    registry.register_command(Arc::new(vm::<ModifyMemory>()));
    registry.register_command(Arc::new(vm::<AddCdromDevice>()));
}

async fn device_list(vm: &Target) -> Result<Vec<DeviceView>, CommandError> {
    match vm.connection.get(&vm.obj, "config.hardware.device").await? {
        Value::Array(devices) => Ok(devices.into_iter().map(DeviceView::new).collect()),
        _ => Ok(Vec::new()),
    }
}

async fn device_by_label(vm: &Target, label: &str) -> Result<DeviceView, CommandError> {
    device_list(vm).await?
        .into_iter()
        .find(|dev| dev.label() == label)
        .ok_or_else(|| CommandError::Execution("no such device".to_string()))
}

/// Reconfigure one VM and wait for it
async fn reconfigure(ctx: &CommandContext, vm: &Target, spec: Value) -> Result<(), CommandError> {
    let task = vm.connection.call_task(&vm.obj, "ReconfigVM_Task", json!({"spec": spec})).await;
    ctx.wait_for_task(vm, task).await?;
    Ok(())
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Execution(e.to_string()))
}

/// Resource pool of the first compute resource of the first datacenter
async fn default_pool(conn: &Connection) -> Result<ManagedObjectRef, CommandError> {
    let missing = || CommandError::InvalidArguments("no default resource pool found, use --resource-pool".to_string());
    let datacenter = conn.get_refs(conn.root_folder(), "childEntity").await?
        .into_iter()
        .find(|obj| obj.kind == "Datacenter")
        .ok_or_else(missing)?;
    let host_folder: ManagedObjectRef = conn.get_as(&datacenter, "hostFolder").await?;
    let compute = conn.get_refs(&host_folder, "childEntity").await?.into_iter().next().ok_or_else(missing)?;
    match conn.get(&compute, "resourcePool").await? {
        Value::Null => Err(missing()),
        pool => serde_json::from_value(pool).map_err(|e| CommandError::Fault(e.to_string())),
    }
}

async fn register_vmx(ctx: &CommandContext, folder: &Target, pool: ManagedObjectRef, path: &str) -> CommandResult {
    let task = folder.connection.call_task(&folder.obj, "RegisterVM_Task", json!({
        "path": path,
        "asTemplate": false,
        "pool": pool,
    })).await;
    ctx.wait_for_task(folder, task).await?;
    Ok(String::new())
}

/// Power on VMs
#[derive(Parser, Debug)]
#[command(name = "on")]
struct On {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for On {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        ctx.run_tasks(&vms, "PowerOnVM_Task", json!({})).await
    }
}

/// Power off VMs
#[derive(Parser, Debug)]
#[command(name = "off")]
struct Off {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for Off {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        ctx.run_tasks(&vms, "PowerOffVM_Task", json!({})).await
    }
}

/// Reset VMs
#[derive(Parser, Debug)]
#[command(name = "reset")]
struct Reset {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for Reset {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        ctx.run_tasks(&vms, "ResetVM_Task", json!({})).await
    }
}

/// Suspend VMs
#[derive(Parser, Debug)]
#[command(name = "suspend")]
struct Suspend {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for Suspend {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        ctx.run_tasks(&vms, "SuspendVM_Task", json!({})).await
    }
}

async fn wait_for_power_off(vms: &[Target], timeout: Duration, delay: Duration) -> CommandResult {
    let poll = async {
        let mut ticker = tokio::time::interval(delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut all_off = true;
            for vm in vms {
                if vm.connection.get_str(&vm.obj, "summary.runtime.powerState").await? == "poweredOn" {
                    all_off = false;
                    break;
                }
            }
            if all_off {
                return Ok::<(), CommandError>(());
            }
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result.map(|()| String::new()),
        Err(_) => Err(CommandError::Timeout("At least one VM did not shut down!".to_string())),
    }
}

/// Waits for a VM to shutdown
#[derive(Parser, Debug)]
#[command(name = "wait_for_shutdown")]
struct WaitForShutdown {
    #[arg(required = true)]
    vms: Vec<String>,
    /// Timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
    /// Interval in seconds
    #[arg(long, default_value_t = 5)]
    delay: u64,
}

#[async_trait]
impl Invocation for WaitForShutdown {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        ctx.interruptible(wait_for_power_off(&vms, Duration::from_secs(self.timeout), Duration::from_secs(self.delay.max(1)))).await
    }
}

/// Shut down guest OS
#[derive(Parser, Debug)]
#[command(name = "shutdown_guest")]
struct ShutdownGuest {
    #[arg(required = true)]
    vms: Vec<String>,
    /// Wait this many seconds for the guests to shut down
    #[arg(long)]
    timeout: Option<u64>,
    /// Interval between checks for guest shut down in seconds
    #[arg(long, default_value_t = 5)]
    delay: u64,
}

#[async_trait]
impl Invocation for ShutdownGuest {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        for vm in &vms {
            vm.connection.call(&vm.obj, "ShutdownGuest", json!({})).await?;
        }
        match self.timeout {
            Some(timeout) => ctx.interruptible(wait_for_power_off(&vms, Duration::from_secs(timeout), Duration::from_secs(self.delay.max(1)))).await,
            None => Ok(String::new()),
        }
    }
}

/// Suspend guest OS
#[derive(Parser, Debug)]
#[command(name = "standby_guest")]
struct StandbyGuest {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for StandbyGuest {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        for vm in ctx.targets(&self.vms, Capability::VirtualMachine).await? {
            vm.connection.call(&vm.obj, "StandbyGuest", json!({})).await?;
        }
        Ok(String::new())
    }
}

/// Reboot guest OS
#[derive(Parser, Debug)]
#[command(name = "reboot_guest")]
struct RebootGuest {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for RebootGuest {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        for vm in ctx.targets(&self.vms, Capability::VirtualMachine).await? {
            vm.connection.call(&vm.obj, "RebootGuest", json!({})).await?;
        }
        Ok(String::new())
    }
}

/// Create a new VM
///
/// Example:
///   vm.create -p ~foo/resourcePool/pools/prod -d ~data/bigdisk -s 10g ~vms/new
#[derive(Parser, Debug)]
#[command(name = "create")]
struct Create {
    /// Destination
    path: String,
    /// Resource pool
    #[arg(short, long)]
    pool: Option<String>,
    /// Host
    #[arg(long)]
    host: Option<String>,
    /// Datastore
    #[arg(short, long)]
    datastore: Option<String>,
    /// Size in KB of primary disk (or add a unit of <M|G|T>)
    #[arg(short = 's', long, default_value = "4000000")]
    disksize: String,
    /// Size in MB of memory
    #[arg(short, long, default_value_t = 128)]
    memory: i64,
    /// Number of CPUs
    #[arg(short, long, default_value_t = 1)]
    cpucount: i32,
}

impl Create {
    /// Controller, thin disk, CD-ROM and NIC, all on `datastore_path`
    fn config(&self, name: &str, datastore_path: &str, disk_kb: u64) -> VirtualMachineConfigSpec {
        VirtualMachineConfigSpec {
            name: Some(name.to_string()),
            guest_id: Some("otherGuest".to_string()),
            files: Some(VirtualMachineFileInfo {
                vm_path_name: datastore_path.to_string(),
            }),
            num_cpus: Some(self.cpucount),
            memory_mb: Some(self.memory),
            device_change: vec![
                VirtualDeviceConfigSpec::add(VirtualDevice::LsiLogicController {
                    key: 1000,
                    bus_number: 0,
                    shared_bus: "noSharing".to_string(),
                }),
                VirtualDeviceConfigSpec::create(VirtualDevice::Disk {
                    key: -1,
                    device_info: None,
                    backing: DeviceBacking::FlatDisk {
                        file_name: datastore_path.to_string(),
                        disk_mode: "persistent".to_string(),
                        thin_provisioned: true,
                    },
                    controller_key: 1000,
                    unit_number: 0,
                    capacity_in_kb: disk_kb,
                }),
                VirtualDeviceConfigSpec::add(VirtualDevice::Cdrom {
                    key: -2,
                    device_info: None,
                    connectable: VirtualDeviceConnectInfo::connected(),
                    backing: DeviceBacking::CdromIso {
                        file_name: datastore_path.to_string(),
                    },
                    controller_key: 200,
                    unit_number: 0,
                }),
                VirtualDeviceConfigSpec::add(VirtualDevice::E1000 {
                    key: -3,
                    device_info: Description {
                        label: "Network Adapter 1".to_string(),
                        summary: "VM Network".to_string(),
                    },
                    backing: DeviceBacking::Network {
                        device_name: "VM Network".to_string(),
                    },
                    address_type: "generated".to_string(),
                }),
            ],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Invocation for Create {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let pool = self.pool.as_deref().ok_or_else(|| CommandError::InvalidArguments("must specify resource pool (--pool)".to_string()))?;
        let datastore = self.datastore.as_deref().ok_or_else(|| CommandError::InvalidArguments("must specify datastore (--datastore)".to_string()))?;
        if self.memory % 4 != 0 {
            return Err(CommandError::InvalidArguments("memory must be a multiple of 4MB".to_string()));
        }
        let disk_kb = parse_size_kb(&self.disksize)?;

        let (folder, name) = ctx.resolve_parent(&self.path, Capability::Folder).await?;
        let pool = ctx.target(pool, Capability::ResourcePool).await?;
        let datastore = ctx.target(datastore, Capability::Datastore).await?;
        let host = ctx.optional_target(self.host.as_deref(), Capability::HostSystem).await?;

        let datastore_path = format!("[{}]", datastore.connection.name_of(&datastore.obj).await?);
        let config = self.config(&name, &datastore_path, disk_kb);
        let mut params = json!({"config": to_value(config)?, "pool": pool.obj});
        if let Some(host) = host {
            params["host"] = json!(host.obj);
        }
        let task = folder.connection.call_task(&folder.obj, "CreateVM_Task", params).await;
        ctx.wait_for_task(&folder, task).await?;
        Ok(String::new())
    }
}

/// Put a disc in a virtual CDROM drive
#[derive(Parser, Debug)]
#[command(name = "insert_cdrom")]
struct InsertCdrom {
    vm: String,
    /// Path to the ISO image on a datastore
    iso: String,
}

#[async_trait]
impl Invocation for InsertCdrom {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let iso = ctx.resolve_single(&self.iso, Capability::DatastoreFile).await?;
        let iso_path = iso.datastore_path().ok_or_else(|| CommandError::InvalidArguments(format!("{} is not on a datastore", iso)))?;

        let device = device_list(&vm).await?
            .into_iter()
            .find(DeviceView::is_cdrom)
            .ok_or_else(|| CommandError::Execution("No virtual CDROM drive found".to_string()))?;
        let mut raw = device.raw;
        raw["backing"] = to_value(DeviceBacking::CdromIso { file_name: iso_path })?;
        reconfigure(ctx, &vm, json!({"deviceChange": [VirtualDeviceConfigSpec::edit(raw)]})).await?;
        Ok(String::new())
    }
}

/// Register a VM already in a datastore
#[derive(Parser, Debug)]
#[command(name = "register")]
struct RegisterVm {
    /// Path to the VMX file
    file: String,
    /// Resource pool
    #[arg(short = 'R', long)]
    resource_pool: Option<String>,
    /// VM folder
    #[arg(short = 'F', long, default_value = ".")]
    folder: String,
}

#[async_trait]
impl Invocation for RegisterVm {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vmx = ctx.resolve_single(&self.file, Capability::DatastoreFile).await?;
        let vmx_path = vmx.datastore_path().ok_or_else(|| CommandError::InvalidArguments(format!("{} is not on a datastore", vmx)))?;
        let folder = ctx.target(&self.folder, Capability::Folder).await?;
        let pool = match ctx.optional_target(self.resource_pool.as_deref(), Capability::ResourcePool).await? {
            Some(pool) => pool.obj,
            None => default_pool(&folder.connection).await?,
        };
        register_vmx(ctx, &folder, pool, &vmx_path).await
    }
}

/// Alter the boot config settings
#[derive(Parser, Debug)]
#[command(name = "bootconfig")]
struct BootConfig {
    vm: String,
    /// Time in milliseconds to delay boot
    #[arg(short, long)]
    delay: Option<i64>,
    /// Enable rebooting if no boot device found
    #[arg(short = 'r', long, conflicts_with = "disablebootretry")]
    enablebootretry: bool,
    /// Disable rebooting if no boot device found
    #[arg(long)]
    disablebootretry: bool,
    /// Time to wait before rebooting to retry
    #[arg(short = 't', long)]
    retrydelay: Option<i64>,
    /// Show the current bootoptions
    #[arg(short, long)]
    show: bool,
}

#[async_trait]
impl Invocation for BootConfig {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let current = vm.connection.get(&vm.obj, "config.bootOptions").await?;
        let cur_delay = current.get("bootDelay").and_then(Value::as_i64).unwrap_or(0);
        let cur_retry_delay = current.get("bootRetryDelay").and_then(Value::as_i64).unwrap_or(0);
        let cur_retry_enabled = current.get("bootRetryEnabled").and_then(Value::as_bool).unwrap_or(false);

        if self.show {
            return Ok(format!(
                "bootDelay: {}\nbootRetryDelay: {}\nbootRetryEnabled: {}\n",
                cur_delay, cur_retry_delay, cur_retry_enabled
            ));
        }

        let retry_delay_changed = self.retrydelay.is_some_and(|d| d != cur_retry_delay);
        let retry_enabled = if self.enablebootretry {
            true
        } else if self.disablebootretry {
            false
        } else {
            retry_delay_changed || cur_retry_enabled
        };
        let options = VirtualMachineBootOptions {
            boot_delay: Some(self.delay.unwrap_or(cur_delay)),
            boot_retry_delay: Some(self.retrydelay.unwrap_or(cur_retry_delay)),
            boot_retry_enabled: Some(retry_enabled),
        };
        let spec = VirtualMachineConfigSpec {
            boot_options: Some(options),
            ..Default::default()
        };
        reconfigure(ctx, &vm, to_value(spec)?).await?;
        Ok(String::new())
    }
}

/// Unregister a VM
#[derive(Parser, Debug)]
#[command(name = "unregister")]
struct Unregister {
    vm: String,
}

#[async_trait]
impl Invocation for Unregister {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        vm.connection.call(&vm.obj, "UnregisterVM", json!({})).await?;
        Ok(String::new())
    }
}

/// Power off and destroy VMs
#[derive(Parser, Debug)]
#[command(name = "kill")]
struct Kill {
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for Kill {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        let mut running = Vec::new();
        for vm in &vms {
            if vm.connection.get_str(&vm.obj, "summary.runtime.powerState").await? == "poweredOn" {
                running.push(vm.clone());
            }
        }
        let mut out = String::new();
        if !running.is_empty() {
            out.push_str(&ctx.run_tasks(&running, "PowerOffVM_Task", json!({})).await?);
        }
        out.push_str(&ctx.run_tasks(&vms, "Destroy_Task", json!({})).await?);
        Ok(out)
    }
}

/// Answer a VM question
#[derive(Parser, Debug)]
#[command(name = "answer")]
struct Answer {
    /// Answer label
    choice: String,
    #[arg(required = true)]
    vms: Vec<String>,
}

#[async_trait]
impl Invocation for Answer {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        for vm in ctx.targets(&self.vms, Capability::VirtualMachine).await? {
            let question = vm.connection.get(&vm.obj, "runtime.question").await?;
            if question.is_null() {
                continue;
            }
            let choice = question.pointer("/choice/choiceInfo")
                .and_then(Value::as_array)
                .and_then(|choices| choices.iter().find(|c| c.get("label").and_then(Value::as_str) == Some(self.choice.as_str())))
                .and_then(|c| c.get("key").cloned())
                .ok_or_else(|| CommandError::InvalidArguments("invalid answer".to_string()))?;
            let id = question.get("id").cloned().unwrap_or(Value::Null);
            vm.connection.call(&vm.obj, "AnswerVM", json!({"questionId": id, "answerChoice": choice})).await?;
        }
        Ok(String::new())
    }
}

/// Display info about VM files
#[derive(Parser, Debug)]
#[command(name = "layout")]
struct Layout {
    vm: String,
}

#[async_trait]
impl Invocation for Layout {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let files = vm.connection.get(&vm.obj, "layoutEx.file").await?;
        Ok(files.as_array().into_iter().flatten()
            .map(|f| format!(
                "{}: {}\n",
                f.get("type").and_then(Value::as_str).unwrap_or(""),
                f.get("name").and_then(Value::as_str).unwrap_or("")
            ))
            .collect())
    }
}

/// Display info about VM devices
#[derive(Parser, Debug)]
#[command(name = "devices")]
struct Devices {
    vm: String,
}

#[async_trait]
impl Invocation for Devices {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        Ok(device_list(&vm).await?
            .iter()
            .map(|dev| {
                let tag = match dev.connected() {
                    Some(true) => "; connected",
                    Some(false) => "; disconnected",
                    None => "",
                };
                format!("{} ({}): {}{}\n", dev.label(), dev.type_name(), dev.summary(), tag)
            })
            .collect())
    }
}

async fn change_device_connectivity(ctx: &CommandContext, path: &str, label: &str, connected: bool) -> CommandResult {
    let vm = ctx.target(path, Capability::VirtualMachine).await?;
    let device = device_by_label(&vm, label).await?;
    if device.connected().is_none() {
        return Err(CommandError::Execution(format!("device {:?} cannot be connected", label)));
    }
    let mut raw = device.raw;
    raw["connectable"]["connected"] = json!(connected);
    reconfigure(ctx, &vm, json!({"deviceChange": [VirtualDeviceConfigSpec::edit(raw)]})).await?;
    Ok(String::new())
}

/// Connect a virtual device
#[derive(Parser, Debug)]
#[command(name = "connect")]
struct Connect {
    vm: String,
    /// Device label
    label: String,
}

#[async_trait]
impl Invocation for Connect {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        change_device_connectivity(ctx, &self.vm, &self.label, true).await
    }
}

/// Disconnect a virtual device
#[derive(Parser, Debug)]
#[command(name = "disconnect")]
struct Disconnect {
    vm: String,
    /// Device label
    label: String,
}

#[async_trait]
impl Invocation for Disconnect {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        change_device_connectivity(ctx, &self.vm, &self.label, false).await
    }
}

/// Display a menu of VMX files to register
#[derive(Parser, Debug)]
#[command(name = "find")]
struct Find {
    datastore: String,
    /// Resource pool
    #[arg(short = 'R', long)]
    resource_pool: Option<String>,
    /// Folder to register in
    #[arg(short = 'F', long, default_value = ".")]
    folder: String,
}

impl Find {
    async fn vmx_files(ctx: &CommandContext, datastore: &Target) -> Result<Vec<String>, CommandError> {
        let conn = &datastore.connection;
        let browser: ManagedObjectRef = conn.get_as(&datastore.obj, "browser").await?;
        let search_spec = json!({
            "_typeName": "HostDatastoreBrowserSearchSpec",
            "details": {"_typeName": "FileQueryFlags", "fileOwner": false, "fileSize": false, "fileType": true, "modification": false},
            "query": [{"_typeName": "VmConfigFileQuery"}],
        });
        let task = conn.call_task(&browser, "SearchDatastoreSubFolders_Task", json!({
            "datastorePath": format!("[{}] /", conn.name_of(&datastore.obj).await?),
            "searchSpec": search_spec,
        })).await;
        let results = ctx.wait_for_task(datastore, task).await?.unwrap_or(Value::Null);

        let mut files = Vec::new();
        for result in results.as_array().into_iter().flatten() {
            let folder = result.get("folderPath").and_then(Value::as_str).unwrap_or("");
            for file in result.get("file").and_then(Value::as_array).into_iter().flatten() {
                if let Some(path) = file.get("path").and_then(Value::as_str) {
                    files.push(format!("{}/{}", folder.trim_end_matches('/'), path));
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl Invocation for Find {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let datastore = ctx.target(&self.datastore, Capability::Datastore).await?;
        let folder = ctx.target(&self.folder, Capability::Folder).await?;
        let pool = match ctx.optional_target(self.resource_pool.as_deref(), Capability::ResourcePool).await? {
            Some(pool) => pool.obj,
            None => default_pool(&folder.connection).await?,
        };

        let paths = Self::vmx_files(ctx, &datastore).await?;
        if paths.is_empty() {
            return Ok("no VMX files found\n".to_string());
        }
        let Some(choice) = ctx.console.select("Select a VMX file", &paths)? else {
            return Ok(String::new());
        };
        let path = paths.get(choice).ok_or_else(|| CommandError::InvalidArguments("invalid selection".to_string()))?;
        register_vmx(ctx, &folder, pool, path).await
    }
}

/// Display extraConfig options
#[derive(Parser, Debug)]
#[command(name = "extra_config")]
struct ExtraConfig {
    vm: String,
    /// Regexes to filter keys
    regexes: Vec<String>,
}

#[async_trait]
impl Invocation for ExtraConfig {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let regexes = self.regexes.iter()
            .map(|r| Regex::new(r).map_err(|e| CommandError::InvalidArguments(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let options = vm.connection.get(&vm.obj, "config.extraConfig").await?;

        let mut out = String::new();
        for option in options.as_array().into_iter().flatten() {
            let key = option.get("key").and_then(Value::as_str).unwrap_or("");
            if !regexes.is_empty() && !regexes.iter().any(|r| r.is_match(key)) {
                continue;
            }
            let value = match option.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            out.push_str(&format!("{}: {}\n", key, value));
        }
        Ok(out)
    }
}

/// Set extraConfig options
#[derive(Parser, Debug)]
#[command(name = "set_extra_config")]
struct SetExtraConfig {
    vm: String,
    /// key=value pairs; a key without value removes it
    #[arg(required = true)]
    pairs: Vec<String>,
}

#[async_trait]
impl Invocation for SetExtraConfig {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let options: Vec<OptionValue> = self.pairs.iter()
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                OptionValue::string(key, value)
            })
            .collect();
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let spec = VirtualMachineConfigSpec {
            extra_config: options,
            ..Default::default()
        };
        reconfigure(ctx, &vm, to_value(spec)?).await?;
        Ok(String::new())
    }
}

const IP_PROPERTIES: [&str; 3] = ["summary.runtime.powerState", "summary.guest.ipAddress", "summary.config.annotation"];

/// Where a VM stands on the way to having an address
#[derive(Debug, PartialEq, Eq)]
enum GuestIp {
    Known(String),
    NotPoweredOn,
    Unknown,
}

impl GuestIp {
    fn require(self) -> Result<String, CommandError> {
        match self {
            GuestIp::Known(ip) => Ok(ip),
            GuestIp::NotPoweredOn => Err(CommandError::Execution("VM is not powered on".to_string())),
            GuestIp::Unknown => Err(CommandError::Execution("no IP known for this VM".to_string())),
        }
    }
}

/// `ip` entry of an annotation written as `key: value` lines
fn annotation_ip(annotation: &str) -> Option<String> {
    annotation.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "ip")
        .map(|(_, value)| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|ip| !ip.is_empty())
}

async fn guest_ip(conn: &Connection, vm: &ManagedObjectRef) -> Result<GuestIp, CommandError> {
    let contents = conn.retrieve(std::slice::from_ref(vm), &IP_PROPERTIES).await?;
    let Some(content) = contents.into_iter().next() else {
        return Ok(GuestIp::Unknown);
    };
    if content.get_str("summary.runtime.powerState") != Some("poweredOn") {
        return Ok(GuestIp::NotPoweredOn);
    }
    if let Some(ip) = content.get_str("summary.guest.ipAddress").filter(|ip| !ip.is_empty() && *ip != "127.0.0.1") {
        return Ok(GuestIp::Known(ip.to_string()));
    }
    Ok(content.get_str("summary.config.annotation")
        .and_then(annotation_ip)
        .map(GuestIp::Known)
        .unwrap_or(GuestIp::Unknown))
}

/// SSH to a VM
#[derive(Parser, Debug)]
#[command(name = "ssh")]
struct Ssh {
    vm: String,
    /// Optional command
    cmd: Option<String>,
    /// Username
    #[arg(short, long, default_value = "root")]
    login: String,
}

#[async_trait]
impl Invocation for Ssh {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let ip = guest_ip(&vm.connection, &vm.obj).await?.require()?;
        let mut command = tokio::process::Command::new("ssh");
        command.args(["-o", "UserKnownHostsFile=/dev/null", "-o", "StrictHostKeyChecking=no", "-l", self.login.as_str(), ip.as_str()]);
        if let Some(cmd) = &self.cmd {
            command.arg(cmd);
        }
        run_foreground(command, "ssh").await
    }
}

async fn run_foreground(mut command: tokio::process::Command, program: &str) -> CommandResult {
    log::debug!("running {:?}", command);
    let status = command.status().await?;
    if status.success() {
        Ok(String::new())
    } else {
        Err(CommandError::Execution(format!("{} exited with {}", program, status)))
    }
}

/// Ping a VM
#[derive(Parser, Debug)]
#[command(name = "ping")]
struct Ping {
    vm: String,
    /// Stop after this many packets
    #[arg(short, long)]
    count: Option<u32>,
}

#[async_trait]
impl Invocation for Ping {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let ip = guest_ip(&vm.connection, &vm.obj).await?.require()?;
        let mut command = tokio::process::Command::new("ping");
        if let Some(count) = self.count {
            command.arg("-c").arg(count.to_string());
        }
        command.arg(ip);
        run_foreground(command, "ping").await
    }
}

/// Wait for and display VM IP addresses
#[derive(Parser, Debug)]
#[command(name = "ip")]
struct Ip {
    #[arg(required = true)]
    vms: Vec<String>,
    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[async_trait]
impl Invocation for Ip {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        let Some(conn) = vms.first().map(|vm| vm.connection.clone()) else {
            return Ok(String::new());
        };
        if vms.iter().any(|vm| vm.connection.name() != conn.name()) {
            return Err(CommandError::InvalidArguments("all VMs must be on the same connection".to_string()));
        }
        let collector = conn.content().property_collector.clone();

        let mut filters = Vec::new();
        let mut created = Ok(());
        for vm in &vms {
            let spec = PropertyFilterSpec::for_objects(std::slice::from_ref(&vm.obj), &IP_PROPERTIES);
            let filter = conn.call(&collector, "CreateFilter", json!({"spec": spec, "partialUpdates": false})).await
                .map_err(CommandError::from)
                .and_then(|f| serde_json::from_value::<ManagedObjectRef>(f).map_err(|e| CommandError::Fault(e.to_string())));
            match filter {
                Ok(filter) => filters.push(filter),
                Err(e) => {
                    created = Err(e);
                    break;
                }
            }
        }

        let mut out = String::new();
        let mut pending = vms;
        let outcome = match created {
            Ok(()) => {
                let wait = wait_for_ips(&conn, &collector, &mut pending, &mut out, ctx.settings.poll_interval());
                let bounded = async {
                    match self.timeout {
                        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait).await
                            .unwrap_or_else(|_| Err(CommandError::Timeout(String::new()))),
                        None => wait.await,
                    }
                };
                ctx.interruptible(bounded).await
            }
            Err(e) => Err(e),
        };

        for filter in filters {
            if let Err(e) = conn.call(&filter, "DestroyPropertyFilter", json!({})).await {
                log::warn!("failed to destroy property filter {}: {}", filter, e);
            }
        }

        match outcome {
            Ok(()) => Ok(out),
            Err(CommandError::Timeout(_)) => Err(CommandError::Timeout(format!(
                "{}Timed out waiting for the IP of {} VMs",
                out,
                pending.len()
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Drop VMs from `pending` as their address becomes known, long-polling for changes in between
async fn wait_for_ips(
    conn: &Connection,
    collector: &ManagedObjectRef,
    pending: &mut Vec<Target>,
    out: &mut String,
    poll_interval: Duration,
) -> Result<(), CommandError> {
    let mut version = String::new();
    loop {
        // `pending` only shrinks once an address is printed, so it stays
        // accurate when the wait is cut short
        let mut index = 0;
        while index < pending.len() {
            match guest_ip(conn, &pending[index].obj).await? {
                GuestIp::Known(ip) => {
                    let vm = pending.remove(index);
                    out.push_str(&format!("{}: {}\n", vm.name(), ip));
                }
                _ => index += 1,
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let update = conn.call(collector, "WaitForUpdatesEx", json!({
            "version": version,
            "options": {"_typeName": "WaitOptions", "maxWaitSeconds": 60},
        })).await?;
        match update.get("version").and_then(Value::as_str) {
            Some(next) => version = next.to_string(),
            None => tokio::time::sleep(poll_interval).await,
        }
    }
}

/// Add a network adapter to a virtual machine
#[derive(Parser, Debug)]
#[command(name = "add_net_device")]
struct AddNetDevice {
    vm: String,
    /// Adapter type
    #[arg(long = "type", default_value = "e1000", value_parser = ["e1000", "vmxnet3"])]
    kind: String,
    /// Network to connect to
    #[arg(long, default_value = "VM Network")]
    network: String,
}

#[async_trait]
impl Invocation for AddNetDevice {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let device_info = Description {
            label: uuid::Uuid::new_v4().to_string(),
            summary: self.network.clone(),
        };
        let backing = DeviceBacking::Network { device_name: self.network };
        let address_type = "generated".to_string();
        let device = match self.kind.as_str() {
            "vmxnet3" => VirtualDevice::Vmxnet3 { key: -1, device_info, backing, address_type },
            _ => VirtualDevice::E1000 { key: -1, device_info, backing, address_type },
        };
        reconfigure(ctx, &vm, json!({"deviceChange": [VirtualDeviceConfigSpec::add(device)]})).await?;
        Ok(String::new())
    }
}

/// Add a hard drive to a virtual machine
#[derive(Parser, Debug)]
#[command(name = "add_disk")]
struct AddDisk {
    vm: String,
    /// Label
    #[arg(long)]
    label: Option<String>,
    /// Size
    #[arg(long, default_value = "1G")]
    size: String,
}

#[async_trait]
impl Invocation for AddDisk {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let capacity = parse_size_kb(&self.size)?;
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let devices = device_list(&vm).await?;
        let controller = devices.iter()
            .find(|dev| dev.is_lsi_logic_controller())
            .and_then(DeviceView::key)
            .ok_or_else(|| CommandError::Execution("no LSI Logic controller found".to_string()))?;
        let unit_number = devices.iter()
            .filter(|dev| dev.controller_key() == Some(controller))
            .filter_map(DeviceView::unit_number)
            .max()
            .map_or(0, |max| max + 1);

        let id = format!("disk-{}-{}", controller, unit_number);
        let vmx = vm.connection.get_str(&vm.obj, "summary.config.vmPathName").await?;
        let dir = vmx.rsplit_once('/').map_or(vmx.as_str(), |(dir, _)| dir);
        let disk = VirtualDevice::Disk {
            key: -1,
            device_info: self.label.map(|label| Description { label, summary: String::new() }),
            backing: DeviceBacking::FlatDisk {
                file_name: format!("{}/{}.vmdk", dir, id),
                disk_mode: "persistent".to_string(),
                thin_provisioned: true,
            },
            controller_key: controller as i32,
            unit_number: unit_number as i32,
            capacity_in_kb: capacity,
        };
        reconfigure(ctx, &vm, json!({"deviceChange": [VirtualDeviceConfigSpec::create(disk)]})).await?;

        let added = device_list(&vm).await?
            .into_iter()
            .find(|dev| dev.controller_key() == Some(controller) && dev.unit_number() == Some(unit_number))
            .map(|dev| dev.label().to_string())
            .unwrap_or(id);
        Ok(format!("Added device {:?}\n", added))
    }
}

/// Remove a virtual device
#[derive(Parser, Debug)]
#[command(name = "remove_device")]
struct RemoveDevice {
    vm: String,
    /// Device label
    label: String,
}

#[async_trait]
impl Invocation for RemoveDevice {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let device = device_by_label(&vm, &self.label).await?;
        // An ISO stays on the datastore when its drive goes away
        let file_operation = (device.is_disk() && device.has_file_backing()).then_some(FileOperation::Destroy);
        reconfigure(ctx, &vm, json!({"deviceChange": [VirtualDeviceConfigSpec::remove(device.raw, file_operation)]})).await?;
        Ok(String::new())
    }
}

/// Migrate a VM
#[derive(Parser, Debug)]
#[command(name = "migrate")]
struct Migrate {
    #[arg(required = true)]
    vms: Vec<String>,
    /// Resource pool
    #[arg(short, long)]
    pool: Option<String>,
    /// Host
    #[arg(long)]
    host: Option<String>,
}

#[async_trait]
impl Invocation for Migrate {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vms = ctx.targets(&self.vms, Capability::VirtualMachine).await?;
        let mut params = json!({"priority": "defaultPriority"});
        if let Some(pool) = ctx.optional_target(self.pool.as_deref(), Capability::ResourcePool).await? {
            params["pool"] = json!(pool.obj);
        }
        if let Some(host) = ctx.optional_target(self.host.as_deref(), Capability::HostSystem).await? {
            params["host"] = json!(host.obj);
        }
        ctx.run_tasks(&vms, "MigrateVM_Task", params).await
    }
}

/// Clone a VM
#[derive(Parser, Debug)]
#[command(name = "clone")]
struct CloneVm {
    src: String,
    /// Path to new VM
    dst: String,
    /// Resource pool
    #[arg(short, long)]
    pool: Option<String>,
    /// Host
    #[arg(long)]
    host: Option<String>,
    /// Create a template
    #[arg(short, long)]
    template: bool,
    /// Create a linked clone
    #[arg(short, long)]
    linked: bool,
    /// Power on VM after clone
    #[arg(long)]
    power_on: bool,
}

/// Put a delta disk on top of every disk that has no parent yet
async fn deltaize_disks(ctx: &CommandContext, vm: &Target) -> Result<bool, CommandError> {
    let mut device_change = Vec::new();
    for disk in device_list(vm).await?.into_iter().filter(DeviceView::is_disk) {
        if disk.raw.pointer("/backing/parent").is_some_and(|p| !p.is_null()) {
            continue;
        }
        let file_name = disk.backing_file_name().unwrap_or("");
        let datastore = match file_name.find(']') {
            Some(end) => &file_name[..=end],
            None => file_name,
        };
        let mut delta = disk.raw.clone();
        delta["backing"]["fileName"] = json!(datastore);
        delta["backing"]["parent"] = disk.raw["backing"].clone();
        device_change.push(to_value(VirtualDeviceConfigSpec::remove(disk.raw, None))?);
        device_change.push(to_value(VirtualDeviceConfigSpec {
            operation: DeviceOperation::Add,
            file_operation: Some(FileOperation::Create),
            device: delta,
        })?);
    }
    if device_change.is_empty() {
        return Ok(false);
    }
    reconfigure(ctx, vm, json!({"deviceChange": device_change})).await?;
    Ok(true)
}

#[async_trait]
impl Invocation for CloneVm {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let src = ctx.target(&self.src, Capability::VirtualMachine).await?;
        let (folder, name) = ctx.resolve_parent(&self.dst, Capability::Folder).await?;
        let pool = ctx.optional_target(self.pool.as_deref(), Capability::ResourcePool).await?;
        let host = ctx.optional_target(self.host.as_deref(), Capability::HostSystem).await?;

        let mut out = String::new();
        let mut disk_move_type = None;
        if self.linked {
            if deltaize_disks(ctx, &src).await? {
                out.push_str("Reconfiguring source VM to use delta disks...\n");
            }
            disk_move_type = Some(DiskMoveType::MoveChildMostDiskBacking);
        }

        let spec = VirtualMachineCloneSpec {
            location: VirtualMachineRelocateSpec {
                disk_move_type,
                host: host.map(|h| h.obj),
                pool: pool.map(|p| p.obj),
            },
            template: self.template,
            power_on: self.power_on,
        };
        let task = src.connection.call_task(&src.obj, "CloneVM_Task", json!({
            "folder": folder.obj,
            "name": name,
            "spec": spec,
        })).await;
        let report = ctx.track(vec![Submission::new(name, src.connection.clone(), task)]).await?;
        out.push_str(&report.render());
        Ok(out)
    }
}

/// Change a VM's annotation
#[derive(Parser, Debug)]
#[command(name = "annotate")]
struct Annotate {
    vm: String,
    annotation: String,
}

#[async_trait]
impl Invocation for Annotate {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let spec = VirtualMachineConfigSpec {
            annotation: Some(self.annotation),
            ..Default::default()
        };
        reconfigure(ctx, &vm, to_value(spec)?).await?;
        Ok(String::new())
    }
}

/// Change CPU configuration
#[derive(Parser, Debug)]
#[command(name = "modify_cpu")]
struct ModifyCpu {
    vm: String,
    /// New number of CPUs
    #[arg(long)]
    num: i32,
}

#[async_trait]
impl Invocation for ModifyCpu {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let spec = VirtualMachineConfigSpec {
            num_cpus: Some(self.num),
            ..Default::default()
        };
        ctx.run_tasks(&[vm], "ReconfigVM_Task", json!({"spec": to_value(spec)?})).await
    }
}

/// Change memory configuration
#[derive(Parser, Debug)]
#[command(name = "modify_memory")]
struct ModifyMemory {
    vm: String,
    /// New memory size in MB
    #[arg(long)]
    size: i64,
}

#[async_trait]
impl Invocation for ModifyMemory {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        if self.size % 4 != 0 {
            return Err(CommandError::InvalidArguments("memory must be a multiple of 4MB".to_string()));
        }
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        if vm.connection.get_str(&vm.obj, "summary.runtime.powerState").await? != "poweredOff" {
            return Err(CommandError::Execution("VM needs to be off".to_string()));
        }
        let spec = VirtualMachineConfigSpec {
            memory_mb: Some(self.size),
            ..Default::default()
        };
        ctx.run_tasks(&[vm], "ReconfigVM_Task", json!({"spec": to_value(spec)?})).await
    }
}

/// Add a cdrom drive
#[derive(Parser, Debug)]
#[command(name = "add_cdrom_device")]
struct AddCdromDevice {
    vm: String,
    /// Device label
    #[arg(long, default_value = "CD/DVD drive 1")]
    label: String,
}

#[async_trait]
impl Invocation for AddCdromDevice {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let device = VirtualDevice::Cdrom {
            key: 3000,
            device_info: Some(Description {
                label: self.label.clone(),
                summary: self.label.clone(),
            }),
            connectable: VirtualDeviceConnectInfo::connected(),
            backing: DeviceBacking::CdromAtapi {
                device_name: self.label,
                use_auto_detect: false,
            },
            controller_key: 200,
            unit_number: 0,
        };
        ctx.run_tasks(&[vm], "ReconfigVM_Task", json!({"spec": {"deviceChange": [VirtualDeviceConfigSpec::add(device)]}})).await
    }
}

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use clap::Parser;
use rand::seq::IndexedRandom;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use crate::shell::path::Capability;
use crate::shell::progress::Submission;
use crate::vim::{HostConnectSpec, HostInternetScsiHbaStaticTarget, HostNasVolumeSpec, HostVMotionCompatibility, ManagedObjectRef};
use super::command_trait::{CommandError, CommandResult, Invocation, ParsedCommand};
use super::context::{CommandContext, Target};
use super::registry::CommandRegistry;

/// Interval between readiness checks after a reboot
const REBOOT_POLL: Duration = Duration::from_secs(10);

/// Compatibility checks a vMotion destination must pass, in server order
const VMOTION_CHECKS: [&str; 2] = ["cpu", "software"];

pub fn register(registry: &mut CommandRegistry) {
    registry.register_command(Arc::new(ParsedCommand::<Reboot>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<Evacuate>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<EnterMaintenanceMode>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<ExitMaintenanceMode>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<Disconnect>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<Reconnect>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<AddIscsiTarget>::new("host").operates_on(Capability::HostSystem)));
    registry.register_command(Arc::new(ParsedCommand::<AddNfsDatastore>::new("host").operates_on(Capability::HostSystem)));
}

/// Reboot hosts
#[derive(Parser, Debug)]
#[command(name = "reboot")]
struct Reboot {
    #[arg(required = true)]
    hosts: Vec<String>,
    /// Reboot even if not in maintenance mode
    #[arg(long)]
    force: bool,
    /// Wait for the hosts to be connected again
    #[arg(long)]
    wait: bool,
    /// Give up waiting after this many seconds
    #[arg(long, requires = "wait")]
    wait_timeout: Option<u64>,
}

#[async_trait]
impl Invocation for Reboot {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let hosts = ctx.targets(&self.hosts, Capability::HostSystem).await?;
        let mut out = ctx.run_tasks(&hosts, "RebootHost_Task", json!({"force": self.force})).await?;
        if !self.wait {
            return Ok(out);
        }

        out.push_str("Waiting for hosts to reboot ...\n");
        // The server has no reboot notification: give the host time to go
        // down, then poll until it is connected and powered on again.
        let grace = ctx.settings.reboot_grace();
        let wait = async {
            tokio::time::sleep(grace).await;
            let mut lines = String::new();
            for host in &hosts {
                wait_until_up(host).await?;
                lines.push_str(&format!("Host {} is back up\n", host.name()));
            }
            Ok::<_, CommandError>(lines)
        };
        let bounded = async {
            match self.wait_timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait).await
                    .unwrap_or_else(|_| Err(CommandError::Timeout(format!("Timed out waiting for hosts to reboot after {}s", secs)))),
                None => wait.await,
            }
        };
        let lines = ctx.interruptible(bounded).await?;
        out.push_str(&lines);
        Ok(out)
    }
}

async fn wait_until_up(host: &Target) -> Result<(), CommandError> {
    let mut ticker = tokio::time::interval(REBOOT_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let runtime = host.connection.get(&host.obj, "runtime").await?;
        let connected = runtime.get("connectionState").and_then(Value::as_str) == Some("connected");
        let powered_on = runtime.get("powerState").and_then(Value::as_str) == Some("poweredOn");
        if connected && powered_on {
            return Ok(());
        }
        log::debug!("{} not back yet", host.name());
    }
}

/// vMotion all VMs away from this host (experimental)
#[derive(Parser, Debug)]
#[command(name = "evacuate")]
struct Evacuate {
    /// Host to empty
    src: String,
    /// Compute resources whose hosts may receive the VMs
    #[arg(required = true)]
    dst: Vec<String>,
}

#[async_trait]
impl Invocation for Evacuate {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let src = ctx.target(&self.src, Capability::HostSystem).await?;
        let conn = src.connection.clone();

        let mut dst_hosts = Vec::new();
        for dst in ctx.targets(&self.dst, Capability::ComputeResource).await? {
            dst_hosts.extend(dst.connection.get_refs(&dst.obj, "host").await?);
        }
        let mut eligible = Vec::new();
        for host in dst_hosts {
            if host == src.obj || eligible.contains(&host) {
                continue;
            }
            let runtime = conn.get(&host, "runtime").await?;
            let connected = runtime.get("connectionState").and_then(Value::as_str) == Some("connected");
            let maintenance = runtime.get("inMaintenanceMode").and_then(Value::as_bool).unwrap_or(false);
            if connected && !maintenance {
                eligible.push(host);
            }
        }

        let vms = conn.get_refs(&src.obj, "vm").await?;
        let service_instance = ManagedObjectRef::new("ServiceInstance", "ServiceInstance");
        let mut candidates: Vec<(ManagedObjectRef, String, Vec<ManagedObjectRef>)> = Vec::new();
        for vm in vms {
            if conn.get_str(&vm, "runtime.powerState").await? != "poweredOn" {
                continue;
            }
            let required = conn.get_refs(&vm, "datastore").await?;
            let result: Vec<HostVMotionCompatibility> = if eligible.is_empty() {
                Vec::new()
            } else {
                serde_json::from_value(conn.call(&service_instance, "QueryVMotionCompatibility", json!({
                    "vm": vm,
                    "host": eligible,
                    "compatibility": VMOTION_CHECKS,
                })).await?).map_err(|e| CommandError::Fault(e.to_string()))?
            };
            let mut hosts = Vec::new();
            for entry in result {
                if entry.compatibility != VMOTION_CHECKS {
                    continue;
                }
                let mounted = conn.get_refs(&entry.host, "datastore").await?;
                if required.iter().all(|ds| mounted.contains(ds)) {
                    hosts.push(entry.host);
                }
            }
            let name = conn.name_of(&vm).await?;
            candidates.push((vm, name, hosts));
        }

        let blocked: Vec<&str> = candidates.iter().filter(|(_, _, hosts)| hosts.is_empty()).map(|(_, name, _)| name.as_str()).collect();
        if !blocked.is_empty() {
            let mut message = "The following VMs have no compatible vMotion destination:".to_string();
            for name in blocked {
                message.push_str(&format!("\n {}", name));
            }
            return Err(CommandError::Execution(message));
        }

        let mut submissions = Vec::with_capacity(candidates.len());
        for (vm, name, hosts) in candidates {
            let host = {
                let mut rng = rand::rng();
                hosts.choose(&mut rng).cloned()
            };
            let Some(host) = host else { continue };
            log::info!("migrating {} to {}", name, host);
            let task = conn.call_task(&vm, "MigrateVM_Task", json!({"host": host, "priority": "defaultPriority"})).await;
            submissions.push(Submission::new(name, conn.clone(), task));
        }
        Ok(ctx.track(submissions).await?.render())
    }
}

/// Put hosts into maintenance mode
#[derive(Parser, Debug)]
#[command(name = "enter_maintenance_mode")]
struct EnterMaintenanceMode {
    #[arg(required = true)]
    hosts: Vec<String>,
    /// Seconds the server may spend before giving up
    #[arg(long, default_value_t = 0)]
    timeout: i64,
    /// Evacuate powered off vms
    #[arg(long)]
    evacuate_powered_off_vms: bool,
    /// Don't wait for the tasks to complete
    #[arg(long)]
    no_wait: bool,
}

#[async_trait]
impl Invocation for EnterMaintenanceMode {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let hosts = ctx.targets(&self.hosts, Capability::HostSystem).await?;
        let params = json!({"timeout": self.timeout, "evacuatePoweredOffVms": self.evacuate_powered_off_vms});
        if !self.no_wait {
            return ctx.run_tasks(&hosts, "EnterMaintenanceMode_Task", params).await;
        }
        for host in &hosts {
            host.connection.call_task(&host.obj, "EnterMaintenanceMode_Task", params.clone()).await?;
        }
        Ok(String::new())
    }
}

/// Take hosts out of maintenance mode
#[derive(Parser, Debug)]
#[command(name = "exit_maintenance_mode")]
struct ExitMaintenanceMode {
    #[arg(required = true)]
    hosts: Vec<String>,
    #[arg(long, default_value_t = 0)]
    timeout: i64,
}

#[async_trait]
impl Invocation for ExitMaintenanceMode {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let hosts = ctx.targets(&self.hosts, Capability::HostSystem).await?;
        ctx.run_tasks(&hosts, "ExitMaintenanceMode_Task", json!({"timeout": self.timeout})).await
    }
}

/// Disconnect a host
#[derive(Parser, Debug)]
#[command(name = "disconnect")]
struct Disconnect {
    #[arg(required = true)]
    hosts: Vec<String>,
}

#[async_trait]
impl Invocation for Disconnect {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let hosts = ctx.targets(&self.hosts, Capability::HostSystem).await?;
        ctx.run_tasks(&hosts, "DisconnectHost_Task", json!({})).await
    }
}

/// Reconnect a host
#[derive(Parser, Debug)]
#[command(name = "reconnect")]
struct Reconnect {
    #[arg(required = true)]
    hosts: Vec<String>,
    #[arg(short, long, default_value = "root")]
    username: String,
    #[arg(short, long, default_value = "")]
    password: String,
}

#[async_trait]
impl Invocation for Reconnect {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let hosts = ctx.targets(&self.hosts, Capability::HostSystem).await?;
        let spec = HostConnectSpec {
            force: false,
            user_name: self.username,
            password: self.password,
        };
        ctx.run_tasks(&hosts, "ReconnectHost_Task", json!({"cnxSpec": spec})).await
    }
}

/// Add a static iSCSI target to hosts
#[derive(Parser, Debug)]
#[command(name = "add_iscsi_target")]
struct AddIscsiTarget {
    #[arg(required = true)]
    hosts: Vec<String>,
    /// Address of iSCSI server
    #[arg(short, long)]
    address: String,
    /// IQN of iSCSI target
    #[arg(short, long)]
    iqn: String,
}

#[async_trait]
impl Invocation for AddIscsiTarget {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let mut out = String::new();
        for host in ctx.targets(&self.hosts, Capability::HostSystem).await? {
            out.push_str(&format!("configuring host {}\n", host.name()));
            let conn = &host.connection;
            let storage: ManagedObjectRef = conn.get_as(&host.obj, "configManager.storageSystem").await?;
            conn.call(&storage, "UpdateSoftwareInternetScsiEnabled", json!({"enabled": true})).await?;
            let adapters = conn.get(&storage, "storageDeviceInfo.hostBusAdapter").await?;
            let device = adapters.as_array().into_iter().flatten()
                .find(|hba| crate::vim::type_name_of(hba) == Some("HostInternetScsiHba"))
                .and_then(|hba| hba.get("device").and_then(Value::as_str))
                .ok_or_else(|| CommandError::Execution(format!("{} has no software iSCSI adapter", host.name())))?
                .to_string();
            let target = HostInternetScsiHbaStaticTarget {
                address: self.address.clone(),
                iscsi_name: self.iqn.clone(),
            };
            conn.call(&storage, "AddInternetScsiStaticTargets", json!({"iScsiHbaDevice": device, "targets": [target]})).await?;
            conn.call(&storage, "RescanAllHba", json!({})).await?;
        }
        Ok(out)
    }
}

/// Mount an NFS export as a datastore on hosts
#[derive(Parser, Debug)]
#[command(name = "add_nfs_datastore")]
struct AddNfsDatastore {
    #[arg(required = true)]
    hosts: Vec<String>,
    /// Datastore name
    #[arg(short, long)]
    name: String,
    /// Address of NFS server
    #[arg(short, long)]
    address: String,
    /// Path on NFS server
    #[arg(short, long)]
    path: String,
}

#[async_trait]
impl Invocation for AddNfsDatastore {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        for host in ctx.targets(&self.hosts, Capability::HostSystem).await? {
            let datastore_system: ManagedObjectRef = host.connection.get_as(&host.obj, "configManager.datastoreSystem").await?;
            let spec = HostNasVolumeSpec {
                access_mode: "readWrite".to_string(),
                local_path: self.name.clone(),
                remote_host: self.address.clone(),
                remote_path: self.path.clone(),
            };
            host.connection.call(&datastore_system, "CreateNasDatastore", json!({"spec": spec})).await?;
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use crate::vim::simulator::Simulator;
    use super::*;

    const ESX1: &str = "/vc/lab/computers/cluster1/hosts/esx1.lab";
    const ESX2: &str = "/vc/lab/computers/cluster1/hosts/esx2.lab";

    fn demo() -> (Arc<Simulator>, CommandContext) {
        let sim = Arc::new(Simulator::demo());
        let ctx = CommandContext::simulated(sim.clone());
        (sim, ctx)
    }

    async fn obj(ctx: &CommandContext, path: &str) -> ManagedObjectRef {
        ctx.target(path, Capability::ManagedEntity).await.unwrap().obj
    }

    #[tokio::test]
    async fn test_maintenance_mode_round_trip() {
        let (sim, mut ctx) = demo();
        let esx1 = obj(&ctx, ESX1).await;
        let output = ctx.run(&format!("host.enter_maintenance_mode --evacuate-powered-off-vms {}", ESX1)).await.unwrap();
        assert_eq!(output, "esx1.lab: success\n");
        assert_eq!(sim.property_value(&esx1, "runtime.inMaintenanceMode"), json!(true));
        assert_eq!(sim.calls_to("EnterMaintenanceMode_Task")[0].params["evacuatePoweredOffVms"], json!(true));

        ctx.run(&format!("host.exit_maintenance_mode {}", ESX1)).await.unwrap();
        assert_eq!(sim.property_value(&esx1, "runtime.inMaintenanceMode"), json!(false));
    }

    #[tokio::test]
    async fn test_enter_maintenance_mode_no_wait_prints_nothing() {
        let (sim, mut ctx) = demo();
        let output = ctx.run("host.enter_maintenance_mode --no-wait /vc/lab/computers/cluster1/hosts/*").await.unwrap();
        assert_eq!(output, "");
        assert_eq!(sim.calls_to("EnterMaintenanceMode_Task").len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_sends_connect_spec() {
        let (sim, mut ctx) = demo();
        ctx.run(&format!("host.disconnect {}", ESX2)).await.unwrap();
        ctx.run(&format!("host.reconnect -u admin -p secret {}", ESX2)).await.unwrap();
        let call = &sim.calls_to("ReconnectHost_Task")[0];
        assert_eq!(call.params["cnxSpec"], json!({
            "_typeName": "HostConnectSpec",
            "force": false,
            "userName": "admin",
            "password": "secret",
        }));
        let esx2 = obj(&ctx, ESX2).await;
        assert_eq!(sim.property_value(&esx2, "runtime.connectionState"), json!("connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_waits_for_host() {
        let (sim, mut ctx) = demo();
        let output = ctx.run(&format!("host.reboot --force --wait {}", ESX1)).await.unwrap();
        assert_eq!(output, "esx1.lab: success\nWaiting for hosts to reboot ...\nHost esx1.lab is back up\n");
        assert_eq!(sim.calls_to("RebootHost_Task")[0].params["force"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_wait_times_out() {
        let (sim, mut ctx) = demo();
        let esx1 = obj(&ctx, ESX1).await;
        sim.set_property(&esx1, "runtime.connectionState", json!("notResponding"));
        let err = ctx.run(&format!("host.reboot --wait --wait-timeout 600 {}", ESX1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_reboot_wait_timeout_requires_wait() {
        let (sim, mut ctx) = demo();
        let err = ctx.run(&format!("host.reboot --wait-timeout 5 {}", ESX1)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments(_)));
        assert!(sim.calls_to("RebootHost_Task").is_empty());
    }

    #[tokio::test]
    async fn test_evacuate_migrates_running_vms() {
        let (sim, mut ctx) = demo();
        let web = obj(&ctx, "/vc/lab/vms/web01").await;
        let esx2 = obj(&ctx, ESX2).await;
        let output = ctx.run(&format!("host.evacuate {} /vc/lab/computers/cluster1", ESX1)).await.unwrap();
        assert_eq!(output, "web01: success\n");
        let migrations = sim.calls_to("MigrateVM_Task");
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].obj, web);
        assert_eq!(migrations[0].params["host"]["value"], json!(esx2.value));
        // source host is never offered as a destination
        let query = &sim.calls_to("QueryVMotionCompatibility")[0];
        assert_eq!(query.params["host"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evacuate_aborts_when_a_vm_has_no_destination() {
        let (sim, mut ctx) = demo();
        let esx2 = obj(&ctx, ESX2).await;
        sim.set_vmotion_compatibility(&esx2, &["cpu"]);
        let err = ctx.run(&format!("host.evacuate {} /vc/lab/computers/cluster1", ESX1)).await.unwrap_err();
        assert_eq!(err.to_string(), "The following VMs have no compatible vMotion destination:\n web01");
        assert!(sim.calls_to("MigrateVM_Task").is_empty());
    }

    #[tokio::test]
    async fn test_evacuate_requires_shared_storage_and_healthy_hosts() {
        let sim = Arc::new(Simulator::new());
        let dc = sim.add_datacenter("lab");
        let (_cluster, hosts) = sim.add_cluster(&dc, "c1", &["a", "b", "c"]);
        sim.add_datastore(&dc, "shared", &hosts);
        sim.add_datastore(&dc, "local-a", &hosts[..1]);
        let pinned = sim.add_vm(&dc, &hosts[0], "pinned", "poweredOn");
        sim.set_property(&hosts[1], "runtime.inMaintenanceMode", json!(true));
        sim.set_property(&hosts[2], "runtime.connectionState", json!("disconnected"));
        sim.add_vm(&dc, &hosts[0], "idle", "poweredOff");
        let mut ctx = CommandContext::simulated(sim.clone());

        let err = ctx.run("host.evacuate /vc/lab/computers/c1/hosts/a /vc/lab/computers/c1").await.unwrap_err();
        assert!(err.to_string().ends_with("\n pinned"));
        assert!(sim.calls_to("MigrateVM_Task").is_empty());

        // healthy again, but only `a` mounts local-a
        sim.set_property(&hosts[1], "runtime.inMaintenanceMode", json!(false));
        sim.set_property(&pinned, "datastore", json!(sim.property_value(&hosts[0], "datastore")));
        let err = ctx.run("host.evacuate /vc/lab/computers/c1/hosts/a /vc/lab/computers/c1").await.unwrap_err();
        assert!(err.to_string().ends_with("\n pinned"));
        assert!(sim.calls_to("MigrateVM_Task").is_empty());
    }

    #[tokio::test]
    async fn test_add_iscsi_target_and_nfs_datastore() {
        let (sim, mut ctx) = demo();
        let output = ctx.run(&format!("host.add_iscsi_target -a 10.0.0.5 -i iqn.2026-01.lab:store {}", ESX1)).await.unwrap();
        assert_eq!(output, "configuring host esx1.lab\n");
        let call = &sim.calls_to("AddInternetScsiStaticTargets")[0];
        assert_eq!(call.params["iScsiHbaDevice"], json!("vmhba33"));
        assert_eq!(call.params["targets"][0]["iScsiName"], json!("iqn.2026-01.lab:store"));
        assert_eq!(sim.calls_to("RescanAllHba").len(), 1);

        ctx.run(&format!("host.add_nfs_datastore -n isos -a nas.lab -p /export/isos {}", ESX2)).await.unwrap();
        let call = &sim.calls_to("CreateNasDatastore")[0];
        assert_eq!(call.params["spec"]["remotePath"], json!("/export/isos"));
        assert_eq!(call.params["spec"]["accessMode"], json!("readWrite"));

        let err = ctx.run(&format!("host.add_nfs_datastore -n isos {}", ESX2)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments(_)));
    }
}

//! In-guest operations: credentials, files and processes.
//!
//! Every command except the `*_auth` ones needs a credential stored by
//! `authenticate` for the VM and user it runs as.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use clap::{ArgAction, Parser};
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;
use crate::shell::path::Capability;
use crate::vim::{
    ApiError, FileTransferInformation, GuestListFileInfo, GuestPosixFileAttributes, GuestProcessInfo, GuestProgramSpec,
    NamePasswordAuthentication,
};
use super::command_trait::{CommandError, CommandResult, Invocation, ParsedCommand};
use super::context::{CommandContext, Target};
use super::registry::CommandRegistry;

pub fn register(registry: &mut CommandRegistry) {
    fn guest<A: Invocation>() -> ParsedCommand<A> {
        ParsedCommand::<A>::new("vm_guest").operates_on(Capability::VirtualMachine)
    }

    registry.register_command(Arc::new(guest::<Authenticate>()));
    registry.register_command(Arc::new(guest::<CheckAuth>()));
    registry.register_command(Arc::new(guest::<ListAuth>()));
    registry.register_command(Arc::new(guest::<ClearAuth>()));
    registry.register_command(Arc::new(guest::<Chmod>()));
    registry.register_command(Arc::new(guest::<MkTmpDir>()));
    registry.register_command(Arc::new(guest::<MkTmpFile>()));
    registry.register_command(Arc::new(guest::<RmDir>()));
    registry.register_command(Arc::new(guest::<RmFile>()));
    registry.register_command(Arc::new(guest::<DownloadFile>()));
    registry.register_command(Arc::new(guest::<UploadFile>()));
    registry.register_command(Arc::new(guest::<UploadDirectory>()));
    registry.register_command(Arc::new(guest::<LsGuest>()));
    registry.register_command(Arc::new(guest::<MkDir>()));
    registry.register_command(Arc::new(guest::<MvDir>()));
    registry.register_command(Arc::new(guest::<MvFile>()));
    registry.register_command(Arc::new(guest::<StartProgram>()));
}

/// A VM together with the credential commands run under
struct GuestSession {
    vm: Target,
    auth: NamePasswordAuthentication,
}

impl GuestSession {
    async fn open(ctx: &CommandContext, vm: &str, username: Option<&str>) -> Result<Self, CommandError> {
        let vm = ctx.target(vm, Capability::VirtualMachine).await?;
        let username = username.unwrap_or(&ctx.settings.default_guest_user);
        let auth = ctx.credentials.get(&vm.vm_key(), username)?.clone();
        Ok(Self { vm, auth })
    }

    async fn invoke(&self, manager: &str, method: &str, mut params: Value) -> Result<Value, ApiError> {
        let manager = self.vm.connection.guest_manager(manager).await?;
        params["vm"] = json!(self.vm.obj);
        params["auth"] = json!(self.auth);
        self.vm.connection.call(&manager, method, params).await
    }

    async fn file_op(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        self.invoke("fileManager", method, params).await
    }

    async fn process_op(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        self.invoke("processManager", method, params).await
    }

    async fn make_directory(&self, path: &str, create_parents: bool) -> Result<(), ApiError> {
        self.file_op("MakeDirectoryInGuest", json!({
            "directoryPath": path,
            "createParentDirectories": create_parents,
        })).await?;
        Ok(())
    }

    async fn list_files(&self, path: &str, index: Option<i64>, max_results: Option<i64>, pattern: Option<&str>) -> Result<GuestListFileInfo, ApiError> {
        let mut params = json!({"filePath": path});
        if let Some(index) = index {
            params["index"] = json!(index);
        }
        if let Some(max) = max_results {
            params["maxResults"] = json!(max);
        }
        if let Some(pattern) = pattern {
            params["matchPattern"] = json!(pattern);
        }
        Ok(serde_json::from_value(self.file_op("ListFilesInGuest", params).await?)?)
    }

    async fn upload(&self, guest_path: &str, data: Vec<u8>, attributes: &GuestPosixFileAttributes, overwrite: bool) -> Result<(), ApiError> {
        let url = self.file_op("InitiateFileTransferToGuest", json!({
            "guestFilePath": guest_path,
            "fileAttributes": attributes,
            "fileSize": data.len(),
            "overwrite": overwrite,
        })).await?;
        let url = url.as_str().ok_or_else(|| ApiError::Decode(format!("transfer URL expected, got {}", url)))?;
        self.vm.connection.api().upload(url, data).await
    }
}

fn parse_permissions(permissions: Option<&str>) -> Result<Option<i64>, CommandError> {
    permissions
        .map(|p| i64::from_str_radix(p, 8).map_err(|_| CommandError::InvalidArguments(format!("invalid permissions {:?}, expected octal", p))))
        .transpose()
}

fn file_attributes(group_id: Option<i64>, owner_id: Option<i64>, permissions: Option<&str>) -> Result<GuestPosixFileAttributes, CommandError> {
    Ok(GuestPosixFileAttributes {
        group_id,
        owner_id,
        permissions: parse_permissions(permissions)?,
    })
}

/// Authenticate within guest
#[derive(Parser, Debug)]
#[command(name = "authenticate")]
struct Authenticate {
    vm: String,
    /// Allow command to interact with desktop
    #[arg(long)]
    interactive_session: bool,
    /// Password in guest
    #[arg(long)]
    password: Option<String>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for Authenticate {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.target(&self.vm, Capability::VirtualMachine).await?;
        let password = match self.password.filter(|p| !p.is_empty()) {
            Some(password) => password,
            None => ctx.console.password("password: ")?,
        };
        let auth = NamePasswordAuthentication {
            username: self.username.unwrap_or_else(|| ctx.settings.default_guest_user.clone()),
            password,
            interactive_session: self.interactive_session,
        };

        let session = GuestSession { vm, auth };
        if let Err(e) = session.invoke("authManager", "ValidateCredentialsInGuest", json!({})).await {
            return Err(CommandError::Execution(format!("Could not authenticate: {}", e)));
        }
        log::debug!("stored credentials for {} on {}", session.auth.username, session.vm.path());
        ctx.credentials.insert(session.vm.vm_key(), &session.vm.path(), session.auth);
        Ok(String::new())
    }
}

/// Check credentials
#[derive(Parser, Debug)]
#[command(name = "check_auth")]
struct CheckAuth {
    vm: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for CheckAuth {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.invoke("authManager", "ValidateCredentialsInGuest", json!({})).await?;
        Ok(String::new())
    }
}

/// List available credentials
#[derive(Parser, Debug)]
#[command(name = "list_auth")]
struct ListAuth {
    vm: Option<String>,
}

#[async_trait]
impl Invocation for ListAuth {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let vm = ctx.optional_target(self.vm.as_deref(), Capability::VirtualMachine).await?;
        let key = vm.map(|vm| vm.vm_key());
        let entries = ctx.credentials.list(key.as_ref());
        if entries.is_empty() {
            return Ok("No credentials available.\n".to_string());
        }
        let mut out = String::new();
        for (path, usernames) in entries {
            out.push_str(path);
            out.push('\n');
            for username in usernames {
                out.push_str(&format!("  {}\n", username));
            }
        }
        Ok(out)
    }
}

/// Clear credentials
#[derive(Parser, Debug)]
#[command(name = "clear_auth")]
struct ClearAuth {
    vm: Option<String>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for ClearAuth {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        if let Some(vm) = ctx.optional_target(self.vm.as_deref(), Capability::VirtualMachine).await? {
            let username = self.username.unwrap_or_else(|| ctx.settings.default_guest_user.clone());
            ctx.credentials.clear(&vm.vm_key(), &username);
        }
        Ok(String::new())
    }
}

/// Change file attributes
#[derive(Parser, Debug)]
#[command(name = "chmod")]
struct Chmod {
    vm: String,
    /// Group ID of file
    #[arg(long)]
    group_id: Option<i64>,
    /// Path in guest to change ownership of
    #[arg(long)]
    guest_path: String,
    /// Owner ID of file
    #[arg(long)]
    owner_id: Option<i64>,
    /// Permissions of file, in octal
    #[arg(long)]
    permissions: Option<String>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for Chmod {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let attributes = file_attributes(self.group_id, self.owner_id, self.permissions.as_deref())?;
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.file_op("ChangeFileAttributesInGuest", json!({
            "guestFilePath": self.guest_path,
            "fileAttributes": attributes,
        })).await?;
        Ok(String::new())
    }
}

async fn make_temporary(ctx: &CommandContext, vm: &str, username: Option<&str>, method: &str, dir: Option<String>, prefix: String, suffix: String) -> CommandResult {
    let session = GuestSession::open(ctx, vm, username).await?;
    let mut params = json!({"prefix": prefix, "suffix": suffix});
    if let Some(dir) = dir {
        params["directoryPath"] = json!(dir);
    }
    match session.file_op(method, params).await? {
        Value::String(path) => Ok(format!("{}\n", path)),
        other => Err(CommandError::Fault(format!("unexpected reply {}", other))),
    }
}

/// Create temporary directory in guest
#[derive(Parser, Debug)]
#[command(name = "mktmpdir")]
struct MkTmpDir {
    vm: String,
    /// Path in guest to create temporary directory in
    #[arg(long)]
    guest_path: Option<String>,
    /// Prefix of temporary directory
    #[arg(long)]
    prefix: String,
    /// Suffix of temporary directory
    #[arg(long)]
    suffix: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for MkTmpDir {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        make_temporary(ctx, &self.vm, self.username.as_deref(), "CreateTemporaryDirectoryInGuest", self.guest_path, self.prefix, self.suffix).await
    }
}

/// Create temporary file in guest
#[derive(Parser, Debug)]
#[command(name = "mktmpfile")]
struct MkTmpFile {
    vm: String,
    /// Path in guest to create temporary file in
    #[arg(long)]
    guest_path: Option<String>,
    /// Prefix of temporary file
    #[arg(long)]
    prefix: String,
    /// Suffix of temporary file
    #[arg(long)]
    suffix: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for MkTmpFile {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        make_temporary(ctx, &self.vm, self.username.as_deref(), "CreateTemporaryFileInGuest", self.guest_path, self.prefix, self.suffix).await
    }
}

/// Delete directory in guest
#[derive(Parser, Debug)]
#[command(name = "rmdir")]
struct RmDir {
    vm: String,
    /// Path of directory in guest to delete
    #[arg(long)]
    guest_path: String,
    /// Delete all subdirectories
    #[arg(long)]
    recursive: bool,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for RmDir {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.file_op("DeleteDirectoryInGuest", json!({
            "directoryPath": self.guest_path,
            "recursive": self.recursive,
        })).await?;
        Ok(String::new())
    }
}

/// Delete file in guest
#[derive(Parser, Debug)]
#[command(name = "rmfile")]
struct RmFile {
    vm: String,
    /// Path of file in guest to delete
    #[arg(long)]
    guest_path: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for RmFile {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.file_op("DeleteFileInGuest", json!({"filePath": self.guest_path})).await?;
        Ok(String::new())
    }
}

/// Download file from guest
#[derive(Parser, Debug)]
#[command(name = "download_file")]
struct DownloadFile {
    vm: String,
    /// Path in guest to download from
    #[arg(long)]
    guest_path: String,
    /// Local file to download to
    #[arg(long)]
    local_path: PathBuf,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for DownloadFile {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        let info = session.file_op("InitiateFileTransferFromGuest", json!({"guestFilePath": self.guest_path})).await?;
        let info: FileTransferInformation = serde_json::from_value(info).map_err(|e| CommandError::Fault(e.to_string()))?;
        let data = session.vm.connection.api().download(&info.url).await?;
        tokio::fs::write(&self.local_path, &data).await?;
        log::debug!("downloaded {} bytes to {}", data.len(), self.local_path.display());
        Ok(String::new())
    }
}

/// Upload file to guest
#[derive(Parser, Debug)]
#[command(name = "upload_file")]
struct UploadFile {
    vm: String,
    /// Group ID of file
    #[arg(long)]
    group_id: Option<i64>,
    /// Path in guest to upload to
    #[arg(long)]
    guest_path: String,
    /// Local file to upload
    #[arg(long)]
    local_path: PathBuf,
    /// Overwrite file
    #[arg(long)]
    overwrite: bool,
    /// Owner ID of file
    #[arg(long)]
    owner_id: Option<i64>,
    /// Permissions of file, in octal
    #[arg(long)]
    permissions: Option<String>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for UploadFile {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let attributes = file_attributes(self.group_id, self.owner_id, self.permissions.as_deref())?;
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        let data = tokio::fs::read(&self.local_path).await?;
        session.upload(&self.guest_path, data, &attributes, self.overwrite).await?;
        Ok(String::new())
    }
}

/// Upload directory to guest
#[derive(Parser, Debug)]
#[command(name = "upload_directory")]
struct UploadDirectory {
    vm: String,
    /// Create parent directories
    #[arg(long)]
    create_parent_directories: bool,
    /// Exclude files/directories by regex
    #[arg(long)]
    exclude: Option<String>,
    /// Group ID of files
    #[arg(long)]
    group_id: Option<i64>,
    /// Path in guest to upload to
    #[arg(long)]
    guest_path: String,
    /// Local directory to upload
    #[arg(long)]
    local_path: PathBuf,
    /// Overwrite files/directories
    #[arg(long)]
    overwrite: bool,
    /// Owner ID of files
    #[arg(long)]
    owner_id: Option<i64>,
    /// Permissions of files, in octal
    #[arg(long)]
    permissions: Option<String>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

/// Guest path for `local`, which lies under `root`
fn guest_path_for(guest_root: &str, root: &Path, local: &Path) -> String {
    let relative: Vec<String> = local.strip_prefix(root)
        .map(|rel| rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect())
        .unwrap_or_default();
    let base = guest_root.trim_end_matches('/');
    if relative.is_empty() {
        if base.is_empty() { "/".to_string() } else { base.to_string() }
    } else {
        format!("{}/{}", base, relative.join("/"))
    }
}

impl UploadDirectory {
    /// Whether `path` has to be created; with `--overwrite` existing directories are kept
    async fn needs_directory(&self, session: &GuestSession, path: &str) -> Result<bool, CommandError> {
        if !self.overwrite {
            return Ok(true);
        }
        // Only existence matters, so ask for a name that never matches
        match session.list_files(path, None, None, Some("junkJUNKjunk")).await {
            Ok(_) => Ok(false),
            Err(e) if e.fault_kind() == Some("FileNotFound") => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Invocation for UploadDirectory {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let exclude_pattern = self.exclude.clone().unwrap_or_else(|| ctx.settings.upload_exclude.clone());
        let exclude = Regex::new(&exclude_pattern).map_err(|e| CommandError::InvalidArguments(e.to_string()))?;
        let attributes = file_attributes(self.group_id, self.owner_id, self.permissions.as_deref())?;
        if !self.local_path.is_dir() {
            return Err(CommandError::Execution(format!(
                "Directory {} does not exist or is not a directory.",
                self.local_path.display()
            )));
        }
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;

        let entries = WalkDir::new(&self.local_path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !exclude.is_match(&entry.file_name().to_string_lossy()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CommandError::Execution(e.to_string()))?;

        let mut out = String::new();
        for entry in entries {
            let guest_path = guest_path_for(&self.guest_path, &self.local_path, entry.path());
            if entry.file_type().is_dir() {
                if self.needs_directory(&session, &guest_path).await? {
                    session.make_directory(&guest_path, self.create_parent_directories).await?;
                }
            } else {
                out.push_str(&format!("Uploading {}\n", guest_path));
                let data = tokio::fs::read(entry.path()).await?;
                session.upload(&guest_path, data, &attributes, self.overwrite).await?;
            }
        }
        Ok(out)
    }
}

/// List files in guest
#[derive(Parser, Debug)]
#[command(name = "ls_guest")]
struct LsGuest {
    vm: String,
    /// Path in guest to get directory listing
    #[arg(long)]
    guest_path: String,
    /// Which to start the list with
    #[arg(long)]
    index: Option<i64>,
    /// Filename filter (regular expression)
    #[arg(long)]
    match_pattern: Option<String>,
    /// Maximum number of results
    #[arg(long)]
    max_results: Option<i64>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for LsGuest {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        let listing = session.list_files(&self.guest_path, self.index, self.max_results, self.match_pattern.as_deref()).await?;
        let mut out: String = listing.files.iter().map(|f| format!("{}\n", f.path)).collect();
        if listing.remaining != 0 {
            out.push_str(&format!("Remaining: {}\n", listing.remaining));
        }
        Ok(out)
    }
}

/// Make directory in guest
#[derive(Parser, Debug)]
#[command(name = "mkdir")]
struct MkDir {
    vm: String,
    /// Path of directory in guest to create
    #[arg(long)]
    guest_path: String,
    /// Create parent directories
    #[arg(long)]
    create_parent_directories: bool,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for MkDir {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.make_directory(&self.guest_path, self.create_parent_directories).await?;
        Ok(String::new())
    }
}

/// Move directory in guest
#[derive(Parser, Debug)]
#[command(name = "mvdir")]
struct MvDir {
    vm: String,
    /// Path in guest to move from
    #[arg(long)]
    src_guest_path: String,
    /// Path in guest to move to
    #[arg(long)]
    dst_guest_path: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for MvDir {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.file_op("MoveDirectoryInGuest", json!({
            "srcDirectoryPath": self.src_guest_path,
            "dstDirectoryPath": self.dst_guest_path,
        })).await?;
        Ok(String::new())
    }
}

/// Move file in guest
#[derive(Parser, Debug)]
#[command(name = "mvfile")]
struct MvFile {
    vm: String,
    /// Path in guest to move to
    #[arg(long)]
    dst_guest_path: String,
    /// Overwrite file
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    overwrite: bool,
    /// Path in guest to move from
    #[arg(long)]
    src_guest_path: String,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
}

#[async_trait]
impl Invocation for MvFile {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;
        session.file_op("MoveFileInGuest", json!({
            "srcFilePath": self.src_guest_path,
            "dstFilePath": self.dst_guest_path,
            "overwrite": self.overwrite,
        })).await?;
        Ok(String::new())
    }
}

/// Run program in guest
#[derive(Parser, Debug)]
#[command(name = "start_program")]
struct StartProgram {
    vm: String,
    /// Arguments of command
    #[arg(long, default_value = "")]
    arguments: String,
    /// Don't wait for process to finish
    #[arg(long, conflicts_with_all = ["timeout", "delay"])]
    background: bool,
    /// Interval in seconds
    #[arg(long, default_value_t = 5.0)]
    delay: f64,
    /// Environment variable(s) to set (e.g. VAR=value)
    #[arg(long)]
    env: Vec<String>,
    /// Path to program in guest
    #[arg(long)]
    program_path: String,
    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Username in guest
    #[arg(long)]
    username: Option<String>,
    /// Working directory of the program to run
    #[arg(long)]
    working_directory: Option<String>,
}

impl StartProgram {
    async fn wait_for_exit(&self, session: &GuestSession, pid: i64, delay: Duration) -> CommandResult {
        loop {
            let processes = session.process_op("ListProcessesInGuest", json!({"pids": [pid]})).await?;
            let processes: Vec<GuestProcessInfo> = serde_json::from_value(processes).map_err(|e| CommandError::Fault(e.to_string()))?;
            let process = processes.into_iter().find(|p| p.pid == pid)
                .ok_or_else(|| CommandError::Execution(format!("process {} not found", pid)))?;

            if process.end_time.is_some() {
                return match process.exit_code.unwrap_or(0) {
                    0 => Ok(String::new()),
                    code => Err(CommandError::Execution(format!("Process failed with exit code {}", code))),
                };
            }
            if self.background {
                return Ok(String::new());
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Invocation for StartProgram {
    async fn run(self, ctx: &mut CommandContext) -> CommandResult {
        if !self.delay.is_finite() || self.delay <= 0.0 {
            return Err(CommandError::InvalidArguments("--delay must be a positive number of seconds".to_string()));
        }
        let delay = Duration::from_secs_f64(self.delay);
        let session = GuestSession::open(ctx, &self.vm, self.username.as_deref()).await?;

        let spec = GuestProgramSpec {
            program_path: self.program_path.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            env_variables: self.env.clone(),
        };
        let pid = session.process_op("StartProgramInGuest", json!({"spec": spec})).await?;
        let pid = pid.as_i64().ok_or_else(|| CommandError::Fault(format!("unexpected pid {}", pid)))?;
        log::debug!("started {} as pid {}", self.program_path, pid);

        let wait = async {
            match self.timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.wait_for_exit(&session, pid, delay))
                    .await
                    .unwrap_or_else(|_| Err(CommandError::Timeout("Timed out waiting for process to finish.".to_string()))),
                None => self.wait_for_exit(&session, pid, delay).await,
            }
        };
        ctx.interruptible(wait).await
    }
}

#[cfg(test)]
mod tests {
    use crate::shell::console::ScriptedPrompter;
    use crate::vim::simulator::Simulator;
    use crate::vim::ManagedObjectRef;
    use super::*;

    const WEB: &str = "/vc/lab/vms/web01";

    async fn authenticated() -> (Arc<Simulator>, CommandContext, ManagedObjectRef) {
        let sim = Arc::new(Simulator::demo());
        let mut ctx = CommandContext::simulated(sim.clone());
        ctx.run(&format!("vm_guest.authenticate --password vmware {}", WEB)).await.unwrap();
        let web = ctx.target(WEB, Capability::VirtualMachine).await.unwrap().obj;
        (sim, ctx, web)
    }

    #[tokio::test]
    async fn test_authenticate_validates_before_storing() {
        let sim = Arc::new(Simulator::demo());
        let mut ctx = CommandContext::simulated(sim.clone());
        let err = ctx.run(&format!("vm_guest.authenticate --password wrong {}", WEB)).await.unwrap_err();
        assert!(err.to_string().starts_with("Could not authenticate: InvalidGuestLogin"));
        assert_eq!(ctx.run("vm_guest.list_auth").await.unwrap(), "No credentials available.\n");

        ctx.run(&format!("vm_guest.authenticate --password vmware {}", WEB)).await.unwrap();
        assert_eq!(ctx.run("vm_guest.list_auth").await.unwrap(), "/vc/lab/vms/web01\n  root\n");
        assert_eq!(ctx.run("vm_guest.list_auth /vc/lab/vms/db01").await.unwrap(), "No credentials available.\n");
        assert_eq!(ctx.run(&format!("vm_guest.check_auth {}", WEB)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_authenticate_prompts_for_missing_password() {
        let sim = Arc::new(Simulator::demo());
        let mut ctx = CommandContext::simulated_with(sim, Arc::new(ScriptedPrompter::new(vec!["vmware"], vec![])));
        ctx.run(&format!("vm_guest.authenticate {}", WEB)).await.unwrap();
        assert_eq!(ctx.run(&format!("vm_guest.check_auth {}", WEB)).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_commands_require_credentials() {
        let (_sim, mut ctx, _web) = authenticated().await;
        ctx.run(&format!("vm_guest.clear_auth {}", WEB)).await.unwrap();
        let err = ctx.run(&format!("vm_guest.check_auth {}", WEB)).await.unwrap_err();
        assert_eq!(err.to_string(), "No credentials found. You must authenticate before executing this command.");
        assert!(ctx.run(&format!("vm_guest.ls_guest --guest-path / {}", WEB)).await.is_err());
        let err = ctx.run(&format!("vm_guest.check_auth --username admin {}", WEB)).await.unwrap_err();
        assert!(err.to_string().starts_with("No credentials found"));
    }

    #[tokio::test]
    async fn test_directories_and_listing() {
        let (sim, mut ctx, web) = authenticated().await;
        ctx.run(&format!("vm_guest.mkdir --guest-path /tmp/work {}", WEB)).await.unwrap();
        assert!(ctx.run(&format!("vm_guest.mkdir --guest-path /opt/app/bin {}", WEB)).await.is_err());
        ctx.run(&format!("vm_guest.mkdir --create-parent-directories --guest-path /opt/app/bin {}", WEB)).await.unwrap();
        sim.put_guest_file(&web, "/tmp/notes.txt", b"hello");

        let output = ctx.run(&format!("vm_guest.ls_guest --guest-path /tmp {}", WEB)).await.unwrap();
        assert_eq!(output, "work\nnotes.txt\n");
        let output = ctx.run(&format!("vm_guest.ls_guest --guest-path /tmp --match-pattern txt {}", WEB)).await.unwrap();
        assert_eq!(output, "notes.txt\n");

        ctx.run(&format!("vm_guest.mvdir --src-guest-path /tmp/work --dst-guest-path /tmp/done {}", WEB)).await.unwrap();
        ctx.run(&format!("vm_guest.rmdir --recursive --guest-path /opt {}", WEB)).await.unwrap();
        let dirs = sim.guest_dirs(&web);
        assert!(dirs.contains(&"/tmp/done".to_string()));
        assert!(!dirs.iter().any(|d| d.starts_with("/opt")));
    }

    #[tokio::test]
    async fn test_file_management() {
        let (sim, mut ctx, web) = authenticated().await;
        sim.put_guest_file(&web, "/tmp/a.txt", b"a");
        sim.put_guest_file(&web, "/tmp/b.txt", b"b");

        let err = ctx.run(&format!("vm_guest.mvfile --overwrite false --src-guest-path /tmp/a.txt --dst-guest-path /tmp/b.txt {}", WEB)).await.unwrap_err();
        assert!(err.to_string().starts_with("FileAlreadyExists"));
        ctx.run(&format!("vm_guest.mvfile --src-guest-path /tmp/a.txt --dst-guest-path /tmp/b.txt {}", WEB)).await.unwrap();
        assert_eq!(sim.guest_file(&web, "/tmp/b.txt"), Some(b"a".to_vec()));

        ctx.run(&format!("vm_guest.chmod --permissions 755 --guest-path /tmp/b.txt {}", WEB)).await.unwrap();
        let call = sim.calls_to("ChangeFileAttributesInGuest").pop().unwrap();
        assert_eq!(call.params["fileAttributes"]["permissions"], 0o755);
        let err = ctx.run(&format!("vm_guest.chmod --permissions rwx --guest-path /tmp/b.txt {}", WEB)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments(_)));

        ctx.run(&format!("vm_guest.rmfile --guest-path /tmp/b.txt {}", WEB)).await.unwrap();
        assert_eq!(sim.guest_file(&web, "/tmp/b.txt"), None);
        let err = ctx.run(&format!("vm_guest.rmfile --guest-path /tmp/b.txt {}", WEB)).await.unwrap_err();
        assert!(err.to_string().starts_with("FileNotFound"));
    }

    #[tokio::test]
    async fn test_temporary_files() {
        let (sim, mut ctx, web) = authenticated().await;
        let output = ctx.run(&format!("vm_guest.mktmpfile --prefix job --suffix .log {}", WEB)).await.unwrap();
        assert!(output.starts_with("/tmp/job") && output.ends_with(".log\n"));
        assert!(sim.guest_file(&web, output.trim_end()).is_some());

        let output = ctx.run(&format!("vm_guest.mktmpdir --guest-path / --prefix build --suffix .d {}", WEB)).await.unwrap();
        assert!(output.starts_with("/build"));
        assert!(sim.guest_dirs(&web).contains(&output.trim_end().to_string()));
    }

    #[tokio::test]
    async fn test_upload_and_download_file() {
        let (sim, mut ctx, web) = authenticated().await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload.bin");
        std::fs::write(&local, b"payload").unwrap();

        ctx.run(&format!("vm_guest.upload_file --local-path {} --guest-path /tmp/payload.bin {}", local.display(), WEB)).await.unwrap();
        assert_eq!(sim.guest_file(&web, "/tmp/payload.bin"), Some(b"payload".to_vec()));
        let err = ctx.run(&format!("vm_guest.upload_file --local-path {} --guest-path /tmp/payload.bin {}", local.display(), WEB)).await.unwrap_err();
        assert!(err.to_string().starts_with("FileAlreadyExists"));
        ctx.run(&format!("vm_guest.upload_file --overwrite --local-path {} --guest-path /tmp/payload.bin {}", local.display(), WEB)).await.unwrap();

        sim.put_guest_file(&web, "/tmp/report.txt", b"all good");
        let target = dir.path().join("report.txt");
        ctx.run(&format!("vm_guest.download_file --guest-path /tmp/report.txt --local-path {} {}", target.display(), WEB)).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"all good");
        assert!(ctx.run(&format!("vm_guest.download_file --guest-path /tmp/missing --local-path {} {}", target.display(), WEB)).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_directory() {
        let (sim, mut ctx, web) = authenticated().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.txt"), b"b").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("config"), b"x").unwrap();

        let line = format!("vm_guest.upload_directory --create-parent-directories --local-path {} --guest-path /opt/app {}", dir.path().display(), WEB);
        let output = ctx.run(&line).await.unwrap();
        assert_eq!(output, "Uploading /opt/app/a.txt\nUploading /opt/app/sub/b.txt\n");
        assert_eq!(sim.guest_file(&web, "/opt/app/sub/b.txt"), Some(b"b".to_vec()));
        assert!(!sim.guest_dirs(&web).iter().any(|d| d.contains(".git")));
        assert_eq!(sim.calls_to("MakeDirectoryInGuest").len(), 2);

        // second pass keeps the existing directories and replaces the files
        std::fs::write(dir.path().join("a.txt"), b"a2").unwrap();
        ctx.run(&format!("{} --overwrite", line)).await.unwrap();
        assert_eq!(sim.calls_to("MakeDirectoryInGuest").len(), 2);
        assert_eq!(sim.calls_to("ListFilesInGuest").len(), 2);
        assert_eq!(sim.guest_file(&web, "/opt/app/a.txt"), Some(b"a2".to_vec()));

        let missing = dir.path().join("nope");
        let err = ctx.run(&format!("vm_guest.upload_directory --local-path {} --guest-path /opt {}", missing.display(), WEB)).await.unwrap_err();
        assert!(err.to_string().ends_with("does not exist or is not a directory."));
    }

    #[test]
    fn test_guest_path_for() {
        let root = Path::new("/home/me/site");
        assert_eq!(guest_path_for("/srv/site/", root, root), "/srv/site");
        assert_eq!(guest_path_for("/srv/site", root, &root.join("css").join("main.css")), "/srv/site/css/main.css");
        assert_eq!(guest_path_for("/", root, &root.join("a")), "/a");
    }

    #[tokio::test]
    async fn test_start_program_waits_for_exit() {
        let (sim, mut ctx, web) = authenticated().await;
        sim.script_process(&web, "/bin/true", 0, 2);
        let output = ctx.run(&format!("vm_guest.start_program --delay 0.01 --program-path /bin/true --env A=1 {}", WEB)).await.unwrap();
        assert_eq!(output, "");
        assert_eq!(sim.calls_to("ListProcessesInGuest").len(), 3);
        let start = sim.calls_to("StartProgramInGuest").pop().unwrap();
        assert_eq!(start.params["spec"]["envVariables"], json!(["A=1"]));

        sim.script_process(&web, "/bin/false", 3, 0);
        let err = ctx.run(&format!("vm_guest.start_program --delay 0.01 --program-path /bin/false {}", WEB)).await.unwrap_err();
        assert_eq!(err.to_string(), "Process failed with exit code 3");
    }

    #[tokio::test]
    async fn test_start_program_in_background() {
        let (sim, mut ctx, web) = authenticated().await;
        sim.script_process(&web, "/usr/bin/daemon", 0, 100);
        ctx.run(&format!("vm_guest.start_program --background --program-path /usr/bin/daemon {}", WEB)).await.unwrap();
        assert_eq!(sim.calls_to("ListProcessesInGuest").len(), 1);

        let err = ctx.run(&format!("vm_guest.start_program --background --timeout 5 --program-path /usr/bin/daemon {}", WEB)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments(_)));
        let err = ctx.run(&format!("vm_guest.start_program --background --delay 1 --program-path /usr/bin/daemon {}", WEB)).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_program_times_out() {
        let (sim, mut ctx, web) = authenticated().await;
        sim.script_process(&web, "/usr/bin/sleep", 0, 10_000);
        let err = ctx.run(&format!("vm_guest.start_program --timeout 10 --delay 1 --program-path /usr/bin/sleep {}", WEB)).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(err.to_string(), "Timed out waiting for process to finish.");
    }
}

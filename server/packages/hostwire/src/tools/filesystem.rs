use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::GlobBuilder;
use hostwire_error::HostwireError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{
    blocking, format_size, parse_params, require_text, schema_for, Tool, ToolContext, ToolOutput,
    ToolRegistry,
};
use crate::os;
use crate::policy::PolicyGuard;

const ROOT_LISTING_CAP: usize = 20;
const SEARCH_RESULT_CAP: usize = 100;
const SEARCH_MAX_DEPTH: usize = 16;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(ListDrives);
    registry.register(CreateFile);
    registry.register(ReadFile);
    registry.register(EditFile);
    registry.register(DeleteFile);
    registry.register(CreateDirectory);
    registry.register(ListFiles);
    registry.register(FileOperations);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Inaccessible,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<DirEntryInfo>,
    pub total: usize,
    pub truncated: bool,
}

impl DirectoryListing {
    fn render(&self) -> String {
        let mut text = format!("Contents of {}:\n", self.path);
        if self.entries.is_empty() {
            text.push_str("(empty directory)\n");
        }
        for entry in &self.entries {
            let line = match entry.kind {
                EntryKind::Directory => format!("[DIR]  {}/", entry.name),
                EntryKind::File => format!(
                    "[FILE] {} ({})",
                    entry.name,
                    entry.size.as_deref().unwrap_or("?")
                ),
                EntryKind::Inaccessible => format!("[----] {} (inaccessible)", entry.name),
            };
            text.push_str(&line);
            text.push('\n');
        }
        if self.truncated {
            text.push_str(&format!(
                "... showing the first {} of {} entries\n",
                self.entries.iter().filter(|entry| entry.name != "..").count(),
                self.total
            ));
        }
        text
    }
}

/// Enumerates a directory. Directories sort before files; a filesystem root
/// is capped and gets no parent entry.
pub fn list_directory(dir: &Path) -> Result<DirectoryListing, HostwireError> {
    let read_dir = fs::read_dir(dir).map_err(|err| HostwireError::from_io(err, dir.display()))?;
    let mut entries = describe_entries(dir, read_dir.map(|entry| entry.map(|entry| entry.path())));
    entries.sort_by(|a, b| {
        (a.kind != EntryKind::Directory, a.name.to_lowercase())
            .cmp(&(b.kind != EntryKind::Directory, b.name.to_lowercase()))
    });
    let total = entries.len();
    let at_root = dir.parent().is_none();
    let truncated = at_root && total > ROOT_LISTING_CAP;
    if truncated {
        entries.truncate(ROOT_LISTING_CAP);
    }
    if let Some(parent) = dir.parent() {
        entries.insert(
            0,
            DirEntryInfo {
                name: "..".to_string(),
                path: parent.display().to_string(),
                kind: EntryKind::Directory,
                size_bytes: None,
                size: None,
            },
        );
    }
    Ok(DirectoryListing {
        path: dir.display().to_string(),
        entries,
        total,
        truncated,
    })
}

/// An entry the directory stream failed to yield is kept as inaccessible.
fn describe_entries<I>(dir: &Path, paths: I) -> Vec<DirEntryInfo>
where
    I: IntoIterator<Item = std::io::Result<PathBuf>>,
{
    paths
        .into_iter()
        .map(|path| match path {
            Ok(path) => describe_entry(&path),
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "unreadable directory entry");
                DirEntryInfo {
                    name: "(unreadable entry)".to_string(),
                    path: dir.display().to_string(),
                    kind: EntryKind::Inaccessible,
                    size_bytes: None,
                    size: None,
                }
            }
        })
        .collect()
}

fn describe_entry(path: &Path) -> DirEntryInfo {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let (kind, size_bytes) = match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => (EntryKind::Directory, None),
        Ok(meta) => (EntryKind::File, Some(meta.len())),
        Err(_) => (EntryKind::Inaccessible, None),
    };
    DirEntryInfo {
        name,
        path: path.display().to_string(),
        kind,
        size_bytes,
        size: size_bytes.map(format_size),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

fn existing_file(path: &Path) -> Result<fs::Metadata, HostwireError> {
    let meta = fs::metadata(path).map_err(|err| HostwireError::from_io(err, path.display()))?;
    if meta.is_dir() {
        return Err(HostwireError::InvalidPath {
            message: format!("{} is a directory", path.display()),
        });
    }
    Ok(meta)
}

struct ListDrives;

#[derive(Debug, Deserialize, JsonSchema)]
struct NoParams {}

#[async_trait]
impl Tool for ListDrives {
    fn name(&self) -> &'static str {
        "list_drives"
    }

    fn description(&self) -> &'static str {
        "List mounted volumes with their free and total space."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<NoParams>()
    }

    async fn call(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let disks = blocking(|| {
            os::disks().map_err(|err| HostwireError::from_io(err, "volume table"))
        })
        .await?;
        let mut text = String::from("Mounted volumes:\n");
        for disk in &disks {
            match (disk.available_bytes, disk.total_bytes) {
                (Some(free), Some(total)) => text.push_str(&format!(
                    "{} ({}): {} free of {}\n",
                    disk.mount_point,
                    disk.filesystem,
                    format_size(free),
                    format_size(total)
                )),
                _ => text.push_str(&format!("{}\n", disk.mount_point)),
            }
        }
        Ok(ToolOutput::with_structured(text, json!({ "drives": disks })))
    }
}

struct CreateFile;

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateFileParams {
    /// Path of the file, relative to the workspace or absolute.
    filename: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Tool for CreateFile {
    fn name(&self) -> &'static str {
        "create_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a text file, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<CreateFileParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: CreateFileParams = parse_params(params)?;
        let filename = require_text(params.filename, "filename")?;
        let policy = ctx.policy.clone();
        blocking(move || {
            let path = policy.resolve_path(&filename)?;
            if path.is_dir() {
                return Err(HostwireError::InvalidPath {
                    message: format!("{} is a directory", path.display()),
                });
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| HostwireError::from_io(err, parent.display()))?;
            }
            fs::write(&path, params.content.as_bytes())
                .map_err(|err| HostwireError::from_io(err, path.display()))?;
            let bytes = params.content.len();
            Ok(ToolOutput::with_structured(
                format!("Created file {} ({})", path.display(), format_size(bytes as u64)),
                json!({ "path": path, "bytes": bytes }),
            ))
        })
        .await
    }
}

struct ReadFile;

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileParams {
    filename: String,
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ReadFileParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: ReadFileParams = parse_params(params)?;
        let filename = require_text(params.filename, "filename")?;
        let policy = ctx.policy.clone();
        let max_bytes = ctx.limits.max_read_bytes;
        blocking(move || {
            let path = policy.resolve_path(&filename)?;
            let meta = existing_file(&path)?;
            if meta.len() > max_bytes {
                return Err(HostwireError::invalid(format!(
                    "{} is {}, above the {} read limit",
                    path.display(),
                    format_size(meta.len()),
                    format_size(max_bytes)
                )));
            }
            let raw = fs::read(&path).map_err(|err| HostwireError::from_io(err, path.display()))?;
            let content = String::from_utf8(raw).map_err(|_| HostwireError::DecodeError {
                path: path.display().to_string(),
            })?;
            Ok(ToolOutput::with_structured(
                format!("Contents of {}:\n{}", path.display(), content),
                json!({ "path": path, "content": content }),
            ))
        })
        .await
    }
}

struct EditFile;

#[derive(Debug, Deserialize, JsonSchema)]
struct EditFileParams {
    filename: String,
    /// New full content of the file; empties it when omitted.
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replace the content of an existing file, keeping a <name>.backup copy of the previous content."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<EditFileParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: EditFileParams = parse_params(params)?;
        let filename = require_text(params.filename, "filename")?;
        let policy = ctx.policy.clone();
        blocking(move || {
            let path = policy.resolve_path(&filename)?;
            existing_file(&path)?;
            let backup = policy.check_path(&backup_path(&path))?;
            let stale_link = fs::symlink_metadata(&backup)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if stale_link {
                fs::remove_file(&backup)
                    .map_err(|err| HostwireError::from_io(err, backup.display()))?;
            }
            // No overwrite unless the backup landed first.
            fs::copy(&path, &backup).map_err(|err| {
                HostwireError::from_io(
                    err,
                    format!("backup {} (file left unchanged)", backup.display()),
                )
            })?;
            fs::write(&path, params.content.as_bytes())
                .map_err(|err| HostwireError::from_io(err, path.display()))?;
            Ok(ToolOutput::with_structured(
                format!(
                    "Updated {} (previous content saved to {})",
                    path.display(),
                    backup.display()
                ),
                json!({ "path": path, "backup": backup, "bytes": params.content.len() }),
            ))
        })
        .await
    }
}

struct DeleteFile;

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteFileParams {
    /// File or directory to remove; directories are removed recursively.
    filename: String,
}

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> &'static str {
        "Delete a file, or a directory and everything below it."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<DeleteFileParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: DeleteFileParams = parse_params(params)?;
        let filename = require_text(params.filename, "filename")?;
        let policy = ctx.policy.clone();
        blocking(move || {
            let path = policy.resolve_path(&filename)?;
            let meta = fs::symlink_metadata(&path)
                .map_err(|err| HostwireError::from_io(err, path.display()))?;
            let kind = if meta.is_dir() {
                if policy.is_allowed_root(&path) {
                    return Err(HostwireError::denied(format!(
                        "refusing to delete allowed root {}",
                        path.display()
                    )));
                }
                fs::remove_dir_all(&path)
                    .map_err(|err| HostwireError::from_io(err, path.display()))?;
                "directory"
            } else {
                fs::remove_file(&path).map_err(|err| HostwireError::from_io(err, path.display()))?;
                "file"
            };
            Ok(ToolOutput::with_structured(
                format!("Deleted {kind} {}", path.display()),
                json!({ "path": path, "kind": kind }),
            ))
        })
        .await
    }
}

struct CreateDirectory;

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateDirectoryParams {
    dirname: String,
}

#[async_trait]
impl Tool for CreateDirectory {
    fn name(&self) -> &'static str {
        "create_directory"
    }

    fn description(&self) -> &'static str {
        "Create a directory and any missing parents."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<CreateDirectoryParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: CreateDirectoryParams = parse_params(params)?;
        let dirname = require_text(params.dirname, "dirname")?;
        let policy = ctx.policy.clone();
        blocking(move || {
            let path = policy.resolve_path(&dirname)?;
            if path.exists() && !path.is_dir() {
                return Err(HostwireError::InvalidPath {
                    message: format!("{} exists and is not a directory", path.display()),
                });
            }
            fs::create_dir_all(&path).map_err(|err| HostwireError::from_io(err, path.display()))?;
            Ok(ToolOutput::with_structured(
                format!("Created directory {}", path.display()),
                json!({ "path": path }),
            ))
        })
        .await
    }
}

struct ListFiles;

#[derive(Debug, Deserialize, JsonSchema)]
struct ListFilesParams {
    /// Directory to list; defaults to the workspace.
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List a directory's entries with their kind and size."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ListFilesParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: ListFilesParams = parse_params(params)?;
        let policy = ctx.policy.clone();
        let raw = params
            .path
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| policy.workspace().display().to_string());
        blocking(move || {
            let dir = policy.resolve_path(&raw)?;
            let meta = fs::metadata(&dir).map_err(|err| HostwireError::from_io(err, dir.display()))?;
            if !meta.is_dir() {
                return Err(HostwireError::InvalidPath {
                    message: format!("{} is not a directory", dir.display()),
                });
            }
            let listing = list_directory(&dir)?;
            Ok(ToolOutput::with_structured(listing.render(), &listing))
        })
        .await
    }
}

struct FileOperations;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum FileOperation {
    Copy,
    Move,
    Search,
    Permissions,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FileOperationsParams {
    operation: FileOperation,
    /// Source path for `copy` and `move`.
    #[serde(default)]
    source: Option<String>,
    /// Destination path for `copy` and `move`.
    #[serde(default)]
    destination: Option<String>,
    /// Directory to search, or the target of `permissions`.
    #[serde(default)]
    path: Option<String>,
    /// File-name glob for `search`; a plain word matches as a substring.
    #[serde(default)]
    pattern: Option<String>,
    /// Octal mode to apply with `permissions` (unix only).
    #[serde(default)]
    mode: Option<String>,
}

#[async_trait]
impl Tool for FileOperations {
    fn name(&self) -> &'static str {
        "file_operations"
    }

    fn description(&self) -> &'static str {
        "Copy, move or search files, or read/set permissions (operation: copy|move|search|permissions)."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<FileOperationsParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: FileOperationsParams = parse_params(params)?;
        let policy = ctx.policy.clone();
        blocking(move || match params.operation {
            FileOperation::Copy | FileOperation::Move => {
                let source = required(params.source, "source")?;
                let destination = required(params.destination, "destination")?;
                let source = policy.resolve_path(&source)?;
                let destination = policy.resolve_path(&destination)?;
                transfer(&policy, &source, &destination, params.operation)
            }
            FileOperation::Search => {
                let pattern = required(params.pattern, "pattern")?;
                let root = match params.path.filter(|path| !path.trim().is_empty()) {
                    Some(path) => policy.resolve_path(&path)?,
                    None => policy.workspace().to_path_buf(),
                };
                search(&root, &pattern)
            }
            FileOperation::Permissions => {
                let target = params
                    .path
                    .or(params.source)
                    .filter(|path| !path.trim().is_empty())
                    .ok_or_else(|| HostwireError::missing("path"))?;
                let target = policy.resolve_path(&target)?;
                permissions(&target, params.mode.as_deref())
            }
        })
        .await
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, HostwireError> {
    require_text(value.unwrap_or_default(), name)
}

fn transfer(
    policy: &PolicyGuard,
    source: &Path,
    destination: &Path,
    operation: FileOperation,
) -> Result<ToolOutput, HostwireError> {
    let meta = fs::symlink_metadata(source)
        .map_err(|err| HostwireError::from_io(err, source.display()))?;
    let target = if destination.is_dir() {
        match source.file_name() {
            Some(name) => destination.join(name),
            None => destination.to_path_buf(),
        }
    } else {
        destination.to_path_buf()
    };
    if target == source {
        return Err(HostwireError::invalid("source and destination are the same path"));
    }
    if meta.is_dir() && target.starts_with(source) {
        return Err(HostwireError::invalid(format!(
            "cannot place {} inside itself",
            source.display()
        )));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| HostwireError::from_io(err, parent.display()))?;
    }

    let verb = match operation {
        FileOperation::Move => {
            if let Err(err) = fs::rename(source, &target) {
                if !is_cross_device(&err) {
                    return Err(HostwireError::from_io(err, source.display()));
                }
                copy_recursive(policy, source, &target)?;
                remove_any(source)?;
            }
            "Moved"
        }
        _ => {
            copy_recursive(policy, source, &target)?;
            "Copied"
        }
    };
    Ok(ToolOutput::with_structured(
        format!("{verb} {} to {}", source.display(), target.display()),
        json!({ "source": source, "destination": target }),
    ))
}

#[cfg(unix)]
fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_err: &std::io::Error) -> bool {
    false
}

/// Copies a file or tree. Links inside the tree are recreated, not followed,
/// and must point inside the allowed roots.
fn copy_recursive(policy: &PolicyGuard, source: &Path, target: &Path) -> Result<(), HostwireError> {
    if !source.is_dir() {
        fs::copy(source, target).map_err(|err| HostwireError::from_io(err, source.display()))?;
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| HostwireError::unexpected(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| HostwireError::unexpected(err.to_string()))?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|err| HostwireError::from_io(err, dest.display()))?;
        } else if entry.file_type().is_symlink() {
            policy.check_path(entry.path())?;
            copy_link(entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)
                .map_err(|err| HostwireError::from_io(err, entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(link: &Path, dest: &Path) -> Result<(), HostwireError> {
    let target = fs::read_link(link).map_err(|err| HostwireError::from_io(err, link.display()))?;
    std::os::unix::fs::symlink(&target, dest).map_err(|err| HostwireError::from_io(err, dest.display()))
}

#[cfg(not(unix))]
fn copy_link(link: &Path, dest: &Path) -> Result<(), HostwireError> {
    fs::copy(link, dest)
        .map(|_| ())
        .map_err(|err| HostwireError::from_io(err, link.display()))
}

fn remove_any(path: &Path) -> Result<(), HostwireError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|err| HostwireError::from_io(err, path.display()))
}

fn search(root: &Path, pattern: &str) -> Result<ToolOutput, HostwireError> {
    if !root.is_dir() {
        return Err(HostwireError::InvalidPath {
            message: format!("{} is not a directory", root.display()),
        });
    }
    let glob = if pattern.contains(['*', '?', '[', '{']) {
        pattern.to_string()
    } else {
        format!("*{pattern}*")
    };
    let matcher = GlobBuilder::new(&glob)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map_err(|err| HostwireError::invalid(format!("invalid pattern: {err}")))?
        .compile_matcher();

    let mut matches = Vec::new();
    let mut truncated = false;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(SEARCH_MAX_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if matcher.is_match(entry.file_name()) {
            if matches.len() == SEARCH_RESULT_CAP {
                truncated = true;
                break;
            }
            matches.push(entry.path().display().to_string());
        }
    }

    let mut text = format!(
        "Found {} match{} for `{pattern}` under {}:\n",
        matches.len(),
        if matches.len() == 1 { "" } else { "es" },
        root.display()
    );
    for path in &matches {
        text.push_str(path);
        text.push('\n');
    }
    if truncated {
        text.push_str(&format!("... stopped after {SEARCH_RESULT_CAP} matches\n"));
    }
    Ok(ToolOutput::with_structured(
        text,
        json!({ "root": root, "matches": matches, "truncated": truncated }),
    ))
}

fn permissions(path: &Path, mode: Option<&str>) -> Result<ToolOutput, HostwireError> {
    match mode.map(str::trim).filter(|mode| !mode.is_empty()) {
        Some(mode) => {
            set_mode(path, mode)?;
            describe_permissions(path, "Set permissions of")
        }
        None => describe_permissions(path, "Permissions of"),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: &str) -> Result<(), HostwireError> {
    use std::os::unix::fs::PermissionsExt;
    let digits = mode.trim_start_matches("0o");
    let bits = u32::from_str_radix(digits, 8)
        .ok()
        .filter(|bits| *bits <= 0o7777)
        .ok_or_else(|| HostwireError::invalid(format!("mode `{mode}` is not an octal permission")))?;
    fs::set_permissions(path, fs::Permissions::from_mode(bits))
        .map_err(|err| HostwireError::from_io(err, path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: &str) -> Result<(), HostwireError> {
    Err(HostwireError::invalid(
        "setting a numeric mode is only supported on unix hosts",
    ))
}

fn describe_permissions(path: &Path, verb: &str) -> Result<ToolOutput, HostwireError> {
    let meta = fs::metadata(path).map_err(|err| HostwireError::from_io(err, path.display()))?;
    let readonly = meta.permissions().readonly();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o7777;
        Ok(ToolOutput::with_structured(
            format!("{verb} {}: {:04o} ({})", path.display(), mode, symbolic_mode(mode)),
            json!({ "path": path, "mode": format!("{mode:04o}"), "readonly": readonly }),
        ))
    }
    #[cfg(not(unix))]
    {
        Ok(ToolOutput::with_structured(
            format!(
                "{verb} {}: {}",
                path.display(),
                if readonly { "read-only" } else { "writable" }
            ),
            json!({ "path": path, "readonly": readonly }),
        ))
    }
}

#[cfg(unix)]
fn symbolic_mode(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostwire_error::ErrorKind;
    use serde_json::json;

    use super::*;
    use crate::policy::PolicyConfig;
    use crate::tools::tests::context_for;
    use crate::tools::ToolContext;

    async fn run(tool: &dyn Tool, ctx: &Arc<ToolContext>, params: Value) -> Result<ToolOutput, HostwireError> {
        tool.call(params, ctx).await
    }

    #[tokio::test]
    async fn edit_file_keeps_an_identical_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::write(dir.path().join("notes.txt"), "old content").expect("seed");

        run(&EditFile, &ctx, json!({"filename": "notes.txt", "content": "new content"}))
            .await
            .expect("edit");

        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt.backup")).expect("backup"),
            "old content"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt")).expect("file"),
            "new content"
        );
    }

    #[tokio::test]
    async fn edit_file_requires_an_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        let err = run(&EditFile, &ctx, json!({"filename": "absent.txt", "content": "x"}))
            .await
            .expect_err("absent");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = run(&EditFile, &ctx, json!({"content": "x"}))
            .await
            .expect_err("no filename");
        assert_eq!(err.kind(), ErrorKind::MissingParameter);
    }

    #[tokio::test]
    async fn edit_file_without_content_empties_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::write(dir.path().join("notes.txt"), "old").expect("seed");
        run(&EditFile, &ctx, json!({"filename": "notes.txt"}))
            .await
            .expect("edit");
        assert_eq!(fs::read_to_string(dir.path().join("notes.txt")).expect("file"), "");
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt.backup")).expect("backup"),
            "old"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn edit_file_replaces_a_linked_backup_instead_of_following_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::write(dir.path().join("notes.txt"), "old").expect("seed");
        fs::write(dir.path().join("other.txt"), "keep me").expect("other");
        std::os::unix::fs::symlink(
            dir.path().join("other.txt"),
            dir.path().join("notes.txt.backup"),
        )
        .expect("link");

        run(&EditFile, &ctx, json!({"filename": "notes.txt", "content": "new"}))
            .await
            .expect("edit");
        let backup = dir.path().join("notes.txt.backup");
        assert!(!fs::symlink_metadata(&backup).expect("backup").file_type().is_symlink());
        assert_eq!(fs::read_to_string(&backup).expect("backup"), "old");
        assert_eq!(fs::read_to_string(dir.path().join("other.txt")).expect("other"), "keep me");
    }

    #[tokio::test]
    async fn read_file_rejects_binary_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00, 0x80]).expect("seed");
        let err = run(&ReadFile, &ctx, json!({"filename": "blob.bin"}))
            .await
            .expect_err("binary");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[tokio::test]
    async fn create_read_and_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        run(&CreateFile, &ctx, json!({"filename": "a/b/c.txt", "content": "hello"}))
            .await
            .expect("create");
        let read = run(&ReadFile, &ctx, json!({"filename": "a/b/c.txt"}))
            .await
            .expect("read");
        assert_eq!(read.structured.expect("structured")["content"], "hello");

        run(&DeleteFile, &ctx, json!({"filename": "a"}))
            .await
            .expect("delete dir");
        assert!(!dir.path().join("a").exists());

        let err = run(&DeleteFile, &ctx, json!({"filename": dir.path().display().to_string()}))
            .await
            .expect_err("root");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn listing_reports_every_entry_and_a_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("sub")).expect("sub");
        fs::write(dir.path().join("one.txt"), "12345").expect("one");
        fs::write(dir.path().join("Two.md"), "").expect("two");

        let listing = list_directory(dir.path()).expect("listing");
        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["..", "sub", "one.txt", "Two.md"]);
        assert_eq!(listing.total, 3);
        assert!(!listing.truncated);
        assert_eq!(listing.entries[1].kind, EntryKind::Directory);
        assert_eq!(listing.entries[2].size.as_deref(), Some("5 B"));
    }

    #[test]
    fn unreadable_entries_are_listed_as_inaccessible() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("ok.txt"), "1").expect("ok");
        let entries = describe_entries(
            dir.path(),
            vec![
                Ok(dir.path().join("ok.txt")),
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
                Ok(dir.path().join("vanished.txt")),
            ],
        );
        let kinds: Vec<EntryKind> = entries.iter().map(|entry| entry.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::File, EntryKind::Inaccessible, EntryKind::Inaccessible]
        );
        assert_eq!(entries[2].name, "vanished.txt");
    }

    #[test]
    fn filesystem_root_has_no_parent_entry() {
        let root = if cfg!(windows) { Path::new("C:\\") } else { Path::new("/") };
        let listing = list_directory(root).expect("root listing");
        assert!(listing.entries.iter().all(|entry| entry.name != ".."));
        assert!(listing.entries.len() <= ROOT_LISTING_CAP);
        assert_eq!(listing.truncated, listing.total > ROOT_LISTING_CAP);
    }

    #[tokio::test]
    async fn copy_move_and_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::create_dir_all(dir.path().join("src/nested")).expect("tree");
        fs::write(dir.path().join("src/nested/Report.TXT"), "r").expect("report");
        fs::write(dir.path().join("src/notes.md"), "n").expect("notes");

        run(
            &FileOperations,
            &ctx,
            json!({"operation": "copy", "source": "src", "destination": "backup"}),
        )
        .await
        .expect("copy");
        assert!(dir.path().join("backup/nested/Report.TXT").is_file());

        fs::create_dir(dir.path().join("archive")).expect("archive");
        run(
            &FileOperations,
            &ctx,
            json!({"operation": "move", "source": "src/notes.md", "destination": "archive"}),
        )
        .await
        .expect("move");
        assert!(dir.path().join("archive/notes.md").is_file());
        assert!(!dir.path().join("src/notes.md").exists());

        let found = run(
            &FileOperations,
            &ctx,
            json!({"operation": "search", "pattern": "report"}),
        )
        .await
        .expect("search");
        let matches = found.structured.expect("structured")["matches"]
            .as_array()
            .cloned()
            .expect("matches");
        assert_eq!(matches.len(), 2);

        let err = run(&FileOperations, &ctx, json!({"operation": "copy", "source": "src"}))
            .await
            .expect_err("no destination");
        assert_eq!(err.kind(), ErrorKind::MissingParameter);
        let err = run(&FileOperations, &ctx, json!({"operation": "shred"}))
            .await
            .expect_err("bad op");
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_recreates_links_and_refuses_ones_that_leave_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::create_dir(dir.path().join("src")).expect("src");
        fs::write(dir.path().join("src/data.txt"), "d").expect("data");
        std::os::unix::fs::symlink("data.txt", dir.path().join("src/alias")).expect("inner link");

        run(
            &FileOperations,
            &ctx,
            json!({"operation": "copy", "source": "src", "destination": "dst"}),
        )
        .await
        .expect("copy");
        let alias = dir.path().join("dst/alias");
        assert!(fs::symlink_metadata(&alias).expect("alias").file_type().is_symlink());
        assert_eq!(fs::read_to_string(&alias).expect("through link"), "d");

        fs::write(outside.path().join("secret.txt"), "secret").expect("secret");
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("src/leak"),
        )
        .expect("outer link");
        let err = run(
            &FileOperations,
            &ctx,
            json!({"operation": "copy", "source": "src", "destination": "dst2"}),
        )
        .await
        .expect_err("escaping link");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!dir.path().join("dst2/leak").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permissions_read_and_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_for(dir.path(), PolicyConfig::default());
        fs::write(dir.path().join("run.sh"), "#!/bin/sh\n").expect("seed");
        let output = run(
            &FileOperations,
            &ctx,
            json!({"operation": "permissions", "path": "run.sh", "mode": "755"}),
        )
        .await
        .expect("chmod");
        assert_eq!(output.structured.expect("structured")["mode"], "0755");
        assert!(output.text.contains("rwxr-xr-x"));

        let err = run(
            &FileOperations,
            &ctx,
            json!({"operation": "permissions", "path": "run.sh", "mode": "999"}),
        )
        .await
        .expect_err("bad mode");
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }
}

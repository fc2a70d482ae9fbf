use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use msixcore_core::{percent_decode_file_name, MANIFEST_FILE_NAME};
use tracing::warn;

use crate::InstallLayout;

static TMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Expands a package container, keeping entry names exactly as stored.
pub trait PackageUnpacker: Send + Sync {
    fn unpack(&self, package_path: &Path, destination: &Path) -> Result<()>;
}

/// Unpacks with the platform's ZIP tooling, trying each tool in turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandUnpacker;

impl PackageUnpacker for CommandUnpacker {
    fn unpack(&self, package_path: &Path, destination: &Path) -> Result<()> {
        unpack_with_runner(package_path, destination, run_command)
    }
}

pub(crate) fn unpack_with_runner<RunCommand>(
    package_path: &Path,
    destination: &Path,
    mut run_command: RunCommand,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
{
    fs::create_dir_all(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;

    let mut failures = Vec::new();
    for (mut command, context) in build_unpack_commands(package_path, destination) {
        match run_command(&mut command, context) {
            Ok(()) => return Ok(()),
            Err(err) => failures.push(format!("{err:#}")),
        }
    }
    Err(anyhow!(
        "failed to unpack package {}: {}",
        package_path.display(),
        failures.join("; ")
    ))
}

pub(crate) fn build_unpack_commands(
    package_path: &Path,
    destination: &Path,
) -> Vec<(Command, &'static str)> {
    let mut commands = Vec::new();
    if cfg!(windows) {
        let mut command = Command::new("powershell");
        command.arg("-NoProfile").arg("-Command").arg(format!(
            "Add-Type -AssemblyName System.IO.Compression.FileSystem; [System.IO.Compression.ZipFile]::ExtractToDirectory('{}', '{}')",
            escape_ps_single_quote(package_path),
            escape_ps_single_quote(destination)
        ));
        commands.push((command, "failed to unpack package with powershell"));
    }

    let mut unzip = Command::new("unzip");
    unzip
        .arg("-q")
        .arg("-o")
        .arg(package_path)
        .arg("-d")
        .arg(destination);
    commands.push((unzip, "failed to unpack package with unzip"));

    let mut tar = Command::new("tar");
    tar.arg("-xf").arg(package_path).arg("-C").arg(destination);
    commands.push((tar, "failed to unpack package with tar"));
    commands
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Payload,
    Footprint,
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageEntry {
    pub(crate) source: PathBuf,
    pub(crate) relative: PathBuf,
    pub(crate) kind: EntryKind,
}

const FOOTPRINT_FILES: [&str; 3] = [
    "AppxBlockMap.xml",
    "AppxSignature.p7x",
    "AppxMetadata/CodeIntegrity.cat",
];
const CONTAINER_FILES: [&str; 1] = ["[Content_Types].xml"];

/// Lists the files of an unpacked package with percent-decoded relative
/// paths: payload first, then footprint files, manifest last.
pub(crate) fn collect_package_entries(raw_dir: &Path) -> Result<Vec<PackageEntry>> {
    let mut entries = Vec::new();
    collect_entries_recursive(raw_dir, raw_dir, &mut entries)?;
    entries.sort_by(|left, right| {
        entry_order(left.kind)
            .cmp(&entry_order(right.kind))
            .then_with(|| left.relative.cmp(&right.relative))
    });
    Ok(entries)
}

fn entry_order(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::Payload => 0,
        EntryKind::Footprint => 1,
        EntryKind::Manifest => 2,
    }
}

fn collect_entries_recursive(
    raw_root: &Path,
    current: &Path,
    entries: &mut Vec<PackageEntry>,
) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            collect_entries_recursive(raw_root, &path, entries)?;
            continue;
        }
        if !metadata.is_file() {
            warn!(path = %path.display(), "skipping non-regular package entry");
            continue;
        }

        let raw_relative = path
            .strip_prefix(raw_root)
            .with_context(|| format!("failed to relativize {}", path.display()))?;
        let relative = decode_relative_path(raw_relative)?;
        let Some(kind) = classify_entry(&relative) else {
            continue;
        };
        entries.push(PackageEntry {
            source: path,
            relative,
            kind,
        });
    }
    Ok(())
}

fn decode_relative_path(raw_relative: &Path) -> Result<PathBuf> {
    let mut decoded = PathBuf::new();
    for component in raw_relative.components() {
        let raw = component.as_os_str().to_str().ok_or_else(|| {
            anyhow!(
                "package entry name is not valid unicode: {}",
                raw_relative.display()
            )
        })?;
        let name = percent_decode_file_name(raw)
            .with_context(|| format!("failed to decode package entry name '{raw}'"))?;
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(|ch: char| ch == '/' || ch == '\\')
        {
            return Err(anyhow!(
                "package entry '{}' decodes to an unsafe path component '{name}'",
                raw_relative.display()
            ));
        }
        decoded.push(name);
    }
    Ok(decoded)
}

fn classify_entry(relative: &Path) -> Option<EntryKind> {
    let key = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if CONTAINER_FILES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(&key))
    {
        return None;
    }
    if key.eq_ignore_ascii_case(MANIFEST_FILE_NAME) {
        return Some(EntryKind::Manifest);
    }
    if FOOTPRINT_FILES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(&key))
    {
        return Some(EntryKind::Footprint);
    }
    Some(EntryKind::Payload)
}

pub(crate) fn make_tmp_dir(layout: &InstallLayout, prefix: &str) -> Result<PathBuf> {
    let mut dir = layout.tmp_dir();
    dir.push(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        current_unix_timestamp()?,
        TMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating tmp dir: {}", dir.display()))?;
    Ok(dir)
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// Temporary working directory removed when dropped.
#[derive(Debug)]
pub(crate) struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub(crate) fn create(layout: &InstallLayout, prefix: &str) -> Result<Self> {
        Ok(Self {
            path: make_tmp_dir(layout, prefix)?,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove tmp dir");
            }
        }
    }
}

pub(crate) fn copy_file_creating_parents(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

pub(crate) fn move_dir_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create install parent: {}", parent.display()))?;
    }

    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if let Err(err) = copy_dir_recursive(src, dst) {
        // A half-copied destination must not look like a finished install.
        if let Err(cleanup) = fs::remove_dir_all(dst) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dst.display(), error = %cleanup, "failed to remove partial copy");
            }
        }
        return Err(err);
    }
    fs::remove_dir_all(src)
        .with_context(|| format!("failed to cleanup staging dir: {}", src.display()))?;
    Ok(())
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }
        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

/// Lists regular files under `root` as paths relative to it.
pub(crate) fn list_relative_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if root.is_dir() {
        list_relative_files_recursive(root, root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn list_relative_files_recursive(root: &Path, current: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            list_relative_files_recursive(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

fn escape_ps_single_quote(path: &Path) -> String {
    let mut os = OsString::new();
    os.push(path.as_os_str());
    os.to_string_lossy().replace('\'', "''")
}

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use msixcore_registry::PackageRegistry;
use tracing::warn;

use crate::fs_utils::{prune_empty_parents, remove_file_if_exists};
use crate::staging::list_relative_files;
use crate::DeploymentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalResult {
    pub full_name: String,
    pub removed_shared: Vec<PathBuf>,
    pub retained_shared: Vec<PathBuf>,
}

/// Deletes a package directory and every shared file it deployed that no
/// other installed package also carries. References are recomputed from the
/// install root on every call. Nothing is restored if a step fails midway.
pub fn remove_package_content(
    registry: &PackageRegistry,
    full_name: &str,
    on_progress: &mut dyn FnMut(f32),
) -> Result<RemovalResult> {
    let package_dir = registry.installed_dir(full_name)?;
    if !package_dir.is_dir() {
        return Err(DeploymentError::NotFound(full_name.to_string()).into());
    }

    let shared_files = match find_vfs_dir(&package_dir)? {
        Some(vfs_dir) => list_relative_files(&vfs_dir)?,
        None => Vec::new(),
    };
    let referenced = shared_references(registry, full_name)?;
    let total = shared_files.len() + 1;

    fs::remove_dir_all(&package_dir)
        .with_context(|| format!("failed to remove package dir: {}", package_dir.display()))?;
    on_progress(100.0 / total as f32);

    let shared_root = registry.shared_root();
    let mut removed_shared = Vec::new();
    let mut retained_shared = Vec::new();
    for (index, relative) in shared_files.into_iter().enumerate() {
        let target = shared_root.join(&relative);
        if referenced.contains(&shared_key(&relative)) {
            retained_shared.push(target);
        } else {
            remove_file_if_exists(&target)
                .with_context(|| format!("failed to remove shared file: {}", target.display()))?;
            prune_empty_parents(&target, shared_root);
            removed_shared.push(target);
        }
        on_progress((index + 2) as f32 * 100.0 / total as f32);
    }

    Ok(RemovalResult {
        full_name: full_name.to_string(),
        removed_shared,
        retained_shared,
    })
}

/// Shared-content keys carried by every installed package except `excluding`.
fn shared_references(registry: &PackageRegistry, excluding: &str) -> Result<HashSet<String>> {
    let mut referenced = HashSet::new();
    for (full_name, package_dir) in registry.package_dirs()? {
        if full_name == excluding {
            continue;
        }
        let vfs_dir = match find_vfs_dir(&package_dir) {
            Ok(Some(vfs_dir)) => vfs_dir,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    package_dir = %package_dir.display(),
                    error = %format!("{err:#}"),
                    "failed to scan package for shared content"
                );
                continue;
            }
        };
        for relative in list_relative_files(&vfs_dir)? {
            referenced.insert(shared_key(&relative));
        }
    }
    Ok(referenced)
}

fn find_vfs_dir(package_dir: &Path) -> Result<Option<PathBuf>> {
    for entry in fs::read_dir(package_dir)
        .with_context(|| format!("failed to read {}", package_dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case("VFS") && entry.path().is_dir()
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Case-insensitive key for a path relative to the shared content root.
fn shared_key(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_lowercase())
        .collect::<Vec<_>>()
        .join("/")
}

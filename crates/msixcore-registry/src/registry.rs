use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use msixcore_core::{
    family_name_from_full_name, AppxManifest, IdentityError, InstalledPackage, Package,
    PackageFullName,
};
use tracing::warn;

use crate::PackagePattern;

/// Read-only view over an install root holding one directory per package,
/// named by its full name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRegistry {
    packages_root: PathBuf,
    shared_root: PathBuf,
}

impl PackageRegistry {
    pub fn new(packages_root: impl Into<PathBuf>, shared_root: impl Into<PathBuf>) -> Self {
        Self {
            packages_root: packages_root.into(),
            shared_root: shared_root.into(),
        }
    }

    pub fn packages_root(&self) -> &Path {
        &self.packages_root
    }

    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }

    pub fn package_dir(&self, full_name: &str) -> PathBuf {
        self.packages_root.join(full_name)
    }

    /// Install directory for a well-formed full name. Anything that could
    /// resolve outside a single child of the install root is rejected.
    pub fn installed_dir(&self, full_name: &str) -> Result<PathBuf, IdentityError> {
        let full_name = PackageFullName::parse(full_name)?;
        Ok(self.packages_root.join(full_name.as_str()))
    }

    /// A malformed full name is a lookup miss.
    pub fn find(&self, full_name: &str) -> Result<Option<InstalledPackage>> {
        let Ok(package_dir) = self.installed_dir(full_name) else {
            return Ok(None);
        };
        if !package_dir.is_dir() {
            return Ok(None);
        }
        self.read_installed(full_name, &package_dir).map(Some)
    }

    pub fn find_by_family(&self, family_name: &str) -> Result<Option<InstalledPackage>> {
        for (full_name, package_dir) in self.package_dirs()? {
            let Ok(candidate_family) = family_name_from_full_name(&full_name) else {
                continue;
            };
            if !candidate_family.eq_ignore_ascii_case(family_name) {
                continue;
            }
            match self.read_installed(&full_name, &package_dir) {
                Ok(package) => return Ok(Some(package)),
                Err(err) => warn!(
                    package_dir = %package_dir.display(),
                    error = %format!("{err:#}"),
                    "skipping package directory with unreadable manifest"
                ),
            }
        }
        Ok(None)
    }

    /// Every readable package whose full name or family name matches
    /// `pattern`. Entries that fail to read are logged and skipped.
    pub fn find_all(&self, pattern: &str) -> Result<Vec<InstalledPackage>> {
        let pattern = PackagePattern::parse(pattern)?;
        let mut packages = Vec::new();
        for (full_name, package_dir) in self.package_dirs()? {
            let family_name = family_name_from_full_name(&full_name).unwrap_or_default();
            if !pattern.matches(&full_name, &family_name) {
                continue;
            }
            match self.read_installed(&full_name, &package_dir) {
                Ok(package) => packages.push(package),
                Err(err) => warn!(
                    package_dir = %package_dir.display(),
                    error = %format!("{err:#}"),
                    "skipping package directory with unreadable manifest"
                ),
            }
        }
        Ok(packages)
    }

    pub fn installed(&self) -> Result<Vec<InstalledPackage>> {
        self.find_all("*")
    }

    /// Immediate subdirectories of the install root, sorted by name. A missing
    /// root is an empty registry.
    pub fn package_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = match fs::read_dir(&self.packages_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to read package install root: {}",
                        self.packages_root.display()
                    )
                })
            }
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!(
                    "failed to read package install root entry: {}",
                    self.packages_root.display()
                )
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => dirs.push((name, path)),
                Err(name) => warn!(
                    name = %name.to_string_lossy(),
                    "skipping package directory with non-unicode name"
                ),
            }
        }
        dirs.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(dirs)
    }

    fn read_installed(&self, dir_name: &str, package_dir: &Path) -> Result<InstalledPackage> {
        let manifest = AppxManifest::read_from_dir(package_dir).with_context(|| {
            format!("failed to read package manifest in {}", package_dir.display())
        })?;
        let package = Package::from_manifest(manifest, package_dir);
        if package.full_name().as_str() != dir_name {
            return Err(anyhow!(
                "package manifest identity '{}' does not match install directory '{}'",
                package.full_name(),
                package_dir.display()
            ));
        }
        Ok(InstalledPackage::new(
            package,
            package_dir.to_path_buf(),
            &self.shared_root,
        ))
    }
}

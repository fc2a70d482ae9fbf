use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::{AppxManifest, PackageFullName, PackageIdentity, PackageVersion};

const VFS_DIR_NAME: &str = "VFS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoSource {
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Read-only metadata snapshot of a package, taken when its manifest was
/// read. It does not track later changes on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    identity: PackageIdentity,
    full_name: PackageFullName,
    family_name: String,
    display_name: String,
    publisher_display_name: String,
    capabilities: BTreeSet<String>,
    application_id: Option<String>,
    relative_executable: Option<String>,
    logo: Option<LogoSource>,
}

impl Package {
    pub fn from_manifest(manifest: AppxManifest, package_root: &Path) -> Self {
        let full_name = manifest.identity.full_name();
        let family_name = manifest.identity.family_name();
        let logo = manifest
            .logo
            .as_deref()
            .and_then(|logo| resolve_logo_path(package_root, logo))
            .map(LogoSource::File);
        let (application_id, relative_executable) = manifest
            .primary_application()
            .map(|application| (Some(application.id.clone()), application.executable.clone()))
            .unwrap_or_default();

        Self {
            display_name: manifest
                .display_name
                .unwrap_or_else(|| manifest.identity.name.clone()),
            publisher_display_name: manifest
                .publisher_display_name
                .unwrap_or_else(|| manifest.identity.publisher.clone()),
            identity: manifest.identity,
            full_name,
            family_name,
            capabilities: manifest.capabilities,
            application_id,
            relative_executable,
            logo,
        }
    }

    /// Loads a file-backed logo into memory so the snapshot stays readable
    /// after its source directory is gone.
    pub fn with_inlined_logo(mut self) -> io::Result<Self> {
        if let Some(LogoSource::File(path)) = &self.logo {
            let bytes = fs::read(path)?;
            self.logo = Some(LogoSource::Bytes(bytes.into()));
        }
        Ok(self)
    }

    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.name
    }

    pub fn version(&self) -> PackageVersion {
        self.identity.version
    }

    pub fn publisher(&self) -> &str {
        &self.identity.publisher
    }

    pub fn full_name(&self) -> &PackageFullName {
        &self.full_name
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn publisher_display_name(&self) -> &str {
        &self.publisher_display_name
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn relative_executable(&self) -> Option<&str> {
        self.relative_executable.as_deref()
    }

    /// `FamilyName!ApplicationId`, when the package declares an application.
    pub fn application_user_model_id(&self) -> Option<String> {
        self.application_id
            .as_ref()
            .map(|id| format!("{}!{id}", self.family_name))
    }

    pub fn logo_source(&self) -> Option<&LogoSource> {
        self.logo.as_ref()
    }

    pub fn logo(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        match &self.logo {
            None => Ok(None),
            Some(LogoSource::File(path)) => Ok(Some(Box::new(File::open(path)?))),
            Some(LogoSource::Bytes(bytes)) => Ok(Some(Box::new(Cursor::new(Arc::clone(bytes))))),
        }
    }
}

/// A package present in the install root, with its on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    package: Package,
    install_location: PathBuf,
    resolved_executable: Option<PathBuf>,
}

impl InstalledPackage {
    pub fn new(package: Package, install_location: PathBuf, shared_root: &Path) -> Self {
        let resolved_executable = package
            .relative_executable()
            .map(|executable| resolve_executable(&install_location, shared_root, executable));
        Self {
            package,
            install_location,
            resolved_executable,
        }
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn into_package(self) -> Package {
        self.package
    }

    pub fn full_name(&self) -> &PackageFullName {
        self.package.full_name()
    }

    pub fn family_name(&self) -> &str {
        self.package.family_name()
    }

    pub fn install_location(&self) -> &Path {
        &self.install_location
    }

    pub fn resolved_executable(&self) -> Option<&Path> {
        self.resolved_executable.as_deref()
    }
}

/// Converts a manifest-relative path (either separator) into a relative
/// `PathBuf`. Parent and root components are dropped.
pub fn manifest_relative_path(value: &str) -> PathBuf {
    value
        .split(|ch: char| ch == '\\' || ch == '/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect()
}

/// Paths under `VFS\` live in the shared content root; everything else is
/// relative to the install location.
pub fn resolve_executable(install_location: &Path, shared_root: &Path, executable: &str) -> PathBuf {
    let relative = manifest_relative_path(executable);
    match vfs_relative_path(&relative) {
        Some(shared_relative) => shared_root.join(shared_relative),
        None => install_location.join(relative),
    }
}

/// Strips a leading `VFS` component (case-insensitive), returning the path
/// relative to the shared content root.
pub fn vfs_relative_path(relative: &Path) -> Option<PathBuf> {
    let mut components = relative.components();
    match components.next() {
        Some(Component::Normal(first))
            if first.to_string_lossy().eq_ignore_ascii_case(VFS_DIR_NAME) =>
        {
            let rest = components.as_path();
            (!rest.as_os_str().is_empty()).then(|| rest.to_path_buf())
        }
        _ => None,
    }
}

fn resolve_logo_path(package_root: &Path, logo: &str) -> Option<PathBuf> {
    let path = package_root.join(manifest_relative_path(logo));
    if path.is_file() {
        return Some(path);
    }

    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let scaled = match path.extension() {
        Some(extension) => format!("{stem}.scale-100.{}", extension.to_string_lossy()),
        None => format!("{stem}.scale-100"),
    };
    let scaled_path = path.with_file_name(scaled);
    scaled_path.is_file().then_some(scaled_path)
}

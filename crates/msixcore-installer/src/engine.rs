use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use msixcore_core::{
    family_name_from_full_name, vfs_relative_path, AppxManifest, InstalledPackage, Package,
    PackageFullName,
};
use msixcore_registry::PackageRegistry;
use tracing::{debug, info, warn};

use crate::inflight::{InFlightClaim, InFlightPackages};
use crate::native::materialize_stream;
use crate::source::download_package;
use crate::staging::{
    collect_package_entries, copy_file_creating_parents, move_dir_or_copy, EntryKind,
    PackageEntry, PackageUnpacker, WorkDir,
};
use crate::uninstall::{remove_package_content, RemovalResult};
use crate::{
    DeploymentBackend, DeploymentError, DeploymentOptions, DeploymentStrategy, InstallLayout,
    InstallationStep, PackageSource, ProgressReporter,
};

const EXTRACTION_CEILING: f32 = 99.0;

/// The self-hosted pipeline: unpack, read identity, extract into the install
/// root and deploy shared content, without any OS deployment service.
pub struct SelfHostedInstaller {
    layout: InstallLayout,
    registry: PackageRegistry,
    unpacker: Arc<dyn PackageUnpacker>,
    in_flight: Arc<InFlightPackages>,
    download_timeout: Duration,
}

/// State carried between install steps. Owned by the running operation and
/// dropped with it, which also removes the work directory.
struct AddRequest {
    source: Option<PackageSource>,
    work_dir: WorkDir,
    raw_dir: Option<PathBuf>,
    manifest: Option<AppxManifest>,
    superseded: Vec<String>,
    installed: Option<InstalledPackage>,
    _claim: Option<InFlightClaim>,
}

impl SelfHostedInstaller {
    pub fn new(
        layout: InstallLayout,
        unpacker: Arc<dyn PackageUnpacker>,
        in_flight: Arc<InFlightPackages>,
        download_timeout: Duration,
    ) -> Self {
        Self {
            registry: layout.registry(),
            layout,
            unpacker,
            in_flight,
            download_timeout,
        }
    }

    pub fn registry(&self) -> &PackageRegistry {
        &self.registry
    }

    pub fn install_package(
        &self,
        source: PackageSource,
        _options: DeploymentOptions,
        reporter: &mut ProgressReporter,
    ) -> Result<InstalledPackage> {
        self.layout.ensure_base_dirs()?;
        let mut request = AddRequest {
            source: Some(source),
            work_dir: WorkDir::create(&self.layout, "install")?,
            raw_dir: None,
            manifest: None,
            superseded: Vec::new(),
            installed: None,
            _claim: None,
        };

        let mut step = InstallationStep::Started;
        while !step.is_terminal() {
            enter_step(reporter, step)?;
            step = match step {
                InstallationStep::Started => self.stage_source(&mut request)?,
                InstallationStep::GetPackageInformation => {
                    self.read_package_information(&mut request)?
                }
                InstallationStep::Extraction => self.extract_and_register(&mut request, reporter)?,
                other => {
                    return Err(anyhow!(
                        "self-hosted install cannot continue from step '{}'",
                        other.as_str()
                    ))
                }
            };
        }

        request
            .installed
            .ok_or_else(|| anyhow!("self-hosted install finished without a registered package"))
    }

    pub fn remove_installed(
        &self,
        full_name: &str,
        reporter: &mut ProgressReporter,
    ) -> Result<RemovalResult> {
        enter_step(reporter, InstallationStep::Started)?;
        enter_step(reporter, InstallationStep::GetPackageInformation)?;
        let package_dir = self.registry.installed_dir(full_name)?;
        let _claim = self.in_flight.claim(full_name)?;
        if !package_dir.is_dir() {
            return Err(DeploymentError::NotFound(full_name.to_string()).into());
        }

        enter_step(reporter, InstallationStep::Extraction)?;
        let result = remove_package_content(&self.registry, full_name, &mut |percentage| {
            reporter.update(InstallationStep::Extraction, percentage)
        })?;
        info!(
            full_name,
            removed_shared = result.removed_shared.len(),
            retained_shared = result.retained_shared.len(),
            "removed package"
        );
        Ok(result)
    }

    /// Reads metadata from an unpacked package directory or a package file,
    /// without installing anything.
    pub fn package_info(&self, path: &Path) -> Result<Package> {
        if path.is_dir() {
            let manifest = AppxManifest::read_from_dir(path)?;
            return Ok(Package::from_manifest(manifest, path));
        }

        self.layout.ensure_base_dirs()?;
        let work_dir = WorkDir::create(&self.layout, "info")?;
        let raw_dir = self.unpack_into(path, work_dir.path())?;
        let manifest = AppxManifest::read_from_dir(&raw_dir)?;
        Package::from_manifest(manifest, &raw_dir)
            .with_inlined_logo()
            .with_context(|| format!("failed to read package logo from {}", path.display()))
    }

    fn stage_source(&self, request: &mut AddRequest) -> Result<InstallationStep> {
        let source = request
            .source
            .take()
            .ok_or_else(|| anyhow!("package source was already consumed"))?;
        let work_dir = request.work_dir.path().to_path_buf();

        let raw_dir = match source {
            PackageSource::Path(path) if path.is_dir() => path,
            PackageSource::Path(path) => self.unpack_into(&path, &work_dir)?,
            PackageSource::Stream(mut stream) => {
                let package_file = materialize_stream(&mut stream, &work_dir)?;
                self.unpack_into(&package_file, &work_dir)?
            }
            PackageSource::Url(url) => {
                let cache_path = self.layout.download_cache_path(&url);
                download_package(&url, &cache_path, self.download_timeout)?;
                self.unpack_into(&cache_path, &work_dir)?
            }
        };
        request.raw_dir = Some(raw_dir);
        Ok(InstallationStep::GetPackageInformation)
    }

    fn unpack_into(&self, package_path: &Path, work_dir: &Path) -> Result<PathBuf> {
        if !package_path.is_file() {
            return Err(anyhow!(
                "package file does not exist: {}",
                package_path.display()
            ));
        }
        let raw_dir = work_dir.join("raw");
        self.unpacker
            .unpack(package_path, &raw_dir)
            .with_context(|| format!("failed to unpack {}", package_path.display()))?;
        Ok(raw_dir)
    }

    fn read_package_information(&self, request: &mut AddRequest) -> Result<InstallationStep> {
        let raw_dir = request
            .raw_dir
            .as_deref()
            .ok_or_else(|| anyhow!("package content was not staged"))?;
        let manifest = AppxManifest::read_from_dir(raw_dir)?;
        let full_name = manifest.identity.full_name();
        debug!(full_name = %full_name, "resolved package identity");

        request._claim = Some(self.in_flight.claim(full_name.as_str())?);
        request.superseded = self.superseded_family_members(&manifest)?;
        request.manifest = Some(manifest);
        Ok(InstallationStep::Extraction)
    }

    /// Older installed versions of the same family. An installed newer
    /// version blocks the install.
    fn superseded_family_members(&self, manifest: &AppxManifest) -> Result<Vec<String>> {
        let full_name = manifest.identity.full_name();
        let family_name = manifest.identity.family_name();
        let mut superseded = Vec::new();
        for (installed_name, _) in self.registry.package_dirs()? {
            if installed_name == full_name.as_str() {
                continue;
            }
            let same_family = family_name_from_full_name(&installed_name)
                .map(|installed_family| installed_family.eq_ignore_ascii_case(&family_name))
                .unwrap_or(false);
            if !same_family {
                continue;
            }
            let Ok(installed_version) =
                PackageFullName::parse(installed_name.as_str()).and_then(|name| name.version())
            else {
                continue;
            };

            if installed_version > manifest.identity.version {
                return Err(DeploymentError::HigherVersionInstalled {
                    requested: full_name.to_string(),
                    installed: installed_name,
                }
                .into());
            }
            if installed_version < manifest.identity.version {
                superseded.push(installed_name);
            }
        }
        Ok(superseded)
    }

    fn extract_and_register(
        &self,
        request: &mut AddRequest,
        reporter: &mut ProgressReporter,
    ) -> Result<InstallationStep> {
        let (Some(raw_dir), Some(manifest)) = (request.raw_dir.as_deref(), request.manifest.as_ref())
        else {
            return Err(anyhow!("package information was not resolved before extraction"));
        };
        let full_name = manifest.identity.full_name();

        let entries = collect_package_entries(raw_dir)?;
        let staged_dir = request.work_dir.path().join("staged");
        fs::create_dir_all(&staged_dir)
            .with_context(|| format!("failed to create {}", staged_dir.display()))?;

        let total = entries.len();
        for (index, entry) in entries.iter().enumerate() {
            if reporter.is_cancelled() {
                return Err(DeploymentError::Cancelled.into());
            }
            copy_file_creating_parents(&entry.source, &staged_dir.join(&entry.relative))?;
            reporter.update(
                InstallationStep::Extraction,
                extraction_percentage(index + 1, total),
            );
        }

        let package_dir = self.layout.package_dir(full_name.as_str());
        if package_dir.exists() {
            info!(full_name = %full_name, "replacing existing install of package");
            fs::remove_dir_all(&package_dir).with_context(|| {
                format!(
                    "failed to remove existing package dir: {}",
                    package_dir.display()
                )
            })?;
        }
        move_dir_or_copy(&staged_dir, &package_dir)?;
        let installed = match self.register_promoted(full_name.as_str(), &package_dir, &entries) {
            Ok(installed) => installed,
            Err(err) => {
                self.roll_back_promoted(full_name.as_str());
                return Err(err);
            }
        };

        for superseded in &request.superseded {
            match remove_package_content(&self.registry, superseded, &mut |_| {}) {
                Ok(_) => info!(
                    full_name = %superseded,
                    replacement = %full_name,
                    "removed superseded package version"
                ),
                Err(err) => warn!(
                    full_name = %superseded,
                    error = %format!("{err:#}"),
                    "failed to remove superseded package version"
                ),
            }
        }

        info!(
            full_name = %full_name,
            location = %package_dir.display(),
            files = total,
            "installed package"
        );
        request.installed = Some(installed);
        Ok(InstallationStep::Completed)
    }

    /// Deploys shared content for a promoted package and confirms it is
    /// discoverable.
    fn register_promoted(
        &self,
        full_name: &str,
        package_dir: &Path,
        entries: &[PackageEntry],
    ) -> Result<InstalledPackage> {
        deploy_shared_content(package_dir, &self.layout.shared_dir(), entries)?;
        self.registry
            .find(full_name)?
            .ok_or_else(|| anyhow!("installed package {full_name} is not discoverable"))
    }

    /// Removes a promoted package whose registration failed, along with any
    /// shared files no other package carries.
    fn roll_back_promoted(&self, full_name: &str) {
        match remove_package_content(&self.registry, full_name, &mut |_| {}) {
            Ok(_) => warn!(full_name, "rolled back partially registered package"),
            Err(err) => warn!(
                full_name,
                error = %format!("{err:#}"),
                "failed to roll back partially registered package"
            ),
        }
    }
}

impl DeploymentBackend for SelfHostedInstaller {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::SelfHosted
    }

    fn install(
        &self,
        source: PackageSource,
        options: DeploymentOptions,
        reporter: &mut ProgressReporter,
    ) -> Result<()> {
        self.install_package(source, options, reporter).map(|_| ())
    }

    fn remove(&self, full_name: &str, reporter: &mut ProgressReporter) -> Result<()> {
        self.remove_installed(full_name, reporter).map(|_| ())
    }
}

/// Checks for cancellation, then records `step` as the current state.
fn enter_step(reporter: &mut ProgressReporter, step: InstallationStep) -> Result<()> {
    if reporter.is_cancelled() {
        return Err(DeploymentError::Cancelled.into());
    }
    let percentage = reporter.snapshot().percentage();
    reporter.update(step, percentage);
    debug!(step = step.as_str(), "entered deployment step");
    Ok(())
}

/// Extraction tops out below 100; 100 is reserved for `Completed`.
fn extraction_percentage(done: usize, total: usize) -> f32 {
    if total == 0 {
        return EXTRACTION_CEILING;
    }
    done as f32 * EXTRACTION_CEILING / total as f32
}

/// Copies the package's `VFS` payload into the shared content root,
/// overwriting older copies.
fn deploy_shared_content(
    package_dir: &Path,
    shared_root: &Path,
    entries: &[PackageEntry],
) -> Result<()> {
    for entry in entries
        .iter()
        .filter(|entry| entry.kind == EntryKind::Payload)
    {
        let Some(shared_relative) = vfs_relative_path(&entry.relative) else {
            continue;
        };
        copy_file_creating_parents(
            &package_dir.join(&entry.relative),
            &shared_root.join(shared_relative),
        )?;
    }
    Ok(())
}

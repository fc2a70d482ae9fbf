use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tempfile::TempPath;
use tracing::info;

use crate::source::download_package;
use crate::{
    DeploymentBackend, DeploymentError, DeploymentOptions, DeploymentStrategy, InstallLayout,
    InstallationStep, PackageSource, ProgressReporter,
};

/// The host OS's own deployment service. Implementations block until the
/// underlying operation finishes.
pub trait NativeDeploymentService: Send + Sync {
    /// `progress` receives the service's 0-100 percentage as it advances.
    fn add_package(
        &self,
        package_path: &Path,
        options: DeploymentOptions,
        progress: &mut dyn FnMut(u32),
    ) -> Result<(), DeploymentError>;

    fn remove_package(&self, full_name: &str) -> Result<(), DeploymentError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableDeploymentService;

impl NativeDeploymentService for UnavailableDeploymentService {
    fn add_package(
        &self,
        _package_path: &Path,
        _options: DeploymentOptions,
        _progress: &mut dyn FnMut(u32),
    ) -> Result<(), DeploymentError> {
        Err(DeploymentError::NativeServiceUnavailable)
    }

    fn remove_package(&self, _full_name: &str) -> Result<(), DeploymentError> {
        Err(DeploymentError::NativeServiceUnavailable)
    }
}

pub fn platform_deployment_service() -> Arc<dyn NativeDeploymentService> {
    #[cfg(windows)]
    {
        Arc::new(windows_service::WindowsDeploymentService)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnavailableDeploymentService)
    }
}

pub struct NativeServiceAdapter {
    service: Arc<dyn NativeDeploymentService>,
    layout: InstallLayout,
    download_timeout: Duration,
}

impl NativeServiceAdapter {
    pub fn new(
        service: Arc<dyn NativeDeploymentService>,
        layout: InstallLayout,
        download_timeout: Duration,
    ) -> Self {
        Self {
            service,
            layout,
            download_timeout,
        }
    }

    /// Relays the service's percentage as `Extraction` progress. The service's
    /// 100% is left to the terminal `Completed` update issued once the call
    /// has returned successfully.
    pub fn add_with_progress(
        &self,
        package_path: &Path,
        options: DeploymentOptions,
        reporter: &mut ProgressReporter,
    ) -> Result<()> {
        let mut relay = |percentage: u32| {
            if percentage < 100 {
                reporter.update(InstallationStep::Extraction, percentage as f32);
            }
        };
        self.service
            .add_package(package_path, options, &mut relay)
            .with_context(|| format!("failed to deploy {}", package_path.display()))
    }

    pub fn add_sync(&self, package_path: &Path, options: DeploymentOptions) -> Result<()> {
        self.service
            .add_package(package_path, options, &mut |_| {})
            .with_context(|| format!("failed to deploy {}", package_path.display()))
    }

    pub fn remove_package(&self, full_name: &str) -> Result<()> {
        self.service
            .remove_package(full_name)
            .with_context(|| format!("failed to remove package {full_name}"))
    }
}

impl DeploymentBackend for NativeServiceAdapter {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::NativeService
    }

    fn install(
        &self,
        source: PackageSource,
        options: DeploymentOptions,
        reporter: &mut ProgressReporter,
    ) -> Result<()> {
        reporter.update(InstallationStep::Started, 0.0);
        if reporter.is_cancelled() {
            return Err(DeploymentError::Cancelled.into());
        }

        let description = source.describe();
        let mut materialized: Option<TempPath> = None;
        let package_path: PathBuf = match source {
            PackageSource::Path(path) => {
                if path.is_dir() {
                    return Err(anyhow!(
                        "native deployment service requires a package file, got directory {}",
                        path.display()
                    ));
                }
                path
            }
            PackageSource::Stream(mut stream) => {
                let temp_path = materialize_stream(&mut stream, &self.layout.tmp_dir())?;
                let path = temp_path.to_path_buf();
                materialized = Some(temp_path);
                path
            }
            PackageSource::Url(url) => {
                let cache_path = self.layout.download_cache_path(&url);
                download_package(&url, &cache_path, self.download_timeout)?;
                cache_path
            }
        };

        // Cancellation is not observed once the service call is issued.
        if reporter.is_cancelled() {
            return Err(DeploymentError::Cancelled.into());
        }
        info!(source = %description, "deploying package through native service");
        let result = if reporter.is_observed() {
            self.add_with_progress(&package_path, options, reporter)
        } else {
            self.add_sync(&package_path, options)
        };
        drop(materialized);
        result
    }

    fn remove(&self, full_name: &str, reporter: &mut ProgressReporter) -> Result<()> {
        reporter.update(InstallationStep::Started, 0.0);
        if reporter.is_cancelled() {
            return Err(DeploymentError::Cancelled.into());
        }
        info!(full_name, "removing package through native service");
        self.remove_package(full_name)
    }
}

/// Copies `stream` into a fresh temporary package file whose access is
/// restricted before any byte is written. The file is deleted when the
/// returned path is dropped.
pub fn materialize_stream(stream: &mut dyn Read, temp_dir: &Path) -> Result<TempPath> {
    fs::create_dir_all(temp_dir)
        .with_context(|| format!("failed to create {}", temp_dir.display()))?;
    let mut file = tempfile::Builder::new()
        .prefix("msixcore-")
        .suffix(".msix")
        .tempfile_in(temp_dir)
        .with_context(|| {
            format!(
                "failed to create temporary package file in {}",
                temp_dir.display()
            )
        })?;
    harden_package_file(file.path()).with_context(|| {
        format!(
            "failed to restrict access to temporary package file {}",
            file.path().display()
        )
    })?;

    io::copy(stream, &mut file).with_context(|| {
        format!(
            "failed to copy package stream into {}",
            file.path().display()
        )
    })?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush {}", file.path().display()))?;
    Ok(file.into_temp_path())
}

#[cfg(unix)]
fn harden_package_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o750))?;
    Ok(())
}

#[cfg(windows)]
fn harden_package_file(path: &Path) -> Result<()> {
    windows_service::apply_package_file_acl(path)
}

#[cfg(not(any(unix, windows)))]
fn harden_package_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
mod windows_service {
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use crossbeam_channel::RecvTimeoutError;
    use windows::core::{HSTRING, PCWSTR};
    use windows::Foundation::Collections::IIterable;
    use windows::Foundation::{AsyncOperationProgressHandler, AsyncStatus, Uri};
    use windows::Management::Deployment::{
        DeploymentOptions as NativeDeploymentOptions, DeploymentProgress, DeploymentResult,
        PackageManager,
    };
    use windows::Win32::Foundation::{LocalFree, HLOCAL};
    use windows::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{
        SetFileSecurityW, DACL_SECURITY_INFORMATION, PROTECTED_DACL_SECURITY_INFORMATION,
        PSECURITY_DESCRIPTOR,
    };

    use super::NativeDeploymentService;
    use crate::{DeploymentError, DeploymentOptions};

    const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// SYSTEM, administrators and the owner get full control; authenticated
    /// users read and execute. The DACL is protected from inheritance.
    const PACKAGE_FILE_SDDL: &str = "D:P(A;;FA;;;SY)(A;;FA;;;BA)(A;;FA;;;OW)(A;;FRFX;;;AU)";

    pub(super) struct WindowsDeploymentService;

    impl NativeDeploymentService for WindowsDeploymentService {
        fn add_package(
            &self,
            package_path: &Path,
            options: DeploymentOptions,
            progress: &mut dyn FnMut(u32),
        ) -> Result<(), DeploymentError> {
            let native_options = match options {
                DeploymentOptions::None => NativeDeploymentOptions::None,
            };
            let manager = PackageManager::new().map_err(native_error)?;
            let uri = Uri::CreateUri(&HSTRING::from(package_path.as_os_str())).map_err(native_error)?;
            let operation = manager
                .AddPackageAsync(&uri, None::<&IIterable<Uri>>, native_options)
                .map_err(native_error)?;

            let (sender, updates) = crossbeam_channel::unbounded::<u32>();
            operation
                .SetProgress(&AsyncOperationProgressHandler::<
                    DeploymentResult,
                    DeploymentProgress,
                >::new(move |_, update| {
                    let _ = sender.send(update.percentage);
                    Ok(())
                }))
                .map_err(native_error)?;

            loop {
                match updates.recv_timeout(PROGRESS_POLL_INTERVAL) {
                    Ok(percentage) => progress(percentage),
                    Err(RecvTimeoutError::Timeout) => {
                        if operation.Status().map_err(native_error)? != AsyncStatus::Started {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            while let Ok(percentage) = updates.try_recv() {
                progress(percentage);
            }

            operation.get().map_err(native_error)?;
            Ok(())
        }

        fn remove_package(&self, full_name: &str) -> Result<(), DeploymentError> {
            let manager = PackageManager::new().map_err(native_error)?;
            manager
                .RemovePackageAsync(&HSTRING::from(full_name))
                .map_err(native_error)?
                .get()
                .map_err(native_error)?;
            Ok(())
        }
    }

    fn native_error(err: windows::core::Error) -> DeploymentError {
        DeploymentError::NativeService {
            code: err.code().0 as u32,
            message: err.message().to_string(),
        }
    }

    pub(super) fn apply_package_file_acl(path: &Path) -> Result<()> {
        let sddl = HSTRING::from(PACKAGE_FILE_SDDL);
        let file = HSTRING::from(path.as_os_str());
        let mut descriptor = PSECURITY_DESCRIPTOR::default();

        // SAFETY: the descriptor is produced by the conversion call and freed
        // exactly once with LocalFree after it has been applied.
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(sddl.as_ptr()),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
            .map_err(|err| anyhow!("failed to build package file security descriptor: {err}"))?;

            let applied = SetFileSecurityW(
                PCWSTR(file.as_ptr()),
                DACL_SECURITY_INFORMATION | PROTECTED_DACL_SECURITY_INFORMATION,
                descriptor,
            );
            let _ = LocalFree(Some(HLOCAL(descriptor.0)));
            applied
                .ok()
                .map_err(|err| anyhow!("failed to apply package file ACL: {err}"))?;
        }
        Ok(())
    }
}

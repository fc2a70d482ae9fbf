use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use msixcore_core::{InstalledPackage, Package};
use msixcore_registry::PackageRegistry;
use tracing::debug;

use crate::engine::SelfHostedInstaller;
use crate::inflight::InFlightPackages;
use crate::native::{platform_deployment_service, NativeDeploymentService, NativeServiceAdapter};
use crate::response::run_operation;
use crate::staging::{CommandUnpacker, PackageUnpacker};
use crate::{
    DeploymentBackend, DeploymentHandle, DeploymentOptions, DeploymentStrategy, HostVersion,
    InstallLayout, ManagerConfig, PackageSource, ProgressCallback, ProgressReporter,
};

/// Public entry point. Synchronous operations run on the calling thread;
/// the `*_async` variants each run on their own background thread and return
/// a [`DeploymentHandle`] immediately.
pub struct PackageManager {
    config: ManagerConfig,
    layout: InstallLayout,
    registry: PackageRegistry,
    host_version: Option<HostVersion>,
    unpacker: Arc<dyn PackageUnpacker>,
    native_service: Arc<dyn NativeDeploymentService>,
    in_flight: Arc<InFlightPackages>,
    self_hosted: Arc<SelfHostedInstaller>,
    native: Arc<NativeServiceAdapter>,
}

impl PackageManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout()?;
        layout.ensure_base_dirs()?;

        let unpacker: Arc<dyn PackageUnpacker> = Arc::new(CommandUnpacker);
        let native_service = platform_deployment_service();
        let in_flight = Arc::new(InFlightPackages::default());
        let self_hosted = Arc::new(SelfHostedInstaller::new(
            layout.clone(),
            Arc::clone(&unpacker),
            Arc::clone(&in_flight),
            config.download_timeout(),
        ));
        let native = Arc::new(NativeServiceAdapter::new(
            Arc::clone(&native_service),
            layout.clone(),
            config.download_timeout(),
        ));

        Ok(Self {
            registry: layout.registry(),
            config,
            layout,
            host_version: None,
            unpacker,
            native_service,
            in_flight,
            self_hosted,
            native,
        })
    }

    pub fn with_layout(layout: InstallLayout) -> Result<Self> {
        Self::new(ManagerConfig {
            prefix: Some(layout.prefix().to_path_buf()),
            ..ManagerConfig::default()
        })
    }

    pub fn with_unpacker(mut self, unpacker: Arc<dyn PackageUnpacker>) -> Self {
        self.unpacker = unpacker;
        self.rebuild_backends();
        self
    }

    pub fn with_native_service(mut self, service: Arc<dyn NativeDeploymentService>) -> Self {
        self.native_service = service;
        self.rebuild_backends();
        self
    }

    /// Pins the host version instead of probing the OS on every operation.
    pub fn with_host_version(mut self, host_version: HostVersion) -> Self {
        self.host_version = Some(host_version);
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn registry(&self) -> &PackageRegistry {
        &self.registry
    }

    pub fn strategy(&self) -> DeploymentStrategy {
        let host = self.host_version.or_else(HostVersion::current);
        let strategy = self.config.strategy.resolve(host);
        debug!(host = ?host, strategy = strategy.as_str(), "selected deployment strategy");
        strategy
    }

    pub fn add_package(&self, source: PackageSource, options: DeploymentOptions) -> Result<()> {
        let backend = self.backend();
        run_operation(&mut ProgressReporter::detached(), |reporter| {
            backend.install(source, options, reporter)
        })
    }

    pub fn add_package_async(
        &self,
        source: PackageSource,
        options: DeploymentOptions,
        callback: Option<ProgressCallback>,
    ) -> Result<DeploymentHandle> {
        self.backend().install_async(source, options, callback)
    }

    pub fn remove_package(&self, full_name: &str) -> Result<()> {
        let backend = self.backend();
        run_operation(&mut ProgressReporter::detached(), |reporter| {
            backend.remove(full_name, reporter)
        })
    }

    pub fn remove_package_async(
        &self,
        full_name: &str,
        callback: Option<ProgressCallback>,
    ) -> Result<DeploymentHandle> {
        self.backend().remove_async(full_name.to_string(), callback)
    }

    pub fn find_package(&self, full_name: &str) -> Result<Option<InstalledPackage>> {
        self.registry.find(full_name)
    }

    pub fn find_package_by_family_name(
        &self,
        family_name: &str,
    ) -> Result<Option<InstalledPackage>> {
        self.registry.find_by_family(family_name)
    }

    pub fn find_packages(&self, pattern: &str) -> Result<Vec<InstalledPackage>> {
        self.registry.find_all(pattern)
    }

    pub fn get_package_info(&self, path: &Path) -> Result<Package> {
        self.self_hosted.package_info(path)
    }

    fn backend(&self) -> Arc<dyn DeploymentBackend> {
        match self.strategy() {
            DeploymentStrategy::NativeService => self.native.clone(),
            DeploymentStrategy::SelfHosted => self.self_hosted.clone(),
        }
    }

    fn rebuild_backends(&mut self) {
        self.self_hosted = Arc::new(SelfHostedInstaller::new(
            self.layout.clone(),
            Arc::clone(&self.unpacker),
            Arc::clone(&self.in_flight),
            self.config.download_timeout(),
        ));
        self.native = Arc::new(NativeServiceAdapter::new(
            Arc::clone(&self.native_service),
            self.layout.clone(),
            self.config.download_timeout(),
        ));
    }
}

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{DeploymentHandle, DeploymentStrategy, PackageSource, ProgressCallback, ProgressReporter};

/// Flags passed through unchanged to whichever strategy handles a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentOptions {
    #[default]
    None,
}

/// Contract shared by the native-service and self-hosted strategies.
pub trait DeploymentBackend: Send + Sync + 'static {
    fn strategy(&self) -> DeploymentStrategy;

    fn install(
        &self,
        source: PackageSource,
        options: DeploymentOptions,
        reporter: &mut ProgressReporter,
    ) -> Result<()>;

    fn remove(&self, full_name: &str, reporter: &mut ProgressReporter) -> Result<()>;

    fn install_async(
        self: Arc<Self>,
        source: PackageSource,
        options: DeploymentOptions,
        callback: Option<ProgressCallback>,
    ) -> Result<DeploymentHandle> {
        let name = format!("msixcore-add-{}", self.strategy().as_str());
        DeploymentHandle::spawn(&name, callback, move |reporter| {
            self.install(source, options, reporter)
        })
    }

    fn remove_async(
        self: Arc<Self>,
        full_name: String,
        callback: Option<ProgressCallback>,
    ) -> Result<DeploymentHandle> {
        let name = format!("msixcore-remove-{}", self.strategy().as_str());
        DeploymentHandle::spawn(&name, callback, move |reporter| {
            self.remove(&full_name, reporter)
        })
    }
}

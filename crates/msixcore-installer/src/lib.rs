mod backend;
mod config;
mod engine;
mod errors;
mod fs_utils;
mod inflight;
mod layout;
mod manager;
mod native;
mod response;
mod source;
mod staging;
mod strategy;
mod uninstall;

pub use backend::{DeploymentBackend, DeploymentOptions};
pub use config::{ManagerConfig, STRATEGY_ENV};
pub use engine::SelfHostedInstaller;
pub use errors::{
    error_code, DeploymentError, ERROR_BUSY, ERROR_INSTALL_PACKAGE_DOWNGRADE,
    ERROR_INSTALL_USEREXIT, ERROR_NOT_FOUND, ERROR_NOT_SUPPORTED,
};
pub use inflight::{InFlightClaim, InFlightPackages};
pub use layout::{default_install_prefix, InstallLayout, PREFIX_ENV};
pub use manager::PackageManager;
pub use native::{
    materialize_stream, platform_deployment_service, NativeDeploymentService,
    NativeServiceAdapter, UnavailableDeploymentService,
};
pub use response::{
    run_operation, CancellationToken, DeploymentHandle, InstallationStep, ProgressCallback,
    ProgressReporter, Response, ResponseError,
};
pub use source::{download_package, PackageSource};
pub use staging::{CommandUnpacker, PackageUnpacker};
pub use strategy::{
    select_strategy, DeploymentStrategy, HostVersion, StrategyPreference, NATIVE_SERVICE_MIN_HOST,
};
pub use uninstall::{remove_package_content, RemovalResult};

#[cfg(test)]
mod tests;

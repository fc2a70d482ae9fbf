use std::io;

use msixcore_core::{hresult_from_win32, IdentityError, ManifestError, E_FAIL};
use thiserror::Error;

pub const ERROR_NOT_FOUND: u32 = 0x8007_0490;
pub const ERROR_INSTALL_USEREXIT: u32 = 0x8007_0642;
pub const ERROR_BUSY: u32 = 0x8007_00AA;
pub const ERROR_NOT_SUPPORTED: u32 = 0x8007_0032;
pub const ERROR_INSTALL_PACKAGE_DOWNGRADE: u32 = 0x8007_3D06;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("native deployment service failed with 0x{code:08X}: {message}")]
    NativeService { code: u32, message: String },
    #[error("native deployment service is not available on this host")]
    NativeServiceUnavailable,
    #[error("package '{0}' is not installed")]
    NotFound(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("another operation is already running for package '{0}'")]
    OperationInProgress(String),
    #[error("package '{requested}' is older than installed package '{installed}'")]
    HigherVersionInstalled { requested: String, installed: String },
}

impl DeploymentError {
    pub fn code(&self) -> u32 {
        match self {
            Self::NativeService { code, .. } => *code,
            Self::NativeServiceUnavailable => ERROR_NOT_SUPPORTED,
            Self::NotFound(_) => ERROR_NOT_FOUND,
            Self::Cancelled => ERROR_INSTALL_USEREXIT,
            Self::OperationInProgress(_) => ERROR_BUSY,
            Self::HigherVersionInstalled { .. } => ERROR_INSTALL_PACKAGE_DOWNGRADE,
        }
    }
}

/// HRESULT-style code for the outermost typed error in the chain.
pub fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if let Some(deployment) = cause.downcast_ref::<DeploymentError>() {
            return deployment.code();
        }
        if let Some(manifest) = cause.downcast_ref::<ManifestError>() {
            return manifest.code();
        }
        if let Some(identity) = cause.downcast_ref::<IdentityError>() {
            return identity.code();
        }
        if let Some(raw) = cause
            .downcast_ref::<io::Error>()
            .and_then(io::Error::raw_os_error)
            .filter(|_| cfg!(windows))
        {
            return hresult_from_win32(raw);
        }
    }
    E_FAIL
}

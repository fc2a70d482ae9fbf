use thiserror::Error;

pub const E_INVALIDARG: u32 = 0x8007_0057;
pub const E_FAIL: u32 = 0x8000_4005;
pub const ERROR_INVALID_DATA: u32 = 0x8007_000D;
pub const ERROR_NO_UNICODE_TRANSLATION: u32 = 0x8007_0459;
pub const APPX_E_INVALID_MANIFEST: u32 = 0x8008_0204;

/// Failures of the identity codec. Every variant is fatal to the calling
/// operation; nothing here is recovered by partial parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed package identity: {0}")]
    MalformedIdentity(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("unknown file name encoding: {0}")]
    UnknownFileNameEncoding(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl IdentityError {
    pub fn code(&self) -> u32 {
        match self {
            Self::MalformedIdentity(_) => ERROR_INVALID_DATA,
            Self::InvalidEncoding(_) | Self::UnknownFileNameEncoding(_) => {
                ERROR_NO_UNICODE_TRANSLATION
            }
            Self::InvalidParameter(_) => E_INVALIDARG,
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse package manifest XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("package manifest is missing <{0}>")]
    MissingElement(&'static str),
    #[error("package manifest <{element}> is missing attribute '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("package manifest has an invalid identity")]
    Identity(#[from] IdentityError),
    #[error("failed to read package manifest {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ManifestError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Io { source, .. } => source
                .raw_os_error()
                .filter(|_| cfg!(windows))
                .map(hresult_from_win32)
                .unwrap_or(APPX_E_INVALID_MANIFEST),
            _ => APPX_E_INVALID_MANIFEST,
        }
    }
}

pub fn hresult_from_win32(code: i32) -> u32 {
    if code <= 0 {
        code as u32
    } else {
        0x8007_0000 | (code as u32 & 0xFFFF)
    }
}

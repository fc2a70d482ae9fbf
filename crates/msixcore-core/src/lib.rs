mod encoding;
mod error;
mod identity;
mod manifest;
mod package;
mod version;

pub use encoding::{
    base32_encode, base64_decode, percent_decode_file_name, percent_decode_file_name_wide,
    percent_encode_file_name, percent_encode_file_name_wide,
};
pub use error::{
    hresult_from_win32, IdentityError, ManifestError, APPX_E_INVALID_MANIFEST, E_FAIL,
    E_INVALIDARG, ERROR_INVALID_DATA, ERROR_NO_UNICODE_TRANSLATION,
};
pub use identity::{
    family_name_from_full_name, publisher_id, validate_package_name, PackageFullName,
    PackageIdentity, DEFAULT_ARCHITECTURE,
};
pub use manifest::{AppxManifest, ManifestApplication, MANIFEST_FILE_NAME};
pub use package::{
    manifest_relative_path, resolve_executable, vfs_relative_path, InstalledPackage, LogoSource,
    Package,
};
pub use version::{decode_version, encode_version, version_from_string, PackageVersion};

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{base32_encode, IdentityError, PackageVersion};

pub const DEFAULT_ARCHITECTURE: &str = "neutral";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIdentity {
    pub name: String,
    pub version: PackageVersion,
    pub architecture: String,
    pub resource_id: String,
    pub publisher: String,
}

impl PackageIdentity {
    pub fn new(
        name: impl Into<String>,
        version: PackageVersion,
        architecture: Option<&str>,
        resource_id: Option<&str>,
        publisher: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            name: name.into(),
            version,
            architecture: architecture
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_ARCHITECTURE)
                .to_ascii_lowercase(),
            resource_id: resource_id.unwrap_or_default().to_string(),
            publisher: publisher.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        validate_package_name(&self.name)?;
        if self.publisher.trim().is_empty() {
            return Err(IdentityError::MalformedIdentity(format!(
                "package '{}' has an empty publisher",
                self.name
            )));
        }
        if self.resource_id.contains('_') || self.architecture.contains('_') {
            return Err(IdentityError::MalformedIdentity(format!(
                "package '{}' has '_' in its architecture or resource id",
                self.name
            )));
        }
        Ok(())
    }

    /// Thirteen-character id derived from the SHA-256 of the UTF-16LE
    /// publisher string.
    pub fn publisher_id(&self) -> String {
        publisher_id(&self.publisher)
    }

    pub fn full_name(&self) -> PackageFullName {
        PackageFullName(format!(
            "{}_{}_{}_{}_{}",
            self.name,
            self.version,
            self.architecture,
            self.resource_id,
            self.publisher_id()
        ))
    }

    pub fn family_name(&self) -> String {
        format!("{}_{}", self.name, self.publisher_id())
    }
}

pub fn publisher_id(publisher: &str) -> String {
    let mut hasher = Sha256::new();
    for unit in publisher.encode_utf16() {
        hasher.update(unit.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    base32_encode(&prefix)
}

pub fn validate_package_name(name: &str) -> Result<(), IdentityError> {
    if !(3..=50).contains(&name.len()) {
        return Err(IdentityError::MalformedIdentity(format!(
            "package name '{name}' must be 3 to 50 characters"
        )));
    }
    if let Some(invalid) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '.' || *ch == '-'))
    {
        return Err(IdentityError::MalformedIdentity(format!(
            "package name '{name}' contains invalid character '{invalid}'"
        )));
    }
    if name.ends_with('.') {
        return Err(IdentityError::MalformedIdentity(format!(
            "package name '{name}' must not end with '.'"
        )));
    }
    if name.to_ascii_lowercase().contains(".xn--") {
        return Err(IdentityError::MalformedIdentity(format!(
            "package name '{name}' must not contain '.xn--'"
        )));
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Err(IdentityError::MalformedIdentity(format!(
            "package name '{name}' uses reserved device name '{stem}'"
        )));
    }
    Ok(())
}

/// Keeps everything before the first `_` and everything from the last `_`
/// onward, yielding `Name_PublisherId`.
pub fn family_name_from_full_name(full_name: &str) -> Result<String, IdentityError> {
    let (Some(first), Some(last)) = (full_name.find('_'), full_name.rfind('_')) else {
        return Err(IdentityError::MalformedIdentity(format!(
            "package full name '{full_name}' contains no '_'"
        )));
    };
    Ok(format!("{}{}", &full_name[..first], &full_name[last..]))
}

/// `Name_Version_Architecture_ResourceId_PublisherId`; the install directory
/// name and primary lookup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageFullName(String);

impl PackageFullName {
    pub fn parse(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        let fields = value.split('_').collect::<Vec<_>>();
        if fields.len() != 5 {
            return Err(IdentityError::MalformedIdentity(format!(
                "package full name '{value}' must have five '_'-separated fields"
            )));
        }
        if fields[0].is_empty() || fields[1].is_empty() || fields[4].is_empty() {
            return Err(IdentityError::MalformedIdentity(format!(
                "package full name '{value}' has an empty name, version or publisher id"
            )));
        }
        if value.contains(|ch: char| matches!(ch, '/' | '\\' | ':') || ch.is_control()) {
            return Err(IdentityError::MalformedIdentity(format!(
                "package full name '{value}' contains a path separator or control character"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.split('_').next().unwrap_or_default()
    }

    pub fn version(&self) -> Result<PackageVersion, IdentityError> {
        let field = self.0.split('_').nth(1).unwrap_or_default();
        PackageVersion::parse(field)
    }

    pub fn family_name(&self) -> String {
        family_name_from_full_name(&self.0).unwrap_or_else(|_| self.0.clone())
    }
}

impl fmt::Display for PackageFullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PackageFullName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdentityError;

/// Four 16-bit fields packed at bit offsets 48/32/16/0.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct PackageVersion(u64);

impl PackageVersion {
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self(encode_version(major, minor, build, revision))
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn parts(self) -> (u16, u16, u16, u16) {
        decode_version(self.0)
    }

    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        version_from_string(input).map(Self)
    }
}

pub const fn encode_version(major: u16, minor: u16, build: u16, revision: u16) -> u64 {
    ((major as u64) << 48) | ((minor as u64) << 32) | ((build as u64) << 16) | revision as u64
}

pub const fn decode_version(version: u64) -> (u16, u16, u16, u16) {
    (
        ((version >> 48) & 0xFFFF) as u16,
        ((version >> 32) & 0xFFFF) as u16,
        ((version >> 16) & 0xFFFF) as u16,
        (version & 0xFFFF) as u16,
    )
}

/// Parses `major.minor.build.revision`. Exactly four fields are required and
/// each must fit in 16 bits.
pub fn version_from_string(input: &str) -> Result<u64, IdentityError> {
    let mut fields = [0_u16; 4];
    let mut parts = input.split('.');
    for (index, slot) in fields.iter_mut().enumerate() {
        let part = parts.next().ok_or_else(|| {
            IdentityError::MalformedIdentity(format!(
                "version '{input}' is missing field {}",
                index + 1
            ))
        })?;
        *slot = part.trim().parse::<u16>().map_err(|_| {
            IdentityError::MalformedIdentity(format!(
                "version '{input}' has non-numeric field '{part}'"
            ))
        })?;
    }
    if parts.next().is_some() {
        return Err(IdentityError::MalformedIdentity(format!(
            "version '{input}' has more than four fields"
        )));
    }

    let [major, minor, build, revision] = fields;
    Ok(encode_version(major, minor, build, revision))
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, build, revision) = self.parts();
        write!(f, "{major}.{minor}.{build}.{revision}")
    }
}

impl FromStr for PackageVersion {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<PackageVersion> for String {
    fn from(value: PackageVersion) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

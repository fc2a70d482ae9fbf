use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Hosts at or above this version ship the native deployment service.
pub const NATIVE_SERVICE_MIN_HOST: HostVersion = HostVersion::new(10, 0, 16299);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl HostVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Parses `major.minor.build`; a trailing revision field is ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let fields = input
            .trim()
            .split('.')
            .map(|field| {
                field
                    .parse::<u32>()
                    .map_err(|_| anyhow!("invalid host version field '{field}' in '{input}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        match fields.as_slice() {
            [major, minor, build] | [major, minor, build, _] => {
                Ok(Self::new(*major, *minor, *build))
            }
            _ => Err(anyhow!(
                "host version '{input}' must have the form major.minor.build"
            )),
        }
    }

    /// Version of the running OS. `None` on hosts without a native
    /// deployment service.
    pub fn current() -> Option<Self> {
        #[cfg(windows)]
        {
            match windows_host_version() {
                Ok(version) => Some(version),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to query host version");
                    None
                }
            }
        }
        #[cfg(not(windows))]
        {
            None
        }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentStrategy {
    NativeService,
    SelfHosted,
}

impl DeploymentStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeService => "native-service",
            Self::SelfHosted => "self-hosted",
        }
    }
}

pub fn select_strategy(host: HostVersion) -> DeploymentStrategy {
    if host >= NATIVE_SERVICE_MIN_HOST {
        DeploymentStrategy::NativeService
    } else {
        DeploymentStrategy::SelfHosted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyPreference {
    #[default]
    Auto,
    NativeService,
    SelfHosted,
}

impl StrategyPreference {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" | "native-service" => Ok(Self::NativeService),
            "self-hosted" => Ok(Self::SelfHosted),
            other => Err(anyhow!(
                "unknown deployment strategy '{other}' (expected auto, native-service or self-hosted)"
            )),
        }
    }

    /// An unknown host version always resolves to the self-hosted pipeline.
    pub fn resolve(self, host: Option<HostVersion>) -> DeploymentStrategy {
        match self {
            Self::Auto => host.map_or(DeploymentStrategy::SelfHosted, select_strategy),
            Self::NativeService => DeploymentStrategy::NativeService,
            Self::SelfHosted => DeploymentStrategy::SelfHosted,
        }
    }
}

#[cfg(windows)]
fn windows_host_version() -> Result<HostVersion> {
    use std::mem::{size_of, transmute};
    use windows::core::HSTRING;
    use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
    use windows::Win32::System::SystemInformation::OSVERSIONINFOEXW;

    type RtlGetVersionFn = unsafe extern "system" fn(*mut OSVERSIONINFOEXW) -> i32;

    // SAFETY: ntdll.dll is mapped into every process and exports RtlGetVersion
    // with this signature; the struct size field is set before the call.
    unsafe {
        let ntdll = LoadLibraryW(&HSTRING::from("ntdll.dll"))
            .map_err(|err| anyhow!("failed to load ntdll.dll: {err}"))?;
        let Some(proc_address) = GetProcAddress(ntdll, windows::core::s!("RtlGetVersion")) else {
            return Err(anyhow!("RtlGetVersion not found in ntdll.dll"));
        };
        let rtl_get_version: RtlGetVersionFn = transmute(proc_address);

        let mut info = OSVERSIONINFOEXW {
            dwOSVersionInfoSize: size_of::<OSVERSIONINFOEXW>() as u32,
            ..Default::default()
        };
        let status = rtl_get_version(&mut info);
        if status != 0 {
            return Err(anyhow!("RtlGetVersion failed with status {status}"));
        }

        Ok(HostVersion::new(
            info.dwMajorVersion,
            info.dwMinorVersion,
            info.dwBuildNumber,
        ))
    }
}

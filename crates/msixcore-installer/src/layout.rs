use anyhow::{Context, Result};
use msixcore_registry::PackageRegistry;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const PREFIX_ENV: &str = "MSIXCORE_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    prefix: PathBuf,
}

impl InstallLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Install root: one directory per package, named by its full name.
    pub fn packages_dir(&self) -> PathBuf {
        self.prefix.join("packages")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.prefix.join("shared")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.prefix.join("cache")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.prefix.join("tmp")
    }

    pub fn config_path(&self) -> PathBuf {
        self.prefix.join("config.toml")
    }

    pub fn package_dir(&self, full_name: &str) -> PathBuf {
        self.packages_dir().join(full_name)
    }

    pub fn download_cache_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let file_name = url
            .split(|ch: char| ch == '?' || ch == '#')
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("package.msix");
        self.downloads_dir()
            .join(hex::encode(&digest[..8]))
            .join(file_name)
    }

    pub fn registry(&self) -> PackageRegistry {
        PackageRegistry::new(self.packages_dir(), self.shared_dir())
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.packages_dir(),
            self.shared_dir(),
            self.cache_dir(),
            self.downloads_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_install_prefix() -> Result<PathBuf> {
    if let Some(prefix) = std::env::var_os(PREFIX_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(prefix));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows install prefix")?;
        return Ok(PathBuf::from(app_data).join("MsixCore"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve install prefix")?;
    Ok(PathBuf::from(home).join(".msixcore"))
}

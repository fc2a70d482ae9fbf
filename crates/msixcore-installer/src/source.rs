use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

/// Where a package comes from. Inputs starting with `http` are URLs; anything
/// else is a local path.
pub enum PackageSource {
    Path(PathBuf),
    Stream(Box<dyn Read + Send>),
    Url(String),
}

impl PackageSource {
    pub fn parse(input: &str) -> Self {
        let is_url = input
            .get(..4)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"));
        if is_url {
            Self::Url(input.to_string())
        } else {
            Self::Path(PathBuf::from(input))
        }
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self::Stream(Box::new(reader))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Stream(_) => "<stream>".to_string(),
            Self::Url(url) => url.clone(),
        }
    }
}

impl fmt::Debug for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

impl From<PathBuf> for PackageSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for PackageSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

/// Fetches `url` into `cache_path` through a `.part` file that is renamed
/// into place only after the body is fully written.
pub fn download_package(url: &str, cache_path: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create download cache dir: {}", parent.display()))?;
    }

    let part_path = cache_path.with_file_name(format!(
        "{}.part",
        cache_path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("package")
    ));

    debug!(url, cache_path = %cache_path.display(), "downloading package");
    if let Err(err) = download_to(url, &part_path, timeout) {
        let _ = fs::remove_file(&part_path);
        return Err(err);
    }

    if cache_path.exists() {
        fs::remove_file(cache_path).with_context(|| {
            format!("failed to replace cached package: {}", cache_path.display())
        })?;
    }
    fs::rename(&part_path, cache_path).with_context(|| {
        format!(
            "failed to move downloaded package into cache: {}",
            cache_path.display()
        )
    })?;
    Ok(())
}

fn download_to(url: &str, out_path: &Path, timeout: Duration) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to download package: {url}"))?
        .error_for_status()
        .with_context(|| format!("package download was rejected: {url}"))?;

    let mut file = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("failed to write package download: {}", out_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", out_path.display()))?;
    Ok(())
}

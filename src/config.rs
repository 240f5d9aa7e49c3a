use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hyper::Uri;
use tracing::warn;

use crate::fetch::{Proxy, TransportConfig};

/// Where the index file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// Download `index` and seed the crawl with its entries.
    Fetch,
    /// Download `index` like any other file, without parsing it.
    Bypass,
    /// Parse a local copy instead of downloading one.
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// URL of the exposed metadata directory, always ending in `/`.
    pub base_url: String,
    pub output: PathBuf,
    pub threads: usize,
    pub index: IndexSource,
    pub transport: TransportConfig,
}

impl DumpConfig {
    pub fn new(url: &str, output: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(url)?,
            output: output.into(),
            threads: 10,
            index: IndexSource::Fetch,
            transport: TransportConfig::default(),
        })
    }

    /// URL path of the crawl root, e.g. `/.git/`.
    pub fn root_path(&self) -> String {
        self.base_url
            .parse::<Uri>()
            .map(|uri| uri.path().to_owned())
            .unwrap_or_else(|_| "/".to_owned())
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("Need at least one worker thread");
        }
        if matches!(self.transport.proxy, Some(Proxy::Http(_)))
            && self.base_url.starts_with("https")
        {
            bail!("HTTP proxies can only be used for http:// targets, use a SOCKS5 proxy instead");
        }
        Ok(())
    }
}

fn normalize_base_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        bail!("Url required");
    }

    let uri: Uri = url
        .parse()
        .with_context(|| format!("Invalid url {url:?}"))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => bail!("Url {url:?} must start with http:// or https://"),
    }
    if uri.host().is_none() {
        bail!("Url {url:?} has no host");
    }

    if url.ends_with('/') {
        Ok(url.to_owned())
    } else {
        warn!("Url {url} has no trailing '/', adding one");
        Ok(format!("{url}/"))
    }
}

/// Refuses to dump into an existing directory unless `force` is set.
pub fn check_output_root(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "Output directory {} already exists, run again with --force to overwrite",
            output.display()
        );
    }
    Ok(())
}

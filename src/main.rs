use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::{
    config::{check_output_root, DumpConfig, IndexSource},
    fetch::Proxy,
};

mod config;
mod dump_git;
mod fetch;
mod frontier;
mod git_parsing;
mod index;
mod listing;
mod logging;
mod queue;
#[cfg(test)]
mod test_support;
mod tracker;
mod writer;

#[derive(Parser, Debug)]
#[command(version, about = "Dump exposed .git directories")]
struct Cli {
    /// The url of the exposed .git directory (should end in '/')
    #[arg(short, long)]
    url: String,

    /// The directory to download to
    #[arg(short, long, default_value = ".git")]
    output: PathBuf,

    /// Number of concurrent downloads
    #[arg(short, long, default_value_t = 10)]
    threads: usize,

    /// Download the index file without parsing it
    #[arg(short = 'i', long)]
    index_bypass: bool,

    /// Parse this local index file instead of downloading one
    #[arg(short = 'l', long, conflicts_with = "index_bypass")]
    index_file: Option<PathBuf>,

    /// Don't verify TLS certificates
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Proxy to use: http://host:port for an HTTP proxy, host:port for SOCKS5
    #[arg(short, long)]
    proxy: Option<String>,

    /// Allow dumping into an existing directory
    #[arg(short, long)]
    force: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Increase logging verbosity (RUST_LOG takes precedence)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<DumpConfig> {
        check_output_root(&self.output, self.force)?;

        let mut config = DumpConfig::new(&self.url, self.output)?;
        config.threads = self.threads.max(1);
        config.index = match (self.index_bypass, self.index_file) {
            (_, Some(path)) => IndexSource::Local(path),
            (true, None) => IndexSource::Bypass,
            (false, None) => IndexSource::Fetch,
        };
        config.transport.insecure = self.insecure;
        config.transport.timeout = Duration::from_secs(self.timeout.max(1));
        config.transport.proxy = self.proxy.as_deref().map(Proxy::parse).transpose()?;

        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let config = cli.into_config()?;
    info!(
        url = %config.base_url,
        output = %config.output.display(),
        threads = config.threads,
        "dump starting"
    );

    let summary = dump_git::dump(config).await?;
    info!(
        mode = ?summary.mode,
        paths = summary.paths_seen,
        failures = summary.write_failures,
        idle_transitions = summary.idle_transitions,
        outstanding = summary.outstanding,
        "dump finished"
    );
    println!(
        "Wrote {} files and {} bytes",
        summary.files_written, summary.bytes_written
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_map_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("dump");
        let cli = Cli::parse_from([
            "git-harvest",
            "-u",
            "http://example.com/.git",
            "-o",
            output.to_str().unwrap(),
            "-t",
            "3",
            "-k",
            "-p",
            "127.0.0.1:9050",
            "-l",
            "/tmp/index",
        ]);

        let config = cli.into_config().unwrap();
        assert_eq!(config.base_url, "http://example.com/.git/");
        assert_eq!(config.threads, 3);
        assert!(config.transport.insecure);
        assert_eq!(
            config.transport.proxy,
            Some(Proxy::Socks5("127.0.0.1:9050".into()))
        );
        assert_eq!(config.index, IndexSource::Local("/tmp/index".into()));
    }

    #[test]
    fn existing_output_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let args = |force: bool| {
            let mut args = vec![
                "git-harvest".to_string(),
                "-u".into(),
                "http://example.com/.git/".into(),
                "-o".into(),
                dir.path().display().to_string(),
            ];
            if force {
                args.push("-f".into());
            }
            args
        };

        assert!(Cli::parse_from(args(false)).into_config().is_err());
        let config = Cli::parse_from(args(true)).into_config().unwrap();
        assert_eq!(config.index, IndexSource::Fetch);
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

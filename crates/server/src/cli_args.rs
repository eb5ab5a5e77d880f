use clap::Parser;
use miette::Context;
use pacmirror_config::Settings;
use std::path::PathBuf;

/// Caching transparent proxy for pacman repositories.
#[derive(Debug, Parser)]
#[clap(name = "pacmirror")]
#[clap(bin_name = "pacmirror")]
#[clap(version)]
pub struct CliArgs {
    /// Path of the settings file.
    #[clap(short, long, default_value = "/etc/pacmirror.yaml")]
    pub config: PathBuf,

    /// Override the configured listen address.
    #[clap(long)]
    pub listen_addr: Option<String>,

    /// Override the configured cache directory.
    #[clap(long)]
    pub cache_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the settings, apply the overrides and run the server.
    pub async fn run(self) -> miette::Result<()> {
        let CliArgs { config, listen_addr, cache_dir } = self;

        let mut settings = Settings::load(&config).wrap_err("load the settings file")?;
        if let Some(listen_addr) = listen_addr {
            settings.listen_addr = listen_addr;
        }
        if let Some(cache_dir) = cache_dir {
            settings.cache_dir = cache_dir;
        }

        crate::http::serve(settings).await
    }
}

use clap::Parser;

#[derive(Parser)]
#[command(name = "cpcache", author, version, about = "Caching HTTP proxy for a package-distribution ecosystem")]
pub struct Args {
    /// Config file (defaults to /etc/cpcache/cpcache.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Override the listen port from the config file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the cache directory from the config file
    #[arg(long)]
    pub cache_dir: Option<String>,
}

mod porthole;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "porthole",
    version,
    about = "Porthole - expose a local service on a public address through a relay"
)]
struct Cli {
    /// Path to the porthole config file (.toml). Falls back to
    /// PORTHOLE_CONFIG, then ./porthole.toml, then
    /// /etc/porthole/porthole.toml.
    #[arg(long, env = "PORTHOLE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    porthole::run(cli.config).await
}

mod lantern;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lantern", version, about = "Lantern - reverse tunnel broker")]
struct Cli {
    /// Path to Lantern config file (.toml/.yaml/.yml). If omitted, uses LANTERN_CONFIG; then auto-detects lantern.toml > lantern.yaml > lantern.yml from CWD; then falls back to the OS default path (Linux: /etc/lantern/lantern.toml; others: user config dir).
    #[arg(long, env = "LANTERN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lantern::run(cli.config).await
}

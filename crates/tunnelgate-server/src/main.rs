use clap::Parser;
use tunnelgate_config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    tunnelgate_config::setup_logging(&config.log_level);

    tunnelgate_server::run(config).await
}

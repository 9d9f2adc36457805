use clap::Parser;
use kvctl::{run, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(data_dir = %config.data_dir.display(), nodes = config.nodes, "kvctl starting");
    let output = run(&cli.command, &config, &cli.down, cli.json).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use hive::{Cli, Commands};
use tracing_log::AsTrace;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let subscriber = FmtSubscriber::builder()
    .with_max_level(cli.verbose.log_level_filter().as_trace())
    .without_time()
    .with_ansi(!cli.no_color)
    .finish();
  tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");

  match &cli.command {
    Commands::Admin(admin) => admin.run(&cli.config_dir).await,
    Commands::Get(get) => get.run(&cli.config_dir).await,
    Commands::Top(top) => top.run(&cli.config_dir).await,
    Commands::Cluster(cluster) => cluster.run(&cli.config_dir).await,
    Commands::Daemon(daemon) => daemon.run(&cli.config_dir).await,
  }
}

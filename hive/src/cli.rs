use std::path::PathBuf;

use anstyle::{AnsiColor, Color, Style};
use clap::{builder::Styles, Parser, Subcommand};
use clap_verbosity_flag::Verbosity;

use crate::commands;

/// Styles for CLI
fn get_styles() -> Styles {
  Styles::styled()
    .header(
      Style::new()
        .bold()
        .underline()
        .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .literal(Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .usage(
      Style::new()
        .bold()
        .underline()
        .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .error(Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[command(styles=get_styles())]
pub struct Cli {
  #[command(subcommand)]
  pub command: Commands,

  #[clap(flatten)]
  pub verbose: Verbosity,

  /// Disable colors on logged output
  #[arg(long, global = true, default_value = "false")]
  pub no_color: bool,

  /// Node configuration directory
  #[arg(long, global = true, default_value = "/etc/hive")]
  pub config_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
  /// Cluster administration: bootstrap a cluster or join an existing one
  Admin(commands::admin::Admin),

  /// Query state across the cluster
  Get(commands::get::Get),

  /// Live utilization across the cluster
  Top(commands::top::Top),

  /// Cluster-wide operations
  Cluster(commands::cluster::Cluster),

  /// Run the per-node daemon
  Daemon(commands::daemon::DaemonCommand),
}

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use strata::{Result, cmd};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the strata server
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Journaled media server with core/backup replication")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for strata
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Load the media root and serve until interrupted")]
   Serve {
      #[arg(long, help = "Skip the initial media scan")]
      no_scan: bool,
   },

   #[command(subcommand, about = "Initialize this server's role")]
   Init(InitCmd),

   #[command(about = "Back up every paired core once")]
   Backup,

   #[command(about = "Rebuild a paired core on a fresh server from this backup")]
   Restore {
      #[arg(help = "Id of the core to restore")]
      core: String,

      #[arg(long, help = "Base URL of the fresh server (default: the core's address)")]
      to: Option<String>,
   },

   #[command(about = "Show disk usage by file extension")]
   Stats {
      #[arg(help = "Directory below the media root (default: the root)")]
      path: Option<String>,

      #[arg(long, help = "Output JSON")]
      json: bool,
   },

   #[command(about = "Show the journal history of a file or a past directory listing")]
   History {
      #[arg(help = "Path below the media root")]
      path: String,

      #[arg(long, help = "List the directory as it was at this RFC 3339 time")]
      at: Option<DateTime<Utc>>,

      #[arg(long, help = "Output JSON")]
      json: bool,
   },

   #[command(about = "Print the effective configuration")]
   Config {
      #[arg(long, help = "Print only the config file location")]
      path: bool,
   },
}

#[derive(Subcommand)]
enum InitCmd {
   #[command(about = "Make this server a core")]
   Core {
      #[arg(long, help = "Display name")]
      name: Option<String>,

      #[arg(long, env = "STRATA_API_KEY", help = "Key backups must present (generated if absent)")]
      api_key: Option<String>,
   },

   #[command(about = "Pair with a core and make this server its backup")]
   Backup {
      #[arg(long, help = "Display name")]
      name: Option<String>,

      #[arg(long, env = "STRATA_CORE_ADDRESS", help = "Base URL of the core")]
      core: Option<String>,

      #[arg(long, env = "STRATA_API_KEY", help = "The core's API key")]
      api_key: Option<String>,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   match cli.command {
      Cmd::Serve { no_scan } => cmd::serve::execute(!no_scan).await,
      Cmd::Init(InitCmd::Core { name, api_key }) => cmd::init::execute_core(name, api_key).await,
      Cmd::Init(InitCmd::Backup { name, core, api_key }) => {
         cmd::init::execute_backup(name, core, api_key).await
      },
      Cmd::Backup => cmd::backup::execute().await,
      Cmd::Restore { core, to } => cmd::restore::execute(core, to).await,
      Cmd::Stats { path, json } => cmd::stats::execute(path, json).await,
      Cmd::History { path, at, json } => cmd::history::execute(path, at, json).await,
      Cmd::Config { path } => cmd::config::execute(path),
   }
}

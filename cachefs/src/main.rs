use anyhow::Context;
use cachefs::cadapter::memory::InMemoryCluster;
use cachefs::secondary::LocalDirSecondary;
use cachefs::vfs::demo;
use cachefs::{FileSystem, FsConfig, FsMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cachefs")]
#[command(about = "A filesystem layered on a distributed key-value cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Primary,
    Proxy,
    Dual,
}

impl From<ModeArg> for FsMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Primary => FsMode::Primary,
            ModeArg::Proxy => FsMode::Proxy,
            ModeArg::Dual => FsMode::Dual,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the end-to-end walkthrough on an in-process cluster")]
    Demo {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        /// Local directory backing PROXY/DUAL paths
        #[arg(long, value_name = "DIR")]
        secondary: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// JSON configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            nodes,
            secondary,
            mode,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    FsConfig::from_json(&raw)?
                }
                None => FsConfig::default(),
            };
            if let Some(mode) = mode {
                cfg.default_mode = mode.into();
            }
            let cluster = InMemoryCluster::new(nodes, 1 << 30);
            let connector = Arc::new(cluster.clone());
            let fs = match secondary {
                Some(dir) => {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .with_context(|| format!("creating {}", dir.display()))?;
                    let secondary = Arc::new(LocalDirSecondary::new(dir));
                    FileSystem::with_secondary(cfg, connector, secondary)?
                }
                None => FileSystem::new(cfg, connector)?,
            };
            demo::walkthrough(&fs, &cluster, "/cachefs-demo").await?;
            println!("demo: OK");
        }
    }
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use tessera::config::Config;
use tessera::simulate::{run_pascal, PascalParams, DEFAULT_MODULUS};
use tessera::{Error, Result};

/// Tessera - distributed task-graph runtime, simulated in one process
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TESSERA_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file to use instead of ~/.tessera/tessera.toml
    #[arg(short = 'c', long, global = true, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the Pascal-triangle pipeline on an in-process cluster and verify it
    Simulate {
        /// Number of nodes
        #[arg(short = 'n', long, env = "TESSERA_NODES")]
        nodes: Option<usize>,

        /// Rows of the triangle to compute
        #[arg(short = 'r', long, default_value_t = 16)]
        rows: usize,

        /// Modulus applied to every entry
        #[arg(short = 'm', long, default_value_t = DEFAULT_MODULUS)]
        modulus: u64,

        /// Task submissions between two horizons
        #[arg(long, env = "TESSERA_HORIZON_STEP")]
        horizon_step: Option<usize>,

        /// Worker threads per node
        #[arg(long, env = "TESSERA_HOST_THREADS")]
        host_threads: Option<usize>,

        /// Write the final task and command graphs as DOT files into this directory
        #[arg(long)]
        dump_graphs: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    let result = load_config(&cli).and_then(|config| {
        tessera::log::init_with_debug(config.debug);
        run(&cli, config)
    });
    if let Err(e) = result {
        eprintln!("tessera: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli, mut config: Config) -> Result<()> {
    match &cli.command {
        Command::Simulate {
            nodes,
            rows,
            modulus,
            horizon_step,
            host_threads,
            dump_graphs,
        } => {
            if let Some(n) = nodes {
                config.num_nodes = *n;
            }
            if let Some(step) = horizon_step {
                config.horizon_step = *step;
            }
            if let Some(threads) = host_threads {
                config.host_threads = *threads;
            }
            if let Some(dir) = dump_graphs {
                config.graph_dump_dir = Some(dir.display().to_string());
            }
            config.validate()?;
            run_simulate(config, *rows, *modulus)
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn run_simulate(config: Config, rows: usize, modulus: u64) -> Result<()> {
    info!(nodes = config.num_nodes, rows, "Starting simulation");
    let nodes = config.num_nodes;
    let outcome = run_pascal(config, PascalParams { rows, modulus })?;
    println!(
        "nodes={} rows={} checksum={} expected={} commands={} horizons={}",
        nodes,
        rows,
        outcome.checksum,
        outcome.expected,
        outcome.report.commands_completed(),
        outcome.report.horizons_retired
    );
    if !outcome.is_correct() {
        return Err(Error::Validation(format!(
            "checksum {} does not match 2^{} mod {} = {}",
            outcome.checksum, rows, modulus, outcome.expected
        )));
    }
    println!("ok");
    Ok(())
}

//! The operator CLI: inventory inspection and resource execution.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use comfy_table::{presets, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use frog::config::{Config, FactCacheKind};
use frog::inventory::Inventory;
use frog::outputs;
use frog::prelude::*;
use frog::{kvparse, runner::Runner};

#[derive(Debug, Parser)]
#[command(name = "frog", about = "Home-grown infrastructure management tool")]
struct Cli {
    /// Path(s) to inventories to include
    #[arg(short, long = "inventories", global = true)]
    inventories: Vec<PathBuf>,

    /// Path to the tool configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, defaults to INFO
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage host inventory
    #[command(subcommand)]
    Inventory(InventoryCommand),

    /// Run the resource on the host(s) specified
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    /// Load and display the inventory
    Show,
    /// Load and list the inventory
    List,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Path to directory containing cookbooks
    #[arg(short, long)]
    cookbooks: Vec<PathBuf>,

    /// Limit hosts that the resource should run on
    #[arg(short, long)]
    limit: Option<String>,

    /// Output formatter function
    #[arg(short, long, default_value = "json")]
    outputter: String,

    /// Directory the tool should be bootstrapped into
    #[arg(long)]
    bootstrap_directory: Option<PathBuf>,

    /// Whether the bootstrap directory should be cleaned before bootstrapping
    #[arg(long)]
    bootstrap_clean: bool,

    /// Type of fact cache to use (memory or filesystem)
    #[arg(long)]
    fact_cache_type: Option<String>,

    /// Where the facts cache should be stored
    #[arg(long)]
    fact_cache_dir: Option<PathBuf>,

    /// How long (seconds) the facts cache should be considered valid
    #[arg(long)]
    fact_cache_lifetime: Option<u64>,

    /// Resource to run, as a dotted name
    target: String,

    /// Resource parameters, in key=value form
    parameters: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("frog: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli, config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("frog: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    debug!("load inventory from {:?}", cli.inventories);
    let inventory = Inventory::load(&cli.inventories)?;

    match cli.command {
        Command::Inventory(InventoryCommand::Show) => {
            show_inventory(&inventory);
            Ok(ExitCode::SUCCESS)
        }
        Command::Inventory(InventoryCommand::List) => {
            for host in inventory.iter() {
                println!("{}", host.host);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run_target(inventory, args, config),
    }
}

fn run_target(
    inventory: Inventory,
    args: RunArgs,
    config: Config,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let formatter = outputs::pick_formatter(&args.outputter)?;

    let mut fact_cache_section = config.fact_cache.clone();
    if let Some(kind) = &args.fact_cache_type {
        fact_cache_section.kind = match kind.to_lowercase().as_str() {
            "memory" => FactCacheKind::Memory,
            "filesystem" => FactCacheKind::Filesystem,
            other => return Err(format!("unknown fact cache type `{other}`").into()),
        };
    }
    if let Some(dir) = args.fact_cache_dir {
        fact_cache_section.directory = dir;
    }
    if let Some(lifetime) = args.fact_cache_lifetime {
        fact_cache_section.lifetime_secs = lifetime;
    }
    let mut fact_cache = fact_cache_section.build()?;

    let settings = Settings::new(
        args.bootstrap_directory
            .unwrap_or(config.bootstrap.directory),
        args.bootstrap_clean || config.bootstrap.clean,
    );

    let mut inventory = inventory;
    if let Some(limit) = &args.limit {
        inventory = inventory.select(limit);
        if inventory.is_empty() {
            eprintln!("frog: no hosts matched `{limit}`");
            return Ok(ExitCode::from(2));
        }
    }

    let mut inventory = inventory.resolve_tags(&TagResolver::default())?;
    let params = kvparse::parse_many(&args.parameters);

    let mut runner = Runner::with_settings(settings);
    for cookbooks in &args.cookbooks {
        let path = std::fs::canonicalize(cookbooks)?;
        runner.register_fs_prefix(path);
    }

    runner.gather_facts(&mut inventory, Some(&mut fact_cache));
    let results = runner.execute(&inventory, &args.target, &params)?;
    runner.close();

    println!("{}", formatter(&results));
    Ok(ExitCode::SUCCESS)
}

fn show_inventory(inventory: &Inventory) {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_HORIZONTAL_ONLY);
    table.set_header(["group", "host"]);

    for (group, hosts) in inventory.groups() {
        let mut group_cell = group.as_str();
        for host in hosts {
            table.add_row([group_cell, host.host.as_str()]);
            group_cell = "";
        }
        if hosts.is_empty() {
            table.add_row([group_cell, ""]);
        }
    }

    println!("{table}");
}

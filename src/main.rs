// src/main.rs
//! Chariot - CLI entry point

use anyhow::{bail, Context, Result};
use chariot::cache::Cache;
use chariot::config::Config;
use chariot::container::{Container, OutputConfig};
use chariot::embed;
use chariot::layers::{LayerCache, DEFAULT_ROOTFS_VERSION};
use chariot::pipeline::{parse_recipe_arg, Pipeline, PipelineOptions};
use chariot::recipe::RecipeId;
use chariot::fsutil;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use nix::libc;
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::unistd::{chdir, Pid};
use std::io;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{error, warn};

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "chariot")]
#[command(version)]
#[command(about = "Build orchestrator for bootstrapping an OS from source", long_about = None)]
struct Cli {
    /// Path to the chariot config
    #[arg(long, global = true, default_value = "./config.chariot")]
    config: String,

    /// Path to the chariot cache
    #[arg(long, global = true, default_value = ".chariot-cache")]
    cache: String,

    /// Skip the cache lockfile, use with care
    #[arg(long, global = true)]
    no_lockfile: bool,

    /// Rootfs version tag (pins the bootstrap tarball and package mirror)
    #[arg(long, global = true, default_value = DEFAULT_ROOTFS_VERSION)]
    rootfs_version: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build recipe(s)
    Build(BuildArgs),

    /// Execute a shell command in the base rootfs
    Exec {
        /// Command to execute
        command: Vec<String>,
    },

    /// List every recipe in the config
    List,

    /// Print a recipe's cache directory
    Path {
        /// Recipe, as namespace/name
        recipe: String,
    },

    /// Remove the image-set layer tree
    Wipe,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Stream build output in realtime
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,

    /// Suppress dependency-copy conflict warnings
    #[arg(long)]
    hide_conflicts: bool,

    /// User variable(s) for script interpolation
    #[arg(short = 'o', long = "var", value_name = "KEY=VAL")]
    var: Vec<String>,

    /// Wipe per-recipe incremental build caches
    #[arg(long)]
    clean_cache: bool,

    /// Wipe the image-set layer tree before building
    #[arg(long)]
    wipe_container: bool,

    /// Threads of parallelism handed to build scripts
    #[arg(long, default_value = "8")]
    thread_count: u32,

    /// Recipes to build, as namespace/name
    recipes: Vec<String>,
}

// =============================================================================
// Main Entry Point
// =============================================================================

extern "C" fn handle_sigint(_: libc::c_int) {
    // Take the current container child down with us.
    let _ = kill(Pid::from_raw(0), Signal::SIGKILL);
    exit(130);
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Command::Build(build) if build.quiet => "warn",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    if let Err(err) = run(cli) {
        error!("{:#}", err);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "chariot", &mut io::stdout());
        return Ok(());
    }

    let handler = SigHandler::Handler(handle_sigint);
    unsafe { signal::signal(Signal::SIGINT, handler) }
        .context("failed to install SIGINT handler")?;

    // The cache root is resolved before any chdir so a relative --cache is
    // interpreted from the invocation directory.
    let cache_root = absolute(&cli.cache);

    match &cli.command {
        Command::Completions { .. } => Ok(()),

        Command::List => {
            let config = Config::load(Path::new(&cli.config)).context("failed to load config")?;
            for recipe in &config.recipes {
                println!("{}", recipe);
            }
            Ok(())
        }

        Command::Path { recipe } => {
            let cache = Cache::open(&cache_root, false)?;
            let config = Config::load(Path::new(&cli.config)).context("failed to load config")?;
            let Some((namespace, name)) = parse_recipe_arg(recipe) else {
                bail!("invalid recipe `{}`", recipe);
            };
            match config.lookup(namespace, name) {
                Some(_) => {
                    println!("{}", cache.recipe_dir(namespace, name).display());
                    Ok(())
                }
                None => bail!("unknown recipe `{}`", recipe),
            }
        }

        Command::Wipe => {
            let cache = Cache::open(&cache_root, !cli.no_lockfile)?;
            fsutil::clean(cache.sets_dir()).context("failed to wipe the layer tree")?;
            Ok(())
        }

        Command::Exec { command } => {
            let cache = Cache::open(&cache_root, !cli.no_lockfile)?;
            LayerCache::new(&cache, cli.rootfs_version.clone(), true)
                .ensure_rootfs()
                .context("failed to prepare the base rootfs")?;

            let command = command.join(" ");
            Container::new(cache.rootfs_dir())
                .output(OutputConfig::default())
                .exec_shell(&command)
                .with_context(|| format!("failed to execute `{}`", command))
        }

        Command::Build(build) => {
            let cache = Cache::open(&cache_root, !cli.no_lockfile)?;
            if build.wipe_container {
                fsutil::clean(cache.sets_dir()).context("failed to wipe the layer tree")?;
            }
            run_build(&cli, build, &cache)
        }
    }
}

fn run_build(cli: &Cli, build: &BuildArgs, cache: &Cache) -> Result<()> {
    // Work from the config's directory so relative paths inside recipes
    // (local sources, imports) resolve against it.
    let config_path = Path::new(&cli.config)
        .canonicalize()
        .with_context(|| format!("failed to locate config `{}`", cli.config))?;
    if let Some(dir) = config_path.parent() {
        chdir(dir).with_context(|| format!("failed to enter `{}`", dir.display()))?;
    }

    let config = Config::load(&config_path).context("failed to load config")?;

    let opts = PipelineOptions {
        verbose: build.verbose,
        hide_conflicts: build.hide_conflicts,
        clean_cache: build.clean_cache,
        thread_count: build.thread_count,
        rootfs_version: cli.rootfs_version.clone(),
        user_vars: parse_user_vars(&build.var),
    };
    let mut pipeline = Pipeline::new(cache, config, opts);

    let mut forced: Vec<RecipeId> = Vec::new();
    for arg in &build.recipes {
        let Some((namespace, name)) = parse_recipe_arg(arg) else {
            warn!("invalid recipe `{}`, skipping", arg);
            continue;
        };
        match pipeline.config().lookup(namespace, name) {
            Some(id) => forced.push(id),
            None => warn!("unknown recipe `{}/{}`, skipping", namespace, name),
        }
    }

    for &id in &forced {
        pipeline.invalidate(id);
    }
    pipeline.run(&forced)?;
    Ok(())
}

/// Parse `-o KEY=VAL` arguments, refusing reserved names with a warning.
fn parse_user_vars(args: &[String]) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            warn!("variable `{}` is missing a value, skipping", arg);
            continue;
        };
        if value.is_empty() {
            warn!("variable `{}` is missing a value, skipping", key);
            continue;
        }
        if embed::is_reserved(key) {
            warn!("variable `{}` is reserved, skipping", key);
            continue;
        }
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}

fn absolute(path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

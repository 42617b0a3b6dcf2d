// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("chariot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Build orchestrator for bootstrapping an OS from source")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .default_value("./config.chariot")
                .help("Path to the chariot config"),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .global(true)
                .default_value(".chariot-cache")
                .help("Path to the chariot cache"),
        )
        .arg(
            Arg::new("no_lockfile")
                .long("no-lockfile")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Skip the cache lockfile, use with care"),
        )
        .arg(
            Arg::new("rootfs_version")
                .long("rootfs-version")
                .global(true)
                .default_value("2024.08.01")
                .help("Rootfs version tag"),
        )
        .subcommand(
            Command::new("build")
                .about("Build recipe(s)")
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Stream build output in realtime"),
                )
                .arg(
                    Arg::new("quiet")
                        .long("quiet")
                        .action(ArgAction::SetTrue)
                        .help("Only log warnings and errors"),
                )
                .arg(
                    Arg::new("hide_conflicts")
                        .long("hide-conflicts")
                        .action(ArgAction::SetTrue)
                        .help("Suppress dependency-copy conflict warnings"),
                )
                .arg(
                    Arg::new("var")
                        .short('o')
                        .long("var")
                        .value_name("KEY=VAL")
                        .action(ArgAction::Append)
                        .help("User variable(s) for script interpolation"),
                )
                .arg(
                    Arg::new("clean_cache")
                        .long("clean-cache")
                        .action(ArgAction::SetTrue)
                        .help("Wipe per-recipe incremental build caches"),
                )
                .arg(
                    Arg::new("wipe_container")
                        .long("wipe-container")
                        .action(ArgAction::SetTrue)
                        .help("Wipe the image-set layer tree before building"),
                )
                .arg(
                    Arg::new("thread_count")
                        .long("thread-count")
                        .default_value("8")
                        .help("Threads of parallelism handed to build scripts"),
                )
                .arg(Arg::new("recipes").num_args(0..).help("Recipes to build, as namespace/name")),
        )
        .subcommand(
            Command::new("exec")
                .about("Execute a shell command in the base rootfs")
                .arg(Arg::new("command").num_args(0..).help("Command to execute")),
        )
        .subcommand(Command::new("list").about("List every recipe in the config"))
        .subcommand(
            Command::new("path")
                .about("Print a recipe's cache directory")
                .arg(Arg::new("recipe").required(true).help("Recipe, as namespace/name")),
        )
        .subcommand(Command::new("wipe").about("Remove the image-set layer tree"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completions")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell to generate completions for"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(err) => {
            println!("cargo:warning=OUT_DIR not set: {}", err);
            return;
        }
    };

    let man_dir = out_dir.join("man");
    if let Err(err) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=failed to create man directory: {}", err);
        return;
    }

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer: Vec<u8> = Vec::new();
    if let Err(err) = man.render(&mut buffer) {
        println!("cargo:warning=failed to render man page: {}", err);
        return;
    }
    if let Err(err) = fs::write(man_dir.join("chariot.1"), buffer) {
        println!("cargo:warning=failed to write man page: {}", err);
    }
}

//! Ingest CLI
//!
//! Publishes files through the configured spooler and prints the resulting
//! chunk manifest as JSON.

use clap::{Arg, ArgAction, Command};
use publish_ingest::{FailurePolicy, IngestConfig, Publisher};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Chunked content-addressed publisher")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("JSON configuration file")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Verbose output")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("upload")
                .about("Publish files and directories")
                .arg(
                    Arg::new("spooler")
                        .short('s')
                        .long("spooler")
                        .help("Spooler definition (local,<tmp>,<dir> | gw,<tmp>,<url> | mem)"),
                )
                .arg(
                    Arg::new("old-root")
                        .long("old-root")
                        .help("Root hash the publish replaces"),
                )
                .arg(
                    Arg::new("new-root")
                        .long("new-root")
                        .help("Root hash to commit (default: digest of the manifest)"),
                )
                .arg(
                    Arg::new("paths")
                        .help("Files or directories to publish")
                        .required(true)
                        .num_args(1..)
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration (credentials masked)"))
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    };

    let level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        config.log_level.to_level_filter()
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match matches.subcommand() {
        Some(("upload", sub_matches)) => {
            if let Some(spooler) = sub_matches.get_one::<String>("spooler") {
                config = config.spooler(spooler.clone());
            }
            let paths: Vec<PathBuf> = sub_matches
                .get_many::<PathBuf>("paths")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();

            let publisher = Publisher::new(config, FailurePolicy::default())?;
            let report = publisher.publish(&paths)?;

            let new_root = match sub_matches.get_one::<String>("new-root") {
                Some(root) => root.clone(),
                None => report.manifest_digest()?.to_hex(),
            };
            let old_root = sub_matches
                .get_one::<String>("old-root")
                .cloned()
                .unwrap_or_else(|| "0".repeat(64));
            publisher.commit(&old_root, &new_root)?;

            println!("{}", report.to_json()?);
            eprintln!("root: {} -> {}", old_root, new_root);
        }
        Some(("config", _)) => {
            config.validate()?;
            println!("{}", config.to_redacted_json()?);
        }
        _ => {
            eprintln!("No subcommand provided. Use --help for usage information.");
            std::process::exit(1);
        }
    }

    Ok(())
}

//! Offline inspection of dispatcher list files
//!
//! Loads a list file the way the dispatcher does, then prints the resulting
//! sets or simulates selections against them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rvoip_dispatcher_core::logging::{parse_log_level, setup_logging, LogFormat};
use rvoip_dispatcher_core::registry::ListFileSource;
use rvoip_dispatcher_core::{Algorithm, BasicMessage, Dispatcher, DispatcherConfig, NoopEventRouter, UpdateMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); DISPATCHER_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Destination list file, overrides the configured one
    #[arg(short, long)]
    list: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log output, `text` or `json`
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the loaded destination sets
    Dump {
        /// JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run selections against a set and print how often each destination won
    Select {
        /// Destination set id
        #[arg(short, long)]
        group: u32,

        /// Algorithm id (0-10)
        #[arg(short, long, default_value = "4")]
        algorithm: u32,

        /// Number of simulated requests
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// From URI used by the From-hash algorithm
        #[arg(long, default_value = "sip:caller@example.com")]
        from: String,
    },
    /// Validate the configuration and print it
    Check,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = parse_log_level(&cli.log_level)?;
    let format: LogFormat = cli.log_format.parse()?;
    setup_logging(level, format)?;

    let mut config = DispatcherConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(list) = cli.list {
        config.list_file = Some(list);
    }

    if let Command::Check = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let list_file = config.list_file.clone().context("no destination list given")?;
    let dispatcher = Dispatcher::new(config, Arc::new(NoopEventRouter))?;
    let report = dispatcher
        .reload(&mut ListFileSource::new(&list_file))
        .with_context(|| format!("loading {}", list_file.display()))?;
    if report.is_partial() {
        eprintln!(
            "warning: {} rows skipped, {} IPv6 rows skipped",
            report.skipped_rows, report.skipped_ipv6
        );
    }

    match cli.command {
        Command::Dump { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&dispatcher.list())?);
            } else {
                print!("{}", dispatcher.dump());
            }
        }
        Command::Select {
            group,
            algorithm,
            count,
            from,
        } => {
            let Some(algorithm) = Algorithm::from_id(algorithm) else {
                bail!("unknown algorithm {}", algorithm);
            };
            let mut hits: BTreeMap<String, usize> = BTreeMap::new();
            for i in 0..count {
                let mut msg = BasicMessage::request("INVITE", "sip:service@example.com")
                    .with_call_id(format!("sim-{}@dispatcher-cli", i))
                    .with_from(from.as_str())
                    .with_to("sip:service@example.com");
                let selection = dispatcher.select(&mut msg, group, algorithm, UpdateMode::DestinationUri)?;
                *hits.entry(selection.uri).or_default() += 1;
            }
            for (uri, n) in hits {
                println!("{:>8} {}", n, uri);
            }
        }
        Command::Check => {}
    }

    Ok(())
}

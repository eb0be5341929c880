//! `trellis` command line driver

mod demo;
mod simulate;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;
use trellis_orchestrator::EngineConfig;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("trellis")
        .version(trellis_orchestrator::VERSION)
        .about("Prompt graph orchestration engine")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration file (TOML)"),
        )
        .subcommand(
            Command::new("demo")
                .about("Build a small graph and stream generations through the echo model")
                .arg(
                    Arg::new("delay-ms")
                        .long("delay-ms")
                        .default_value("15")
                        .value_parser(value_parser!(u64))
                        .help("Pause between streamed words"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded random mutation sequence with invariant checks")
                .arg(
                    Arg::new("operations")
                        .long("ops")
                        .default_value("10000")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print the resolved settings")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Path to the TOML file"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(matches: &ArgMatches) -> Result<EngineConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("demo", args)) => {
            let config = load_config(args)?;
            let delay = args.get_one::<u64>("delay-ms").copied().unwrap_or(15);
            demo::run_demo(config, Duration::from_millis(delay)).await
        }
        Some(("simulate", args)) => {
            let config = load_config(args)?;
            let sim = simulate::SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                operations: args.get_one::<u64>("operations").copied().unwrap_or(10_000),
                stop_on_violation: args.get_flag("stop-on-violation"),
                graph: config.graph_config(),
            };
            tracing::info!(seed = sim.seed, operations = sim.operations, "running simulation");

            let report = simulate::run_simulation(&sim);
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            } else {
                println!("{}", report.generate_text());
            }
            if !report.passed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(("check-config", args)) => {
            let path = args
                .get_one::<PathBuf>("path")
                .context("missing configuration path")?;
            let config = EngineConfig::load(path).with_context(|| format!("invalid configuration {}", path.display()))?;
            println!("# {} is valid\n", path.display());
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_args_parse() {
        let matches = cli()
            .try_get_matches_from(["trellis", "simulate", "--ops", "25", "--seed", "9"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(args.get_one::<u64>("operations"), Some(&25));
        assert_eq!(args.get_one::<u64>("seed"), Some(&9));
        assert!(!args.get_flag("stop-on-violation"));
    }

    #[test]
    fn check_config_requires_path() {
        assert!(cli().try_get_matches_from(["trellis", "check-config"]).is_err());
    }
}

//! ccp-risk-engine CLI
//!
//! Run clearing-network simulations from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration
//! ccp-risk-engine run
//!
//! # Run from a config file, logging applied intents
//! ccp-risk-engine run --config sim.json --log intents.jsonl
//!
//! # Replay a log and print the final state as JSON
//! ccp-risk-engine replay --config sim.json --log intents.jsonl --format json
//!
//! # Print the default configuration
//! ccp-risk-engine config
//! ```

use ccp_risk_engine::core::config::SimulationConfig;
use ccp_risk_engine::interfaces::intent_log::{read_log, JsonLinesLog};
use ccp_risk_engine::simulation::runner::Simulation;
use ccp_risk_engine::simulation::topology::NetworkTopology;
use std::fs;
use std::process;

fn print_usage() {
    eprintln!(
        r#"ccp-risk-engine: clearing network simulator (banks, CCP, default fund)

USAGE:
    ccp-risk-engine <COMMAND> [OPTIONS]

COMMANDS:
    run         Run a simulation
    replay      Re-apply a durable intent log and report the final state
    config      Print the default configuration as JSON
    help        Show this message

OPTIONS (run):
    --config <FILE>     JSON configuration (default: built-in defaults)
    --banks <N>         Override the number of banks
    --steps <N>         Override the number of rounds
    --seed <N>          Override the random seed
    --topology <KIND>   erdos-renyi, scale-free, small-world or complete
    --log <FILE>        Append applied intents to a JSON-lines log
    --sequential        Run the decision phase on one thread
    --format <FORMAT>   Output format: text (default) or json

OPTIONS (replay):
    --config <FILE>     Configuration the log was produced with
    --log <FILE>        Intent log to replay (required)
    --format <FORMAT>   Output format: text (default) or json

OPTIONS (config):
    --output <FILE>     Write to file instead of stdout

ENVIRONMENT:
    RUST_LOG            Log filter (default: info)

EXAMPLES:
    ccp-risk-engine run --banks 20 --steps 100 --topology scale-free
    ccp-risk-engine run --config stress.json --log run.jsonl --format json
    ccp-risk-engine replay --config stress.json --log run.jsonl"#
    );
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i)
        .map(String::as_str)
        .unwrap_or_else(|| fail(format!("{} requires a value", flag)))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    value(args, i, flag)
        .parse()
        .unwrap_or_else(|_| fail(format!("{} requires a number", flag)))
}

fn topology(kind: &str) -> NetworkTopology {
    match kind {
        "erdos-renyi" | "random" => NetworkTopology::ErdosRenyi { p: 0.3 },
        "scale-free" => NetworkTopology::ScaleFree { m: 2 },
        "small-world" => NetworkTopology::SmallWorld { k: 4, beta: 0.1 },
        "complete" => NetworkTopology::Complete,
        other => fail(format!("unknown topology '{}'", other)),
    }
}

fn load_config(path: Option<&str>) -> SimulationConfig {
    match path {
        Some(p) => SimulationConfig::from_json_file(p).unwrap_or_else(|e| fail(e)),
        None => SimulationConfig::default(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

fn cmd_run(args: &[String]) {
    let mut config_path = None;
    let mut log_path = None;
    let mut format = "text".to_string();
    let mut banks = None;
    let mut steps = None;
    let mut seed = None;
    let mut topo = None;
    let mut sequential = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(value(args, i, "--config").to_string());
            }
            "--log" => {
                i += 1;
                log_path = Some(value(args, i, "--log").to_string());
            }
            "--format" => {
                i += 1;
                format = value(args, i, "--format").to_string();
            }
            "--banks" => {
                i += 1;
                banks = Some(number(args, i, "--banks"));
            }
            "--steps" => {
                i += 1;
                steps = Some(number(args, i, "--steps"));
            }
            "--seed" => {
                i += 1;
                seed = Some(number(args, i, "--seed"));
            }
            "--topology" => {
                i += 1;
                topo = Some(topology(value(args, i, "--topology")));
            }
            "--sequential" => sequential = true,
            _ => fail(format!("unknown option: {}", args[i])),
        }
        i += 1;
    }

    let mut config = load_config(config_path.as_deref());
    if let Some(n) = banks {
        config.bank_count = n;
    }
    if let Some(n) = steps {
        config.steps = n;
    }
    if let Some(s) = seed {
        config.seed = s;
    }
    if let Some(t) = topo {
        config.topology = t;
    }
    config.force_sequential |= sequential;

    let mut sim = Simulation::new(config).unwrap_or_else(|e| fail(e));
    if let Some(path) = &log_path {
        let log = JsonLinesLog::create(path).unwrap_or_else(|e| fail(e));
        sim = sim.with_intent_log(log);
    }
    let summary = sim.run().unwrap_or_else(|e| fail(e));

    if format == "json" {
        print_json(&summary);
    } else {
        println!("{}", summary);
        println!("{}", sim.snapshot());
        if let Some(stats) = sim.graph().history().last() {
            println!(
                "Topology: {} edges, exposure {}, {} contagion cluster(s), largest {}",
                stats.edges,
                stats.total_exposure.round_dp(2),
                stats.contagion_clusters,
                stats.largest_cluster
            );
        }
    }
}

fn cmd_replay(args: &[String]) {
    let mut config_path = None;
    let mut log_path = None;
    let mut format = "text".to_string();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(value(args, i, "--config").to_string());
            }
            "--log" => {
                i += 1;
                log_path = Some(value(args, i, "--log").to_string());
            }
            "--format" => {
                i += 1;
                format = value(args, i, "--format").to_string();
            }
            _ => fail(format!("unknown option: {}", args[i])),
        }
        i += 1;
    }

    let log_path = log_path.unwrap_or_else(|| fail("--log <FILE> is required"));
    let entries = read_log(&log_path).unwrap_or_else(|e| fail(e));
    let config = load_config(config_path.as_deref());
    let sim = Simulation::replay(config, &entries).unwrap_or_else(|e| fail(e));

    if format == "json" {
        print_json(sim.snapshot().as_ref());
    } else {
        eprintln!("Replayed {} entries through step {}", entries.len(), sim.step());
        println!("{}", sim.summary());
        println!("{}", sim.snapshot());
    }
}

fn cmd_config(args: &[String]) {
    let mut output_path: Option<String> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--output" => {
                i += 1;
                output_path = Some(value(args, i, "--output").to_string());
            }
            _ => fail(format!("unknown option: {}", args[i])),
        }
        i += 1;
    }

    let json = serde_json::to_string_pretty(&SimulationConfig::default())
        .unwrap_or_else(|e| fail(e));
    match output_path {
        Some(path) => {
            fs::write(&path, &json).unwrap_or_else(|e| fail(format!("writing '{}': {}", path, e)));
            eprintln!("Default configuration written to {}", path);
        }
        None => println!("{}", json),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];

    match command {
        "run" => cmd_run(rest),
        "replay" => cmd_replay(rest),
        "config" => cmd_config(rest),
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            process::exit(1);
        }
    }
}

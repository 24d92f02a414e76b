//! Prints the graph description for a config file.
//!
//! Usage: render-graph [config.toml] [--reveal]

use std::env;

use nixon_core::ConfigManager;
use nixon_graph::Topology;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let reveal = args.iter().any(|a| a == "--reveal");
    let path = args.iter().find(|a| !a.starts_with("--"));

    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    println!("Config: {}", manager.config_path().display());

    let settings = manager.load()?;
    let topology = Topology::build(&settings)?;

    println!(
        "Format: {:?}, preroll {} bytes",
        topology.format(),
        topology.preroll_bytes()
    );
    let branches: Vec<String> = topology.branches().iter().map(|b| b.to_string()).collect();
    println!("Branches: {}", branches.join(", "));
    println!("---");
    if reveal {
        println!("{}", topology.describe());
    } else {
        println!("{}", topology.describe_redacted());
    }
    println!("---");

    Ok(())
}

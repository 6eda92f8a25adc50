mod base;
mod client;
mod config;
mod orchestrator;
mod payload;
mod random;
mod server;
mod simulator;
mod topology;
mod tracer;
mod transport;
mod tree;

// Internal dependencies.
use config::Config;
use topology::create_topology;
use tracer::Tracer;
use tree::TreeIndex;

// External dependencies.
use failure::{format_err, Error};
use log::info;
use std::fs;
use structopt::StructOpt;

#[derive(StructOpt)]
struct CommandLineArgs {
    /// The path to the config file to read.
    #[structopt(parse(from_os_str))]
    config_file: std::path::PathBuf,
    /// Use this random seed instead of the one in the config file
    #[structopt(long)]
    seed: Option<u64>,
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = CommandLineArgs::from_args();

    let config_str = fs::read_to_string(&args.config_file).map_err(|e| {
        format_err!(
            "Unable to read YAML config file {}: {}",
            args.config_file.display(),
            e
        )
    })?;
    let mut config: Config = serde_yaml::from_str(&config_str)?;
    if let Some(seed) = args.seed {
        config.random_seed = seed;
    }
    config.validate()?;

    let tree = TreeIndex::new(&config.topo.fanouts)?;
    info!(
        "Tree with fan-outs {:?} has {} nodes",
        config.topo.fanouts,
        tree.n_nodes()
    );
    let tracer = Tracer::new(&config);
    let mut sched = create_topology(&config, &tree, &tracer)?;

    sched.simulate(config.sim_dur)?;

    let summary = tracer.finalize(sched.now());
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

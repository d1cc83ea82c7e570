use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use toml::Table;

use betatron::sim::config::{
    CacheConfig, Config, FabricConfig, MemConfig, SimConfig, TopologyConfig, WorkloadConfig,
};
use betatron::sim::stats;
use betatron::sim::top::BetatronTop;
use betatron::workload::SizeClass;

#[derive(Parser)]
#[command(version, about)]
struct BetatronArgs {
    #[arg(help = "Path to config.toml")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Benchmark profile (e.g. blackscholes, canneal)")]
    benchmark: Option<String>,
    #[arg(long, help = "Input size class: test, simsmall, simmedium, simlarge")]
    size: Option<String>,
    #[arg(long, help = "Override number of cores")]
    num_cores: Option<usize>,
    #[arg(long, help = "Override cores per cluster")]
    cluster_size: Option<usize>,
    #[arg(long, help = "Override per-core access count")]
    accesses: Option<u64>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = BetatronArgs::parse();
    let config_table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).context("cannot parse config toml")?
        }
        None => Table::new(),
    };

    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut topo_config = TopologyConfig::from_section(config_table.get("topology"));
    let cache_config = CacheConfig::from_section(config_table.get("cache"));
    let fabric_config = FabricConfig::from_section(config_table.get("fabric"));
    let mem_config = MemConfig::from_section(config_table.get("mem"));
    let mut workload_config = WorkloadConfig::from_section(config_table.get("workload"));

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    topo_config.num_cores = argv.num_cores.unwrap_or(topo_config.num_cores);
    topo_config.cluster_size = argv.cluster_size.unwrap_or(topo_config.cluster_size);
    workload_config.accesses = argv.accesses.unwrap_or(workload_config.accesses);
    if argv.benchmark.is_some() {
        workload_config.benchmark = argv.benchmark;
    }
    if let Some(size) = &argv.size {
        workload_config.size = SizeClass::parse(size)?;
    }

    if let Some(name) = &workload_config.benchmark {
        stats::set_run_label(&format!("{}_{}", name, workload_config.size.as_str()));
    }

    let mut top = BetatronTop::new(
        sim_config,
        topo_config,
        cache_config,
        fabric_config,
        mem_config,
        workload_config,
    )?;
    let summary = top.run()?;
    println!(
        "simulated {} ticks: {} loads, {} stores, {} misses, {} writebacks",
        summary.ticks,
        summary.total.loads,
        summary.total.stores,
        summary.total.misses,
        summary.total.writebacks
    );
    if summary.anomalies > 0 {
        eprintln!("{} workload anomalies (see log)", summary.anomalies);
        std::process::exit(2);
    }
    Ok(())
}

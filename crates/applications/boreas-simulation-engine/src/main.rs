//! Boreas Simulation Engine CLI
//!
//! Command-line interface for replaying one seeded datacenter scenario under
//! several placement policies and comparing the outcomes.

use clap::Parser;
use std::fs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boreas_simulation_engine::{
    checkpoint::CheckpointPolicy,
    error::Result,
    interference::NoInterference,
    power::LinearPowerModel,
    scheduler::{FilterWeighPolicy, PlacementPolicy, RandomPolicy, RoundRobinPolicy},
    simulator::{SimulationResult, Simulator, SimulatorConfig},
    telemetry::InMemorySink,
    types::HostSpec,
    workload::{FaultProfile, SyntheticConfig, SyntheticWorkload},
};

/// Idle draw assumed for every simulated host
const IDLE_POWER_W: f64 = 110.0;
/// Full-load draw assumed for every simulated host
const MAX_POWER_W: f64 = 320.0;

#[derive(Parser, Debug)]
#[command(name = "boreas-sim")]
#[command(about = "Simulate datacenter placement policies on a virtual clock", long_about = None)]
struct Args {
    /// Simulation duration in virtual ticks
    #[arg(short, long, default_value_t = 1_000_000)]
    duration: u64,

    /// Number of hosts in the topology
    #[arg(long, default_value_t = 8)]
    hosts: usize,

    /// Cores per host
    #[arg(long, default_value_t = 8)]
    cores: u32,

    /// Per-core rate in MHz
    #[arg(long, default_value_t = 2_400)]
    core_rate: u64,

    /// Memory per host in MB
    #[arg(long, default_value_t = 32_768)]
    memory: u64,

    /// Number of servers to generate
    #[arg(short = 'n', long, default_value_t = 200)]
    servers: usize,

    /// Mean inter-arrival gap in ticks
    #[arg(long, default_value_t = 120.0)]
    mean_interarrival: f64,

    /// Widest generated server, in cores
    #[arg(long, default_value_t = 4)]
    max_cores: u32,

    /// Shortest generated fragment, in ticks
    #[arg(long, default_value_t = 60)]
    min_fragment: u64,

    /// Longest generated fragment, in ticks
    #[arg(long, default_value_t = 3_600)]
    max_fragment: u64,

    /// Most fragments per generated server
    #[arg(long, default_value_t = 4)]
    max_fragments: usize,

    /// Memory footprint per requested core, in MB
    #[arg(long, default_value_t = 2_048)]
    memory_per_core: u64,

    /// Policies to compare (comma-separated: filterweigh,random,roundrobin)
    #[arg(short, long, default_value = "filterweigh,random,roundrobin")]
    policies: String,

    /// Telemetry slice width in ticks
    #[arg(long, default_value_t = 300)]
    slice: u64,

    /// Host boot delay in ticks
    #[arg(long, default_value_t = 0)]
    boot_delay: u64,

    /// Productive ticks between checkpoints (0 disables checkpointing)
    #[arg(long, default_value_t = 0)]
    checkpoint_wait: u64,

    /// Non-productive ticks paid per checkpoint
    #[arg(long, default_value_t = 0)]
    checkpoint_time: u64,

    /// Mean time to host failure in ticks (0 disables fault injection)
    #[arg(long, default_value_t = 0.0)]
    mttf: f64,

    /// Mean time to host repair in ticks
    #[arg(long, default_value_t = 5_000.0)]
    mttr: f64,

    /// Seed shared by workload generation, fault injection and random placement
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output JSON file path (optional)
    #[arg(short, long)]
    output: Option<String>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boreas_simulation_engine=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Boreas Simulation Engine                                ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    let checkpoint = (args.checkpoint_wait > 0)
        .then(|| CheckpointPolicy::new(args.checkpoint_wait, args.checkpoint_time));
    let fault_profile = (args.mttf > 0.0).then(|| FaultProfile {
        mean_time_to_fail_ticks: args.mttf,
        mean_time_to_repair_ticks: args.mttr,
    });

    println!("Configuration:");
    println!("  Duration: {} ticks", args.duration);
    println!(
        "  Topology: {} hosts x {} cores @ {} MHz, {} MB memory",
        args.hosts, args.cores, args.core_rate, args.memory
    );
    println!(
        "  Workload: {} servers, mean inter-arrival {} ticks",
        args.servers, args.mean_interarrival
    );
    println!("  Telemetry slice: {} ticks", args.slice);
    match &checkpoint {
        Some(policy) => println!(
            "  Checkpoints: {} ticks every {} productive ticks",
            policy.time_ticks, policy.wait_ticks
        ),
        None => println!("  Checkpoints: disabled"),
    }
    match &fault_profile {
        Some(profile) => println!(
            "  Faults: MTTF {} ticks, MTTR {} ticks",
            profile.mean_time_to_fail_ticks, profile.mean_time_to_repair_ticks
        ),
        None => println!("  Faults: disabled"),
    }
    println!("  Seed: {}\n", args.seed);

    let topology: Vec<HostSpec> = (0..args.hosts)
        .map(|_| HostSpec::new(args.cores, args.core_rate, args.memory))
        .collect();

    let workload_config = SyntheticConfig {
        servers: args.servers,
        mean_interarrival_ticks: args.mean_interarrival,
        max_cores: args.max_cores,
        min_fragment_ticks: args.min_fragment,
        max_fragment_ticks: args.max_fragment,
        max_fragments: args.max_fragments,
        memory_per_core_mb: args.memory_per_core,
        checkpoint,
    };

    // Parse policy list
    let policy_names: Vec<&str> = args.policies.split(',').map(|s| s.trim()).collect();

    let mut results: Vec<SimulationResult> = Vec::new();

    // Replay the same seeded scenario under each policy
    for policy_name in &policy_names {
        let policy: Box<dyn PlacementPolicy> = match *policy_name {
            "filterweigh" => Box::new(FilterWeighPolicy::standard()),
            "random" => Box::new(RandomPolicy::new(args.seed)),
            "roundrobin" => Box::new(RoundRobinPolicy::new()),
            _ => {
                eprintln!("Unknown policy: {policy_name}");
                continue;
            }
        };

        print!("Running simulation with {policy_name} policy... ");

        let sink = InMemorySink::new();
        let mut simulator = Simulator::new(
            topology.clone(),
            policy,
            Box::new(NoInterference),
            Box::new(LinearPowerModel::new(IDLE_POWER_W, MAX_POWER_W)),
            Box::new(sink.clone()),
            SimulatorConfig {
                slice_ticks: args.slice,
                boot_delay_ticks: args.boot_delay,
                fault_profile,
                seed: args.seed,
            },
        )?;
        simulator.attach_trace(Box::new(SyntheticWorkload::new(
            workload_config.clone(),
            args.seed,
        )?))?;

        let result = simulator.run(args.duration)?;
        println!(
            "Done ({} slice reports, {} power samples)",
            sink.slices().len(),
            sink.power_samples().len()
        );

        results.push(result);
    }

    // Display results
    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║  Simulation Results                                      ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!(
        "{:<14} {:>12} {:>10} {:>9} {:>8} {:>10} {:>10} {:>9} {:>12}",
        "Policy",
        "Completed",
        "PlaceFail",
        "Evicted",
        "Ckpts",
        "Avg TAT",
        "P99 TAT",
        "CPU sat",
        "Energy(MWt)"
    );
    println!("{}", "-".repeat(102));

    for result in &results {
        let completed = format!("{}/{}", result.completed_servers, result.total_servers);
        let cpu_sat = if result.requested_cpu_time > 0 {
            format!(
                "{:.1}%",
                result.granted_cpu_time as f64 / result.requested_cpu_time as f64 * 100.0
            )
        } else {
            "N/A".to_string()
        };

        println!(
            "{:<14} {:>12} {:>10} {:>9} {:>8} {:>10.1} {:>10} {:>9} {:>12.1}",
            result.policy_name,
            completed,
            result.placement_failures,
            result.total_evictions,
            result.checkpoints_taken,
            result.average_turnaround_ticks,
            result.p99_turnaround_ticks,
            cpu_sat,
            result.total_energy / 1.0e6,
        );
    }

    // Compare turnaround against the slowest policy
    if results.len() > 1 {
        let baseline = results
            .iter()
            .max_by(|a, b| a.average_turnaround_ticks.total_cmp(&b.average_turnaround_ticks));
        if let Some(baseline) = baseline {
            if baseline.average_turnaround_ticks > 0.0 {
                println!("\n{}", "-".repeat(102));
                println!("Turnaround improvement vs {} baseline:", baseline.policy_name);

                for result in &results {
                    if result.policy_name != baseline.policy_name {
                        let saved =
                            baseline.average_turnaround_ticks - result.average_turnaround_ticks;
                        let saved_pct = (saved / baseline.average_turnaround_ticks) * 100.0;
                        println!(
                            "  {:<18} {:>10.1} ticks ({:>5.1}%)",
                            result.policy_name, saved, saved_pct
                        );
                    }
                }
            }
        }
    }

    // Output to JSON if requested
    if let Some(output_path) = args.output {
        println!("\nWriting results to {output_path}...");
        let json = serde_json::to_string_pretty(&results)?;
        fs::write(&output_path, json)?;
        println!("  Results saved");
    }

    println!("\n✅ Simulation complete!\n");
    Ok(())
}

//! CLI for dramscope — reverse-engineer your memory controller's DRAM
//! address mapping.

use clap::Parser;

#[derive(Parser)]
#[command(name = "dramscope")]
#[command(about = "dramscope — recover DRAM address mappings from timing side channels")]
#[command(version = dramscope_core::VERSION)]
struct Cli {
    /// Number of 1 GiB huge pages to map
    num_huge_pages: usize,

    /// Comma-separated hex mask list; addresses with any masked bit set are
    /// excluded from the pool ("0" disables filtering)
    masks: String,

    /// Platform timing profile (CPU/DDR identifier)
    #[arg(long, default_value = "intel-core-12th-ddr4")]
    profile: String,

    /// DDR generation of the installed modules
    #[arg(long, default_value = "ddr4")]
    ddr: String,

    /// Module size in GiB
    #[arg(long, default_value_t = 32)]
    module_size_gb: u64,

    /// Ranks per module
    #[arg(long, default_value_t = 2)]
    ranks: u16,

    /// DQ pins per chip (4, 8 or 16)
    #[arg(long, default_value_t = 8)]
    dq: u16,

    /// Pin the probing thread to this hardware thread
    #[arg(long)]
    pin_cpu: Option<usize>,

    /// Set the pinned CPU's governor to performance and disable turbo
    /// (needs root)
    #[arg(long, requires = "pin_cpu")]
    quiesce: bool,

    /// Seed the random draws for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Same-bank clusters to establish before the function search
    #[arg(long, default_value_t = 2)]
    clusters: usize,

    /// Print latency calibration sweeps instead of running discovery
    #[arg(long)]
    calibrate: bool,

    /// Print the full per-hypothesis diagnostics trail after the mapping
    #[arg(long)]
    diagnostics: bool,
}

fn parse_masks(list: &str) -> Result<Vec<u64>, String> {
    let mut masks = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let digits = item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")).unwrap_or(item);
        let mask = u64::from_str_radix(digits, 16)
            .map_err(|e| format!("bad mask `{item}`: {e}"))?;
        if mask != 0 {
            masks.push(mask);
        }
    }
    Ok(masks)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    use dramscope_core::{
        AddressPool, DiscoveryEngine, DramGeometry, EngineConfig, HugePageRegion, MemoryTopology,
        PlatformProfile, TimingConflictOracle, TimingRefreshValidator, TscTimer, calibrate,
        config::GB,
    };
    use rand::SeedableRng;

    let profile = PlatformProfile::lookup(&cli.profile).map_err(|e| {
        log::error!("known profiles: {}", PlatformProfile::known_keys().join(", "));
        e
    })?;
    let ddr = cli.ddr.parse()?;
    let geometry = DramGeometry::resolve(ddr, cli.module_size_gb * GB, cli.ranks, cli.dq)?;
    let masks = parse_masks(&cli.masks)?;

    log::info!(
        "profile {} / geometry {} / {} huge pages / {} masks",
        cli.profile,
        geometry,
        cli.num_huge_pages,
        masks.len()
    );

    let region = HugePageRegion::allocate(cli.num_huge_pages)?;
    let pool = AddressPool::from_regions(&region.mapped_regions()?, &masks, &profile)?;
    log::info!("pool holds {} cache lines", pool.len());

    if cli.quiesce {
        if let Some(cpu) = cli.pin_cpu {
            if let Err(e) = dramscope_core::quiesce_cpu_frequency(cpu) {
                log::warn!("could not quiesce CPU {cpu} frequency: {e}");
            }
        }
    }

    let timer = TscTimer::new();

    if cli.calibrate {
        let mut rng = match cli.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_os_rng(),
        };
        let report = calibrate(&timer, &pool, &mut rng);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let oracle = TimingConflictOracle::new(&timer, profile);
    let refresh = TimingRefreshValidator::new(&timer, profile);
    let engine = DiscoveryEngine::new(
        &pool,
        &oracle,
        &refresh,
        MemoryTopology::single_channel(geometry),
        profile,
        EngineConfig {
            num_clusters: cli.clusters,
            pinned_cpu: cli.pin_cpu,
            seed: cli.seed,
            ..EngineConfig::default()
        },
    );

    let token = engine.cancel_token();
    ctrlc::set_handler(move || token.cancel())?;

    let report = engine.run()?;

    println!("{}", serde_json::to_string_pretty(&report.mapping)?);
    if cli.diagnostics {
        let mut stdout = std::io::stdout().lock();
        report.diagnostics.write_json(&mut stdout)?;
    }

    log::info!(
        "oracle retries: {}, hypotheses scored: {}, prefiltered: {}",
        report.diagnostics.oracle_retries,
        report.diagnostics.hypotheses.len(),
        report.diagnostics.prefiltered
    );
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run(_cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    Err("dramscope requires Linux on x86_64 (pagemap + rdtscp/clflush)".into())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

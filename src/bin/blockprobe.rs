use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blockprobe_rs::config::{load_proxy_file, parse_proxy_list};
use blockprobe_rs::experiments::{find_configuration, spawn_ctrl_c_listener};
use blockprobe_rs::{
    ConfigError, EngineConfig, ExperimentConfig, ExperimentRunner, ExperimentSuite, IdentityEntry,
    JsonFileStore, ReqwestTransport, RotationMode, StopHandle, SweepError, SweepReport,
    TransportMode, VERSION,
};
use clap::Parser;
use url::Url;

/// Run blocking-threshold experiments against a target.
#[derive(Parser, Debug)]
#[command(name = "blockprobe", version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (.toml or .json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target URL; overrides the configuration file.
    #[arg(long)]
    target: Option<String>,

    /// Suite (request-frequency, delays, user-agents, retry, session, all) or a
    /// single configuration name such as delay_fixed_2s.
    #[arg(long, short = 'e')]
    experiment: Option<String>,

    /// Run every suite.
    #[arg(long)]
    run_all: bool,

    /// Reduced parameter grid and attempt count.
    #[arg(long)]
    quick: bool,

    /// Attempts per configuration.
    #[arg(long)]
    iterations: Option<usize>,

    /// Attempts in flight at once.
    #[arg(long)]
    parallelism: Option<usize>,

    /// Proxy URL to add to the identity pool. Repeatable.
    #[arg(long = "proxy")]
    proxies: Vec<String>,

    /// File with one proxy URL per line.
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Ignore every configured proxy and connect directly.
    #[arg(long)]
    no_proxy: bool,

    /// Check every proxy against --check-url before the first run.
    #[arg(long)]
    check_proxies: bool,

    /// URL fetched by --check-proxies; only a 200 counts as working.
    #[arg(long, default_value = "https://httpbin.org/ip")]
    check_url: String,

    /// Directory for JSON results.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Rank the results already stored in the output directory and exit.
    #[arg(long)]
    analyze: bool,

    /// Pause between suites of a full sweep, in seconds.
    #[arg(long, default_value_t = 30)]
    suite_pause_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err:#}");
            if is_config_error(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<SweepError>(), Some(SweepError::Config(_)))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    apply_overrides(&mut config, &cli)?;
    config.validate()?;

    if cli.analyze {
        let results = JsonFileStore::load_all(&config.output_dir)
            .with_context(|| format!("loading results from {}", config.output_dir.display()))?;
        println!("{}", SweepReport::from_results(&results));
        return Ok(ExitCode::SUCCESS);
    }

    let plan = plan_runs(&cli, &config)?;
    if plan.is_empty() {
        log::error!("nothing to run: pass --experiment <suite|name>, --run-all, or define experiments in --config");
        return Ok(ExitCode::from(2));
    }

    let pool = Arc::new(config.build_pool()?);
    let request = config.request_spec()?;
    for (_, configs) in &plan {
        for experiment in configs {
            experiment.validate()?;
            experiment.validate_for_pool(&pool)?;
            if experiment.transport != TransportMode::Http {
                return Err(ConfigError::TransportUnavailable {
                    experiment: experiment.name.clone(),
                    mode: experiment.transport,
                }
                .into());
            }
        }
    }

    log::info!(
        "blockprobe {VERSION}: target {}, {} proxies, {} suites",
        config.target,
        pool.len(),
        plan.len()
    );

    let stop = StopHandle::new();
    spawn_ctrl_c_listener(stop.clone());

    let mut runner = ExperimentRunner::new(config.build_classifier()?)
        .with_transport(TransportMode::Http, Arc::new(ReqwestTransport::new()))
        .with_timeout(config.timeout)
        .with_direct_fallback(config.direct_fallback)
        .with_stop_signal(stop.listener());
    let mut store = JsonFileStore::new(&config.output_dir);

    if cli.check_proxies && pool.has_proxies() {
        let url = Url::parse(&cli.check_url)
            .with_context(|| format!("invalid --check-url '{}'", cli.check_url))?;
        let checks = runner.check_identities(&pool, &url).await;
        if checks.iter().all(|check| !check.alive) {
            log::warn!("no proxy passed its check; runs will lean on cooldowns and fallback");
        }
    }

    let mut results = Vec::new();
    for (position, (label, configs)) in plan.iter().enumerate() {
        if position > 0 && !runner.cool_down(Duration::from_secs(cli.suite_pause_secs)).await {
            break;
        }
        log::info!("suite {label}: {} configurations", configs.len());
        let suite_results = runner
            .run_sweep(Arc::clone(&pool), configs, &request, &mut store, Duration::ZERO)
            .await?;
        results.extend(suite_results);
    }

    println!("{}", SweepReport::from_results(&results));

    let health = pool.health_report();
    if health.total_identities > 0 {
        log::info!(
            "identity pool: {} available, {} cooling down",
            health.available_identities,
            health.cooling_identities
        );
    }

    let failures: usize = results.iter().map(|result| result.dispatcher_failures()).sum();
    if failures > 0 {
        log::warn!("{failures} attempts could not be dispatched");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn apply_overrides(config: &mut EngineConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }

    if cli.no_proxy {
        config.identities.clear();
        return Ok(());
    }
    config
        .identities
        .extend(parse_proxy_list(&cli.proxies.join("\n")));
    if let Some(path) = &cli.proxy_file {
        let entries: Vec<IdentityEntry> = load_proxy_file(path)?;
        log::info!("loaded {} proxies from {}", entries.len(), path.display());
        config.identities.extend(entries);
    }
    Ok(())
}

/// Configurations to run, grouped by suite.
fn plan_runs(cli: &Cli, config: &EngineConfig) -> Result<Vec<(String, Vec<ExperimentConfig>)>, ConfigError> {
    let suites = |suites: &[ExperimentSuite]| {
        suites
            .iter()
            .map(|suite| (suite.name().to_string(), suite.configurations(cli.quick)))
            .collect::<Vec<_>>()
    };

    let mut plan = if cli.run_all {
        suites(&ExperimentSuite::ALL[..])
    } else if let Some(selection) = &cli.experiment {
        if selection == "all" {
            suites(&ExperimentSuite::ALL[..])
        } else if let Ok(suite) = selection.parse::<ExperimentSuite>() {
            suites(&[suite])
        } else if let Some(experiment) = config.experiment(selection) {
            vec![(selection.clone(), vec![experiment.clone()])]
        } else if let Some(experiment) = find_configuration(selection, cli.quick) {
            vec![(selection.clone(), vec![experiment])]
        } else {
            return Err(ConfigError::UnknownExperiment(selection.clone()));
        }
    } else if !config.experiments.is_empty() {
        vec![("configured".to_string(), config.experiments.clone())]
    } else {
        Vec::new()
    };

    let direct_only = config.identities.is_empty();
    if direct_only {
        log::info!("no proxies configured, connecting directly");
    }
    for experiment in plan.iter_mut().flat_map(|(_, configs)| configs.iter_mut()) {
        if let Some(attempts) = cli.iterations {
            experiment.attempts = attempts;
        }
        if let Some(parallelism) = cli.parallelism {
            experiment.parallelism = parallelism;
        }
        if direct_only {
            experiment.rotation = RotationMode::Disabled;
        }
    }
    Ok(plan)
}

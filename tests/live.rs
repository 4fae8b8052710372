use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use blockprobe_rs::{
    EngineConfig, ExperimentConfig, ExperimentRunner, PacingPolicy, ReqwestTransport,
    RetryPolicy, RotationMode, TransportMode, VERSION,
};

/// Hits a real target directly. Override with `BLOCKPROBE_TARGET` and add a
/// proxy with `BLOCKPROBE_PROXY`.
#[tokio::test]
#[ignore = "Requires network access"]
async fn live_probe_against_target() -> Result<(), Box<dyn Error>> {
    let mut config = EngineConfig::default();
    if let Ok(target) = env::var("BLOCKPROBE_TARGET") {
        config.target = target;
    }
    if let Ok(proxy) = env::var("BLOCKPROBE_PROXY") {
        config.identities = blockprobe_rs::config::parse_proxy_list(&proxy);
    }
    config.validate()?;
    println!("blockprobe-rs {VERSION} live probe against {}", config.target);

    let pool = Arc::new(config.build_pool()?);
    let rotation = if pool.has_proxies() {
        RotationMode::Enabled
    } else {
        RotationMode::Disabled
    };
    let experiment = ExperimentConfig::new("live_smoke", 3)
        .with_pacing(PacingPolicy::Fixed { secs: 1.0 })
        .with_retry(RetryPolicy::None)
        .with_rotation(rotation);

    let mut runner = ExperimentRunner::new(config.build_classifier()?)
        .with_transport(TransportMode::Http, Arc::new(ReqwestTransport::new()))
        .with_timeout(Duration::from_secs(20));
    let result = runner.run(pool, &experiment, &config.request_spec()?).await?;

    for record in result.attempts() {
        println!(
            "#{} via {}: {} status={:?} latency={:?} signal={:?}",
            record.sequence(),
            record.identity(),
            record.verdict(),
            record.status(),
            record.latency(),
            record.signal()
        );
    }
    let summary = result.summary();
    println!(
        "success {:.0}% blocked {:.0}% transient {:.0}%",
        summary.success_rate * 100.0,
        summary.block_rate * 100.0,
        summary.transient_rate * 100.0
    );

    assert_eq!(summary.top_level_attempts, 3);
    assert_eq!(result.dispatcher_failures(), 0);
    Ok(())
}

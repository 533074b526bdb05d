//! Stepline Demo Server
//!
//! Runs a local match: one authoritative server and scripted clients over a
//! simulated lossy network. Then runs it again and checks both runs ended in
//! the same state.
//!
//! Usage: `stepline-server [match-config.json]`

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stepline::{
    network::{run_local_match, MatchConfig},
    VERSION,
};

fn load_config() -> Result<MatchConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(MatchConfig::default());
    };
    let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let config: MatchConfig = serde_json::from_str(&json).with_context(|| format!("parsing {}", path))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    info!("Stepline Server v{}", VERSION);
    info!(
        "Tick Rate: {} Hz, {} clients, {} ms",
        config.netcode.tick_rate, config.clients, config.duration_ms
    );
    info!(
        "Link: {} ms latency, {} ms jitter, {:.1}% loss",
        config.link.latency_ms,
        config.link.jitter_ms,
        config.link.loss * 100.0
    );

    info!("=== Starting Match ===");
    let report = run_local_match(config.clone()).await?;

    info!("=== Match Results ===");
    info!("Server tick: {}", report.server_tick);
    for (index, client) in report.clients.iter().enumerate() {
        let player = client
            .player_id
            .map(|id| hex::encode(&id.as_bytes()[..4]))
            .unwrap_or_else(|| "-".into());
        info!(
            "Client {} ({}): {} predicted, {} resimulations, {} replayed, {} mispredictions (max {:.4})",
            index,
            player,
            client.stats.predicted_ticks,
            client.stats.resimulations,
            client.stats.replayed_inputs,
            client.stats.mispredictions,
            client.stats.max_position_error
        );
        if let Some(error) = client.final_position_error {
            info!("Client {} final prediction error: {:.5}", index, error);
        }
    }
    info!("Final State Hash: {}", hex::encode(report.state_hash));

    // Same seed, same script: the replay must land on the same state.
    info!("=== Verifying Determinism ===");
    let replay = run_local_match(config).await?;
    info!("Replay State Hash: {}", hex::encode(replay.state_hash));

    if report.state_hash != replay.state_hash {
        bail!("determinism failure: hashes differ");
    }
    info!("DETERMINISM VERIFIED: Hashes match!");
    Ok(())
}

//! RDS Receiver service: starts the controller from the environment and
//! accepts operator commands on stdin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rds_receiver::config::{Config, EnvConfig};
use rds_receiver::console::{self, ConsoleCommand};
use rds_receiver::controller::ReceiverController;
use rds_receiver::dab;
use rds_receiver::process::SystemCommandProvider;
use rds_receiver::sink::{SinkDispatcher, TracingSink};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rds_receiver=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   RDS Receiver - RTL-SDR FM/RDS + DAB");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Device index: {}", config.device_index);
    info!("  Gain: {}", config.default_gain);
    info!("  PPM error: {}", config.ppm_error);
    info!("  Mode: {}", config.start_mode);
    info!("  Frequency: {:.1} MHz", config.start_frequency_mhz);
    info!(
        "  Band: {:.1}-{:.1} MHz, squelch {} dB",
        config.band_start_mhz, config.band_end_mhz, config.squelch_db
    );
    match dab::channel_frequency_khz(&config.dab_channel) {
        Ok(khz) => info!(
            "  DAB channel: {} ({} kHz, web port {})",
            config.dab_channel, khz, config.dab_web_port
        ),
        Err(e) => {
            let known: Vec<&str> = dab::channel_names().collect();
            warn!("  DAB channel: {} ({}). Known channels: {}", config.dab_channel, e, known.join(" "));
        }
    }

    let sink = SinkDispatcher::start(vec![Box::new(TracingSink)], config.sink_queue)
        .context("Failed to start message sinks")?;

    let controller = ReceiverController::spawn(
        Arc::new(EnvConfig),
        Arc::new(SystemCommandProvider),
        sink.clone(),
    );

    if let Err(e) = controller.start().await {
        error!("Failed to start receiver: {}", e);
        error!("Make sure the RTL-SDR is connected and the radio tools are installed.");
        controller.shutdown().await.ok();
        return Err(e).context("Receiver start failed");
    }

    if config.search_on_start {
        match controller.toggle_search().await {
            Ok(status) => info!("Band search started ({:?})", status),
            Err(e) => warn!("Could not start band search: {}", e),
        }
    }

    info!("===========================================");
    info!("  Receiving. Press Ctrl+C to stop.");
    info!("  {}", console::HELP);
    info!("===========================================");

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = input.next_line(), if input_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        input_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!("[Console] Reading stdin failed: {}", e);
                        input_open = false;
                        continue;
                    }
                };
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => match console::execute(&controller, command).await {
                        Ok(reply) => info!("[Console] {}", reply),
                        Err(e) => warn!("[Console] {}", e),
                    },
                    Err(e) => warn!("[Console] {} ({})", e, console::HELP),
                }
            }
            _ = ticker.tick() => {
                let status = controller.status();
                info!(
                    "[Status] {}{} {:.1} MHz running={} searching={} audio={} holder={:?} decoded={} malformed={} dropped={}",
                    status.mode.target(),
                    if status.mode.is_pending() { " (pending)" } else { "" },
                    status.tuning.frequency_mhz,
                    status.running,
                    status.searching,
                    status.audio_active,
                    status.device_holder,
                    status.stats.messages_decoded,
                    status.stats.malformed_lines,
                    sink.dropped()
                );
                if let Some(err) = &status.last_error {
                    warn!("[Status] Last error: {}", err);
                }
                if let Ok(json) = serde_json::to_string(&status) {
                    tracing::debug!("[Status] {}", json);
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down...");
    controller.shutdown().await?;
    info!("Shutdown complete.");
    Ok(())
}

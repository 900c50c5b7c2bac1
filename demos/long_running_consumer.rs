// ABOUTME: Long-running NSQ consumer demonstrating lookupd discovery and periodic RDY redistribution
// ABOUTME: Shows how to run a Reader for a bounded duration with clean unsubscribe/close shutdown

//! # Long-Running NSQ Consumer
//!
//! This example demonstrates a Reader that:
//!
//! * Discovers brokers through one or more `nsqlookupd` instances
//! * Periodically redistributes RDY budget across connections
//! * Logs throughput statistics on an interval
//! * Shuts down cleanly (unsubscribe -> close) on a timeout
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example long_running_consumer -- \
//!   --lookupd http://127.0.0.1:4161 \
//!   --topic events --channel stats \
//!   --run-duration 600
//! ```

use argh::FromArgs;
use nsq_client::{Reader, ReaderConfigBuilder};
use std::error::Error;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Long-running NSQ consumer with periodic stats and lookupd discovery
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// a lookupd HTTP endpoint (may be passed more than once)
    #[argh(option)]
    lookupd: Vec<String>,

    /// a seed nsqd TCP address, host:port (used when no lookupd is given)
    #[argh(option)]
    nsqd: Vec<String>,

    /// the topic to subscribe to
    #[argh(option, short = 't')]
    topic: String,

    /// the channel to subscribe as
    #[argh(option, short = 'c')]
    channel: String,

    /// max in-flight messages across all connections (default: 42)
    #[argh(option)]
    max_in_flight: Option<u32>,

    /// how long to run before shutting down, in seconds (default: 300)
    #[argh(option)]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let run_duration = Duration::from_secs(cli_args.run_duration.unwrap_or(300));

    let mut builder = ReaderConfigBuilder::new()
        .max_in_flight(cli_args.max_in_flight.unwrap_or(42))
        .redistribute_interval(Duration::from_secs(5));

    for endpoint in &cli_args.lookupd {
        builder = builder.lookupd_address(endpoint);
    }
    for addr in &cli_args.nsqd {
        let (host, port) = addr
            .split_once(':')
            .ok_or("nsqd address must be host:port")?;
        builder = builder.nsqd_address(host, port.parse()?);
    }

    let reader = Reader::new(builder.build());

    info!("connecting");
    reader.connect().await.map_err(|e| {
        warn!("connect failed: {e}");
        Box::<dyn Error>::from(e.to_string())
    })?;

    reader.subscribe(&cli_args.topic, &cli_args.channel).await.map_err(|e| {
        warn!("subscribe failed: {e}");
        Box::<dyn Error>::from(e.to_string())
    })?;
    info!(topic = %cli_args.topic, channel = %cli_args.channel, "subscribed");

    let consumer = reader.messages();
    let mut stats_timer = interval(Duration::from_secs(30));
    let mut message_count: u64 = 0;
    let start_time = std::time::Instant::now();

    info!("entering main loop, running for {:?}", run_duration);
    loop {
        tokio::select! {
            _ = sleep(run_duration.saturating_sub(start_time.elapsed())) => {
                info!("run duration elapsed, shutting down");
                break;
            }
            _ = stats_timer.tick() => {
                info!(messages = message_count, uptime_secs = start_time.elapsed().as_secs(), "throughput stats");
            }
            maybe_message = consumer.next() => {
                match maybe_message {
                    Some(message) => {
                        message_count += 1;
                        if let Err(e) = message.fin().await {
                            warn!("fin failed: {e}");
                        }
                    }
                    None => {
                        info!("reader unsubscribed, exiting main loop");
                        break;
                    }
                }
            }
        }
    }

    drop(consumer);
    reader.close().await;
    info!(total_messages = message_count, "shutdown complete");
    Ok(())
}

// ABOUTME: Example application demonstrating the simplest case of consuming a topic
// ABOUTME: Shows connect -> subscribe -> message loop -> fin using the Reader API directly

use argh::FromArgs;
use nsq_client::{IdentifyConfig, Reader, ReaderConfigBuilder};
use std::error::Error;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Example application to show the simplest case of consuming an NSQ topic
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the nsqd host to connect to directly (default: 127.0.0.1)
    #[argh(option)]
    host: Option<String>,

    /// the nsqd TCP port to connect to (default: 4150)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the topic to subscribe to
    #[argh(option, short = 't')]
    topic: String,

    /// the channel to subscribe as
    #[argh(option, short = 'c')]
    channel: String,

    /// how many messages to consume before exiting (default: runs forever)
    #[argh(option, short = 'n')]
    count: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = cli_args.port.unwrap_or(4150);

    println!("Connecting to {host}:{port}");

    let config = ReaderConfigBuilder::new()
        .nsqd_address(host, port)
        .max_in_flight(10)
        .identify(IdentifyConfig::new())
        .build();

    let reader = Reader::new(config);
    reader.connect().await.map_err(|e| {
        eprintln!("Connect failed: {e}");
        Box::<dyn Error>::from(e.to_string())
    })?;

    reader.subscribe(&cli_args.topic, &cli_args.channel).await.map_err(|e| {
        eprintln!("Subscribe failed: {e}");
        Box::<dyn Error>::from(e.to_string())
    })?;

    println!("Subscribed to {}/{}", cli_args.topic, cli_args.channel);

    let consumer = reader.messages();
    let mut seen = 0usize;
    while let Some(message) = consumer.next().await {
        println!(
            "message id={} attempts={} body={}",
            message.id_str(),
            message.attempts,
            String::from_utf8_lossy(&message.body)
        );
        message.fin().await?;

        seen += 1;
        if let Some(limit) = cli_args.count {
            if seen >= limit {
                break;
            }
        }
    }

    drop(consumer);
    reader.close().await;
    Ok(())
}

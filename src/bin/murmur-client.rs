use clap::Parser;
use murmur::client::Action;
use murmur::ConfigClient;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    #[clap(name = "addr", global = true, long, default_value = "127.0.0.1:9000")]
    server: String,

    #[clap(long, global = true, default_value = "warn", env = "MURMUR_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,

    #[clap(subcommand)]
    subcmd: Action,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let mut client = ConfigClient::connect(&cli.server).await?;
    match cli.subcmd {
        Action::Put { key, value } => {
            let entry = client.put(key, value).await?;
            info!(key = %entry.key, value = %entry.value, "successfully put config");
            println!("{}={}", entry.key, entry.value);
        }
        Action::Get { key } => {
            let entry = client.get(key).await?;
            println!("{}", entry.value);
        }
        Action::Watch {
            key,
            value,
            interval_secs,
            timeout_secs,
        } => {
            let started = Instant::now();
            loop {
                let entry = client.get(key.clone()).await?;
                if entry.value == value {
                    println!("config found! done.");
                    break;
                }
                if let Some(limit) = timeout_secs {
                    if started.elapsed() >= Duration::from_secs(limit) {
                        anyhow::bail!("{key} did not become '{value}' within {limit}s");
                    }
                }
                debug!(%key, current = %entry.value, "config not available yet");
                println!("config not available yet; trying again in {interval_secs} seconds...");
                tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            }
        }
    }

    Ok(())
}

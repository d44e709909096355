use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "drain-probe")]
#[command(about = "Probe the health endpoint of a graceful-drain server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:3000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current health status
    Status,
    /// Wait until the server reports draining or stops answering
    WaitDraining {
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 30)]
        timeout_secs: u64,

        /// Delay between polls, in milliseconds
        #[arg(short, long, default_value_t = 250)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let health = format!("{}/health", cli.url.trim_end_matches('/'));

    match cli.command {
        Commands::Status => {
            let res = client.get(&health).send().await?;
            print_response(res).await?;
        }
        Commands::WaitDraining {
            timeout_secs,
            interval_ms,
        } => {
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);
            loop {
                match client.get(&health).send().await {
                    Ok(res) if res.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                        println!("draining");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_connect() => {
                        println!("closed");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }

                if Instant::now() >= deadline {
                    eprintln!("Error: server still running after {}s", timeout_secs);
                    std::process::exit(1);
                }
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let json: Value = res.json().await?;
    println!("{} {}", status.as_u16(), serde_json::to_string_pretty(&json)?);
    Ok(())
}

// medlink: scan, pair, authenticate and message nearby devices without a network.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::{App, Commands};

#[derive(Debug, Parser)]
#[command(name = "medlink", version)]
#[command(about = "Offline device trust and messaging over a short-range radio link")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("medlink=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let app = App::open(config::load()).await?;
    match cli.command {
        Commands::Shell => shell(&app).await,
        command => app.run(command, &mut std::io::stdout()).await,
    }
}

/// Split a shell line into clap arguments. Single quotes group words; double quotes are
/// kept as typed so exchange payloads paste unchanged.
fn split_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for ch in line.chars() {
        match ch {
            '\'' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}

/// One session, many commands. Errors are printed and the loop continues.
async fn shell(app: &App) -> Result<()> {
    if let Err(e) = app.open_radio().await {
        eprintln!("radio unavailable, device commands will fail: {e:#}");
    }
    for payload in app.demo_payloads() {
        println!("simulated peer: {payload}");
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let args = split_line(&line);
        match args.first().map(String::as_str) {
            None => continue,
            Some("exit") | Some("quit") => break,
            _ => {}
        }
        let cli = match Cli::try_parse_from(std::iter::once("medlink".to_string()).chain(args)) {
            Ok(cli) => cli,
            Err(e) => {
                let _ = e.print();
                continue;
            }
        };
        if let Err(e) = app.run(cli.command, &mut std::io::stdout()).await {
            eprintln!("error: {e:#}");
        }
    }
    Ok(())
}

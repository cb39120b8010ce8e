use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_pubsub::{Client, Config};
use std::io::Write;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Connection URL (defaults to DATABASE_URL, then the PG* variables)
    #[arg(short, long)]
    url: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print notifications received on the given channels
    Listen {
        #[arg(required = true)]
        channels: Vec<String>,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Send a notification
    Notify {
        channel: String,

        #[arg(default_value = "")]
        payload: String,
    },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = if let Some(path) = &args.config {
        Config::from_file(path)?
    } else if let Some(url) = &args.url {
        Config::from_url(url)?
    } else {
        Config::from_env()?
    };
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(&config.log_level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("pg_pubsub={},pglisten={}", log_level, log_level))
        .with_writer(std::io::stderr)
        .init();

    let client = Client::connect(&config).with_context(|| {
        format!(
            "connecting to {}:{}/{}",
            config.host,
            config.port,
            config.database_name()
        )
    })?;

    match args.command {
        Command::Listen { channels, json } => {
            let pubsub = client.pubsub();
            pubsub.subscribe(&channels)?;
            info!("Listening on {}", channels.join(", "));

            let listener = pubsub.listen()?;
            let stop = listener.stop_handle();
            ctrlc::set_handler(move || {
                info!("Received interrupt, stopping listener...");
                stop.stop();
            })?;

            let stdout = std::io::stdout();
            for item in listener {
                let notification = match item {
                    Ok(notification) => notification,
                    Err(e) => {
                        error!("Listener error: {}", e);
                        return Err(e.into());
                    }
                };

                let mut out = stdout.lock();
                if json {
                    serde_json::to_writer(&mut out, &notification)?;
                    writeln!(out)?;
                } else {
                    writeln!(out, "{}", notification)?;
                }
                out.flush()?;
            }

            if let Err(e) = pubsub.unsubscribe_all() {
                warn!("UNLISTEN failed: {}", e);
            }
        }
        Command::Notify { channel, payload } => {
            client.notify(&channel, &payload)?;
            info!("Sent notification on {}", channel);
        }
    }

    for notice in client.notices() {
        warn!("Server notice: {}", notice);
    }
    client.close()?;
    Ok(())
}

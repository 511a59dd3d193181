//! langd entry point

use std::time::Duration;

use clap::Parser;

use langd::cli::{Cli, Commands, ForwardArgs, ServeArgs};
use langd::config::EngineOptions;
use langd::transport::forwarder::{Address, ExecutionMode, Forwarder, RUN_AS_SERVER_ENV};
use langd::transport::{ConnectionConfig, ListenMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("langd=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    // A child spawned by a forwarder must run the engine no matter what
    // argv looks like; the marker keeps it from re-entering CLI handling.
    if std::env::var_os(RUN_AS_SERVER_ENV).is_some() {
        let args = match Cli::try_parse() {
            Ok(Cli {
                command: Commands::Serve(args),
                ..
            }) => args,
            _ => {
                tracing::warn!("spawned backend got unexpected argv, serving on stdio");
                ServeArgs {
                    listen: "stdio".to_string(),
                    watched_file_delay_ms: 0,
                    verbose_progress: false,
                    watch: None,
                    extensions: vec![],
                }
            }
        };
        tracing::info!("running as spawned backend");
        return serve(args).await;
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Forward(args) => forward(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let options = EngineOptions {
        watched_file_delay: Duration::from_millis(args.watched_file_delay_ms),
        verbose_progress: args.verbose_progress,
        extensions: args.extensions,
    };
    let mut config = ConnectionConfig::new(options);
    config.watch_root = args.watch;

    langd::transport::run(ListenMode::parse(&args.listen), config).await?;
    Ok(())
}

async fn forward(args: ForwardArgs) -> anyhow::Result<()> {
    let mode = match (&args.backend, &args.spawn_socket) {
        (Some(backend), None) => ExecutionMode::Forwarded {
            backend: Address::parse(backend),
        },
        (None, Some(socket)) => ExecutionMode::SeparateProcess {
            socket: socket.clone(),
        },
        _ => anyhow::bail!("forward needs exactly one of --backend or --spawn-socket"),
    };
    let forwarder =
        Forwarder::new(&mode).expect("forwarded modes always build a forwarder");

    match ListenMode::parse(&args.listen) {
        ListenMode::Stdio => forwarder.relay_stdio().await?,
        ListenMode::Socket(address) => {
            let listener = address.bind().await?;
            tracing::info!(address = %address, "forwarding connections");
            let forwarder = std::sync::Arc::new(forwarder);
            loop {
                let client = listener.accept().await?;
                let forwarder = std::sync::Arc::clone(&forwarder);
                tokio::spawn(async move {
                    if let Err(e) = forwarder.relay(client).await {
                        tracing::error!("relay ended with error: {e}");
                    }
                });
            }
        }
    }
    Ok(())
}

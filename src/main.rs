//! CLI for mqbridge
//!
//! Subcommands:
//! - `serve` (default): run the HTTP front that publishes requests and waits for replies
//! - `relay`: run the responder that answers those requests
//!
//! `--in-memory` swaps RabbitMQ for the in-process broker. In that mode `serve`
//! also runs an echo relay so the service can be exercised without a broker.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mqbridge::bridge::{Bridge, BridgeOptions, PostAction};
use mqbridge::broker::amqp::AmqpConnection;
use mqbridge::broker::memory::InMemoryBroker;
use mqbridge::broker::{Destination, Publish, Subscribe};
use mqbridge::config::{PostActionKind, QueueSettings, Settings, load_config};
use mqbridge::relay::Relay;
use mqbridge::transport::http::{self, AppState};
use mqbridge::utils::logging;
use mqbridge::{Error, Result, external};

#[derive(Parser)]
#[command(name = "mqbridge", version)]
struct Cli {
    /// Use the in-process broker instead of RabbitMQ
    #[arg(long, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Start the HTTP server and the request/reply bridge
    Serve,
    /// Consume requests and publish correlated replies
    Relay,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_with_file(&settings.logging.level, &settings.logging.file_path) {
        logging::init(&settings.logging.level);
        error!("Failed to open log file {}: {}", settings.logging.file_path, e);
        return ExitCode::FAILURE;
    }

    let command = cli.command.unwrap_or(Command::Serve);
    match run(command, cli.in_memory, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mqbridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// The broker the process talks to.
enum Backend {
    Amqp(AmqpConnection),
    Memory(InMemoryBroker),
}

impl Backend {
    async fn connect(settings: &Settings, in_memory: bool) -> Result<Self> {
        if in_memory {
            info!("Using the in-memory broker");
            return Ok(Backend::Memory(InMemoryBroker::new()));
        }
        Ok(Backend::Amqp(AmqpConnection::connect(&settings.broker.url).await?))
    }

    async fn declare(&self, settings: &QueueSettings) -> Result<()> {
        match self {
            Backend::Amqp(connection) => connection.declare(settings).await,
            Backend::Memory(broker) => {
                broker.declare(settings);
                Ok(())
            }
        }
    }

    fn publisher(&self, destination: Destination) -> Arc<dyn Publish> {
        match self {
            Backend::Amqp(connection) => Arc::new(connection.publisher(destination)),
            Backend::Memory(broker) => Arc::new(broker.publisher(destination)),
        }
    }

    fn subscriber(&self, queue: &str) -> Box<dyn Subscribe> {
        match self {
            Backend::Amqp(connection) => Box::new(connection.subscriber(queue)),
            Backend::Memory(broker) => Box::new(broker.subscriber(queue)),
        }
    }

    async fn close(&self) {
        match self {
            Backend::Amqp(connection) => {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close RabbitMQ connection: {}", e);
                }
            }
            Backend::Memory(broker) => broker.close(),
        }
    }
}

async fn run(command: Command, in_memory: bool, settings: Settings) -> Result<()> {
    let backend = Backend::connect(&settings, in_memory).await?;
    let shutdown = CancellationToken::new();

    let outcome = match command {
        Command::Serve => serve(&settings, &backend, shutdown.clone()).await,
        Command::Relay => relay(&settings, &backend, shutdown.clone()).await,
    };

    // Background tasks are joined by now; only this path closes the connection.
    shutdown.cancel();
    backend.close().await;
    outcome
}

async fn serve(settings: &Settings, backend: &Backend, shutdown: CancellationToken) -> Result<()> {
    let broker = &settings.broker;
    backend.declare(&broker.producer).await?;
    backend.declare(&broker.consumer).await?;

    let mut tasks = Vec::new();
    if let Backend::Memory(_) = backend {
        let echo = Relay::new(backend.publisher(Destination::from_settings(&broker.consumer)));
        tasks.push(
            echo.start(backend.subscriber(&broker.producer.queue).as_ref(), shutdown.clone())
                .await?,
        );
    }

    let post_action = match settings.bridge.post_action {
        PostActionKind::None => PostAction::None,
        PostActionKind::CallExternal => {
            PostAction::CallExternal(external::from_settings(&settings.external)?)
        }
        PostActionKind::PublishOnward => {
            let onward = &settings.bridge.onward;
            backend.declare(onward).await?;
            PostAction::PublishOnward(backend.publisher(Destination::from_settings(onward)))
        }
    };

    let (bridge, consumer) = Bridge::start(
        backend.publisher(Destination::from_settings(&broker.producer)),
        backend.subscriber(&broker.consumer.queue).as_ref(),
        BridgeOptions::from_settings(settings),
        post_action,
        shutdown.clone(),
    )
    .await?;
    tasks.push(consumer);

    let listener = http::bind(&settings.server).await?;
    let state = AppState {
        bridge: Arc::new(bridge),
        request_format: settings.bridge.request_format,
    };
    let mut server = tokio::spawn(http::serve(listener, state, shutdown.clone()));

    let served = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            shutdown.cancel();
            server.await
        }
        res = &mut server => {
            error!("HTTP server exited unexpectedly.");
            shutdown.cancel();
            res
        }
    };

    join_all(tasks).await;
    served.map_err(|e| Error::Io(std::io::Error::other(e)))?
}

async fn relay(settings: &Settings, backend: &Backend, shutdown: CancellationToken) -> Result<()> {
    let broker = &settings.broker;
    backend.declare(&broker.producer).await?;
    backend.declare(&broker.consumer).await?;

    let mut relay = Relay::new(backend.publisher(Destination::from_settings(&broker.consumer)));
    if settings.relay.call_external {
        let routing_key = settings.relay.external_routing_key.clone();
        if let Some(key) = routing_key.as_ref().filter(|_| !broker.producer.exchange.is_empty()) {
            // Requests routed under the external key must reach the same queue.
            backend
                .declare(&QueueSettings {
                    routing_key: key.clone(),
                    ..broker.producer.clone()
                })
                .await?;
        }
        relay = relay.with_external(external::from_settings(&settings.external)?, routing_key);
    }

    let mut handle = relay
        .start(backend.subscriber(&broker.producer.queue).as_ref(), shutdown.clone())
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            shutdown.cancel();
            join_all(vec![handle]).await;
        }
        res = &mut handle => {
            if let Err(e) = res {
                error!("Relay task failed: {}", e);
            }
            warn!("Relay stopped before shutdown was requested.");
        }
    }

    Ok(())
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
}

//! archive-relay - chunked archive transfer over NATS JetStream

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use archive_relay::{
    auth::JwtValidator,
    config::Args,
    db::MongoClient,
    download::{DownloadPipeline, DownloadSettings},
    ingest::{spawn_reaper_task, IngestSettings, UploadConsumer, UploadDispatcher, UploadIngestor},
    nats::{MemoryBus, MessageBus, NatsBus, NatsClient},
    server::{self, AppState},
    services::ArchiveService,
    storage::{FsBlobStore, MongoArchiveStore, MongoSequenceTracker, Stores},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("archive_relay={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  archive-relay");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("NATS: {}", args.nats.nats_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Storage: {}", args.storage_path.display());
    info!(
        "Subjects: upload={} ack={} download={}",
        args.nats.upload_subject, args.nats.ack_subject, args.nats.download_subject
    );
    info!("======================================");

    let blobs = Arc::new(FsBlobStore::new(&args.storage_path).await?);

    // Connect to MongoDB (in-memory stores in dev mode if unreachable)
    let stores = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => Stores::new(
            Arc::new(MongoSequenceTracker::new(&client).await?),
            Arc::new(MongoArchiveStore::new(&client).await?),
            blobs,
        ),
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using in-memory stores): {}", e);
                Stores::in_memory(blobs)
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Connect to NATS (recording bus in dev mode if unreachable)
    let nats = match NatsClient::new(&args.nats, &format!("archive-relay-{}", args.node_id)).await
    {
        Ok(client) => Some(client),
        Err(e) => {
            if args.dev_mode {
                warn!("NATS connection failed (dev mode, uploads disabled): {}", e);
                None
            } else {
                error!("NATS connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let bus: Arc<dyn MessageBus> = match &nats {
        Some(client) => {
            client.ensure_stream(&args.nats).await?;
            Arc::new(NatsBus::new(client.clone()))
        }
        None => Arc::new(MemoryBus::new()),
    };

    let ingestor = Arc::new(UploadIngestor::new(
        stores.clone(),
        Arc::clone(&bus),
        IngestSettings {
            ack_subject: args.nats.ack_subject.clone(),
            order_base: args.order_base,
        },
    ));
    let dispatcher = Arc::new(UploadDispatcher::new(Arc::clone(&ingestor)));

    let consumer = nats.as_ref().map(|client| {
        let consumer = Arc::new(UploadConsumer::new(
            client.clone(),
            args.nats.clone(),
            Arc::clone(&dispatcher),
        ));
        let runner = Arc::clone(&consumer);
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("Upload consumer stopped: {}", e);
            }
        });
        consumer
    });

    spawn_reaper_task(
        Arc::clone(&dispatcher),
        args.upload_idle_timeout(),
        std::time::Duration::from_secs(args.reaper_interval_secs),
    );

    let downloads = DownloadPipeline::new(
        stores.clone(),
        bus,
        DownloadSettings {
            subject: args.nats.download_subject.clone(),
            segment_bytes: args.download_segment_bytes,
        },
    );

    let jwt = match &args.auth_public_key {
        Some(pem) => JwtValidator::from_public_key_pem(pem)?,
        None => {
            warn!("No AUTH_PUBLIC_KEY (dev mode, accepting HS256 tokens signed with the dev secret)");
            JwtValidator::new_dev()
        }
    };

    let state = Arc::new(
        AppState::new(args, ArchiveService::new(stores, downloads), jwt).with_ingestor(ingestor),
    );

    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Some(consumer) = &consumer {
        consumer.stop().await;
    }
    dispatcher.close().await;
    if let Some(client) = &nats {
        if let Err(e) = client.flush().await {
            warn!("Failed to flush NATS: {}", e);
        }
    }

    Ok(())
}

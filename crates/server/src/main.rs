//! Voice Agent Server Entry Point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use colloquy_bus::{DurableLog, DurableLogConfig, EphemeralBus, EphemeralBusConfig};
use colloquy_config::{load_settings, Settings};
use colloquy_memory::{
    DbConfig, InMemorySessionStore, MemoryConfig, SessionStore, TurnIndexConfig, TurnMemory,
    VectorDistance,
};
use colloquy_pipeline::{
    HttpSttBackend, HttpTtsBackend, ScriptedSttBackend, SilenceTtsBackend, SttBackend, SttConfig,
    TtsBackend, TtsConfig, TtsSynthesizer, VadConfig,
};
use colloquy_reason::{
    serve_brain_requests, EmbedderConfig, EventSink, HttpEmbedder, LlmConfig, OllamaBackend,
    Reasoner, ReasonerConfig,
};
use colloquy_session::{
    BrainClient, BusSessionSink, SessionDeps, SessionManager, SessionManagerConfig,
};
use colloquy_server::{create_router, init_metrics, AppState, LocalBrain};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("COLLOQUY_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {}. Using defaults.", e);
            Settings::default()
        },
    };

    init_tracing(&settings);
    tracing::info!("Starting voice agent server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?settings.environment,
        service = %settings.service_name,
        agent_id = %settings.agent_id,
        "Configuration loaded"
    );

    let metrics_handle = init_metrics();
    tracing::info!("Initialized Prometheus metrics at /metrics");

    // Ephemeral bus (request/reply fabric)
    let ephemeral = match EphemeralBus::connect(EphemeralBusConfig {
        servers: vec![settings.bus.ephemeral_url.clone()],
        service_name: settings.service_name.clone(),
        max_reconnect: settings.bus.max_reconnect,
    })
    .await
    {
        Ok(bus) => {
            tracing::info!(url = %settings.bus.ephemeral_url, "Ephemeral bus connected");
            Some(Arc::new(bus))
        },
        Err(e) => {
            tracing::warn!(error = %e, "Ephemeral bus unavailable, continuing degraded");
            None
        },
    };

    // Durable log (persistent event fabric)
    let durable = match DurableLog::connect(DurableLogConfig {
        url: settings.bus.durable_url.clone(),
        service_name: settings.service_name.clone(),
        operation_timeout: Duration::from_millis(settings.bus.durable_operation_ms),
        redeliver_max: settings.bus.redeliver_max,
        ..Default::default()
    })
    .await
    {
        Ok(log) => {
            tracing::info!(url = %settings.bus.durable_url, "Durable log connected");
            Some(Arc::new(log))
        },
        Err(e) => {
            tracing::warn!(error = %e, "Durable log unavailable, continuing degraded");
            None
        },
    };

    // Conversation memory (row store + ANN index)
    let memory = match TurnMemory::connect(MemoryConfig {
        db: DbConfig {
            hosts: settings.memory.db_hosts.clone(),
            keyspace: settings.memory.keyspace.clone(),
            replication_factor: settings.memory.replication_factor,
        },
        index: TurnIndexConfig {
            endpoint: settings.memory.qdrant_url.clone(),
            collection: settings.memory.qdrant_collection.clone(),
            vector_dim: settings.memory.embedding_dim,
            distance: VectorDistance::parse(&settings.memory.distance)
                .unwrap_or(VectorDistance::Cosine),
            api_key: settings.memory.qdrant_api_key.clone(),
        },
    })
    .await
    {
        Ok(memory) => {
            tracing::info!(
                keyspace = %settings.memory.keyspace,
                collection = %settings.memory.qdrant_collection,
                dim = settings.memory.embedding_dim,
                "Conversation memory initialized"
            );
            Some(Arc::new(memory))
        },
        Err(e) => {
            tracing::warn!(error = %e, "Conversation memory unavailable, reasoning disabled");
            None
        },
    };

    // Reasoning engine
    let reasoner = match memory {
        Some(ref memory) => {
            let llm = OllamaBackend::new(LlmConfig {
                model: settings.llm.model.clone(),
                endpoint: settings.llm.endpoint.clone(),
                max_tokens: settings.llm.max_tokens,
                temperature: settings.llm.temperature,
                ..Default::default()
            })?;
            let embedder = HttpEmbedder::new(EmbedderConfig {
                endpoint: settings
                    .llm
                    .embedding_endpoint
                    .clone()
                    .unwrap_or_else(|| settings.llm.endpoint.clone()),
                model: settings.llm.embedding_model.clone(),
                embedding_dim: settings.memory.embedding_dim,
            });
            let events: Option<Arc<dyn EventSink>> = durable
                .clone()
                .map(|log| log as Arc<dyn EventSink>);

            let reasoner = Arc::new(Reasoner::new(
                Arc::new(llm),
                Arc::new(embedder),
                memory.clone(),
                events,
                ReasonerConfig {
                    agent_id: settings.agent_id.clone(),
                    retrieval_k: settings.memory.retrieval_k,
                    reason_timeout: settings.timeouts.reason(),
                    max_tokens: settings.llm.max_tokens,
                    temperature: settings.llm.temperature,
                },
            ));
            tracing::info!(model = %settings.llm.model, "Reasoning engine ready");
            Some(reasoner)
        },
        None => None,
    };

    // Brain responder: replicas form a queue group of competing consumers
    if let (Some(bus), Some(reasoner)) = (&ephemeral, &reasoner) {
        serve_brain_requests(bus, reasoner.clone(), Some("brain"))
            .await
            .map_err(|e| anyhow::anyhow!("brain responder: {}", e))?;
        tracing::info!("Serving agent.brain.request");
    }

    // TTS synthesizer
    let tts_backend: Arc<dyn TtsBackend> = match settings.pipeline.tts_endpoint {
        Some(ref endpoint) => {
            let backend = HttpTtsBackend::new(endpoint.clone(), settings.pipeline.tts_sample_rate);
            // A configured model that cannot load is fatal
            backend
                .load()
                .await
                .map_err(|e| anyhow::anyhow!("TTS model load failed: {}", e))?;
            Arc::new(backend)
        },
        None => {
            tracing::warn!("No TTS endpoint configured, using silence backend");
            Arc::new(SilenceTtsBackend::new(settings.pipeline.tts_sample_rate))
        },
    };
    let tts = Arc::new(TtsSynthesizer::new(
        tts_backend,
        TtsConfig {
            max_concurrent: settings.pipeline.max_concurrent_tts,
            ..Default::default()
        },
    ));

    // STT backend
    let stt_backend: Arc<dyn SttBackend> = match settings.pipeline.stt_endpoint {
        Some(ref endpoint) => Arc::new(HttpSttBackend::new(endpoint.clone())),
        None => {
            tracing::warn!("No STT endpoint configured, transcripts will be empty");
            Arc::new(ScriptedSttBackend::default())
        },
    };

    // Session manager
    let store: Arc<dyn SessionStore> = match memory {
        Some(ref memory) => memory.session_store(),
        None => Arc::new(InMemorySessionStore::new()),
    };
    let brain: Arc<dyn BrainClient> = match (&ephemeral, &reasoner) {
        (Some(bus), _) => bus.clone(),
        (None, Some(reasoner)) => {
            tracing::warn!("No ephemeral bus, reasoning dispatched in-process");
            Arc::new(LocalBrain::new(reasoner.clone()))
        },
        (None, None) => anyhow::bail!("no reasoning path available (bus and memory both down)"),
    };
    let sink = Arc::new(BusSessionSink {
        ephemeral: ephemeral.clone(),
        durable: durable.clone(),
    });

    let sessions = Arc::new(SessionManager::new(
        SessionManagerConfig {
            agent_id: settings.agent_id.clone(),
            turn_deadline: settings.timeouts.turn(),
            reason_deadline: settings.timeouts.reason(),
            stt_deadline: settings.timeouts.stt(),
            tts_first_chunk_deadline: settings.timeouts.tts_first_chunk(),
            ..Default::default()
        },
        SessionDeps {
            brain,
            tts: tts.clone(),
            stt_backend,
            stt_config: SttConfig {
                vad: VadConfig {
                    energy_threshold: settings.pipeline.vad_energy_threshold,
                    hangover_ms: settings.pipeline.hangover_ms,
                },
                ..Default::default()
            },
            sink,
            store,
        },
    ));

    // Keepalive
    if let Some(ref bus) = ephemeral {
        colloquy_server::heartbeat::spawn_heartbeat(
            bus.clone(),
            sessions.clone(),
            Duration::from_secs(settings.bus.heartbeat_interval_s),
        );
    }

    let port = settings.server.port;
    let state = AppState::new(
        settings,
        reasoner,
        memory,
        tts,
        sessions.clone(),
        ephemeral.clone(),
        durable,
        metrics_handle,
    );
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain live sessions and the bus before exit
    sessions.close_all("server shutdown").await;
    if let Some(bus) = ephemeral {
        bus.close().await;
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialize tracing (with optional OpenTelemetry when feature enabled)
#[cfg(feature = "telemetry")]
fn init_tracing(settings: &Settings) {
    use opentelemetry_otlp::WithExportConfig;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("colloquy={},tower_http=info", settings.observability.log_level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let Some(otlp_endpoint) = &settings.observability.otlp_endpoint {
        if settings.observability.tracing_enabled {
            match opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(otlp_endpoint),
                )
                .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(
                    opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", "colloquy-agent"),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ]),
                ))
                .install_batch(opentelemetry_sdk::runtime::Tokio)
            {
                Ok(tracer) => {
                    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    subscriber.with(fmt_layer).with(otel_layer).init();
                    tracing::info!(endpoint = %otlp_endpoint, "OpenTelemetry tracing enabled");
                    return;
                },
                Err(e) => eprintln!("Failed to initialize OpenTelemetry: {}. Falling back.", e),
            }
        }
    }
    subscriber.with(fmt_layer).init();
}

/// Initialize tracing (console only - telemetry feature disabled)
#[cfg(not(feature = "telemetry"))]
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("colloquy={},tower_http=info", settings.observability.log_level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}

pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AppError, ErrorKind};
use crate::models::Config;
use crate::server::protocol::{
    ComponentHealth, HealthReport, MAX_FRAME_BYTES, Request, Response, decode_length,
    encode_message,
};
use crate::services::{
    Embedder, ExtractionPipeline, PipelineSettings, SearchService, create_index,
};
use crate::sources::create_source;

/// Hosts one extraction pipeline and one search service behind a Unix socket.
pub struct DaemonServer {
    socket_path: PathBuf,
    pid_path: PathBuf,
    pipeline: ExtractionPipeline,
    search: SearchService,
    started: Instant,
    requests_served: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl DaemonServer {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let embedder = Embedder::from_config(&config.embedding)?;
        info!(
            provider = embedder.provider().name(),
            model = embedder.model(),
            dimension = embedder.dimension(),
            "embedding provider ready"
        );

        let source = create_source(&config.catalog).await?;
        info!(source = source.name(), "catalog source ready");

        let index = create_index(&config, embedder.dimension()).await?;
        info!(collection = index.collection(), "vector index ready");

        let pipeline = ExtractionPipeline::new(
            source,
            embedder.clone(),
            Arc::clone(&index),
            PipelineSettings::from(&config),
        );
        let search = SearchService::new(embedder, index, config.search.clone());

        Ok(Self::with_services(&config, pipeline, search))
    }

    pub fn with_services(
        config: &Config,
        pipeline: ExtractionPipeline,
        search: SearchService,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            socket_path: config.socket_path(),
            pid_path: config.pid_path(),
            pipeline,
            search,
            started: Instant::now(),
            requests_served: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        self.write_pid_file()?;
        info!(socket = %self.socket_path.display(), "daemon listening");

        let mut shutdown = self.shutdown.subscribe();

        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            #[cfg(unix)]
            let sigterm = terminate.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!("accept error: {}", e),
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("shutdown requested");
                    break;
                }
                _ = sigterm => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let mut len_buf = [0u8; 4];

        while stream.read_exact(&mut len_buf).await.is_ok() {
            let len = decode_length(&len_buf);
            if len > MAX_FRAME_BYTES {
                warn!(len, "frame exceeds limit, closing connection");
                let response = Response::error(
                    ErrorKind::Validation,
                    format!("frame of {len} bytes exceeds {MAX_FRAME_BYTES}"),
                );
                if let Ok(encoded) = encode_message(&response) {
                    let _ = stream.write_all(&encoded).await;
                }
                break;
            }

            let mut msg_buf = vec![0u8; len];
            if stream.read_exact(&mut msg_buf).await.is_err() {
                break;
            }

            let response = match serde_json::from_slice::<Request>(&msg_buf) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => Response::error(ErrorKind::Validation, format!("invalid request: {e}")),
            };
            self.requests_served.fetch_add(1, Ordering::Relaxed);

            if let Ok(encoded) = encode_message(&response)
                && stream.write_all(&encoded).await.is_err()
            {
                break;
            }

            if matches!(response, Response::ShutdownAck) {
                break;
            }
        }
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        debug!(?request, "request");
        match request {
            Request::Ping => Response::Pong,

            Request::Shutdown => {
                self.shutdown.send_replace(true);
                Response::ShutdownAck
            }

            Request::Health => Response::Health(self.health().await),

            Request::Extract(req) => match self.pipeline.trigger(req).await {
                Ok(run) => Response::Run(run),
                Err(e) => Response::error(e.kind(), e.to_string()),
            },

            Request::Cancel { project_id } => match self.pipeline.cancel(&project_id).await {
                Ok(run) => Response::Run(run),
                Err(e) => Response::error(e.kind(), e.to_string()),
            },

            Request::RunStatus { run_id, project_id } => {
                match self
                    .pipeline
                    .status(run_id.as_deref(), project_id.as_deref())
                    .await
                {
                    Ok(run) => Response::Run(run),
                    Err(e) => Response::error(e.kind(), e.to_string()),
                }
            }

            Request::IndexStats => match self.pipeline.stats().await {
                Ok(stats) => Response::Stats(stats),
                Err(e) => Response::error(e.kind(), e.to_string()),
            },

            Request::Search(query) => match self.search.search(&query).await {
                Ok(results) => Response::Search(results),
                Err(e) => Response::error(e.kind(), e.to_string()),
            },
        }
    }

    async fn health(&self) -> HealthReport {
        let source = self.pipeline.source();
        let index = self.pipeline.index();
        let embedder = self.search.embedder();

        let components = vec![
            ComponentHealth::from_check(
                format!("catalog ({})", source.name()),
                source.health_check().await,
            ),
            ComponentHealth::from_check(
                format!("embedding ({})", embedder.provider().name()),
                embedder.provider().health_check().await,
            ),
            ComponentHealth::from_check(
                format!("index ({})", index.collection()),
                index.health_check().await,
            ),
        ];

        HealthReport {
            status: "ok".to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            components,
        }
    }

    fn write_pid_file(&self) -> Result<(), std::io::Error> {
        std::fs::write(&self.pid_path, std::process::id().to_string())
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.pid_path);
        info!("daemon stopped");
    }
}

pub async fn run_daemon(config: Config) -> Result<(), AppError> {
    let server = Arc::new(DaemonServer::new(config).await?);
    server.run().await.map_err(|e| AppError::Other(e.to_string()))?;
    Ok(())
}

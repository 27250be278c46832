use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::DaemonError;
use crate::models::{
    Config, ExtractRequest, ExtractionRun, IndexStats, SearchQuery, SearchResults,
};
use crate::server::protocol::{
    HealthReport, MAX_FRAME_BYTES, Request, Response, decode_length, encode_message,
};

pub struct DaemonClient {
    socket_path: PathBuf,
    auto_start: bool,
    config_path: Option<PathBuf>,
}

fn unexpected(response: Response) -> DaemonError {
    match response {
        Response::Error(e) => DaemonError::Remote {
            kind: e.kind,
            message: e.message,
        },
        other => DaemonError::ProtocolError(format!("unexpected response: {other:?}")),
    }
}

impl DaemonClient {
    pub fn new(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path(),
            auto_start: config.daemon.auto_start,
            config_path: None,
        }
    }

    /// Config file handed to an auto-started daemon.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.socket_path.exists()
            && std::os::unix::net::UnixStream::connect(&self.socket_path).is_ok()
    }

    pub async fn ensure_running(&self) -> Result<(), DaemonError> {
        if self.is_running() {
            return Ok(());
        }

        if !self.auto_start {
            return Err(DaemonError::NotRunning);
        }

        self.spawn_daemon()?;
        self.wait_for_ready().await
    }

    fn spawn_daemon(&self) -> Result<(), DaemonError> {
        let exe = std::env::current_exe().map_err(|e| DaemonError::SpawnError(e.to_string()))?;

        let mut command = Command::new(&exe);
        if let Some(ref path) = self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .args(["serve", "--daemon"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| DaemonError::SpawnError(e.to_string()))?;

        Ok(())
    }

    async fn wait_for_ready(&self) -> Result<(), DaemonError> {
        let max_wait = Duration::from_secs(60);
        let check_interval = Duration::from_millis(100);
        let start = std::time::Instant::now();

        while start.elapsed() < max_wait {
            if self.is_running() && self.ping().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(check_interval).await;
        }

        Err(DaemonError::Timeout)
    }

    async fn connect(&self) -> Result<UnixStream, DaemonError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| DaemonError::ConnectionFailed(e.to_string()))
    }

    async fn send_request(&self, request: Request) -> Result<Response, DaemonError> {
        let mut stream = self.connect().await?;

        let encoded =
            encode_message(&request).map_err(|e| DaemonError::ProtocolError(e.to_string()))?;

        stream
            .write_all(&encoded)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        let len = decode_length(&len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(DaemonError::ProtocolError(format!(
                "response frame of {len} bytes exceeds limit"
            )));
        }
        let mut msg_buf = vec![0u8; len];

        stream
            .read_exact(&mut msg_buf)
            .await
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;

        serde_json::from_slice(&msg_buf).map_err(|e| DaemonError::ProtocolError(e.to_string()))
    }

    /// Start the daemon if needed, then send.
    async fn call(&self, request: Request) -> Result<Response, DaemonError> {
        self.ensure_running().await?;
        self.send_request(request).await
    }

    pub async fn ping(&self) -> Result<(), DaemonError> {
        match self.send_request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health(&self) -> Result<HealthReport, DaemonError> {
        match self.send_request(Request::Health).await? {
            Response::Health(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        match self.send_request(Request::Shutdown).await? {
            Response::ShutdownAck => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn extract(&self, request: ExtractRequest) -> Result<ExtractionRun, DaemonError> {
        match self.call(Request::Extract(request)).await? {
            Response::Run(run) => Ok(run),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, project_id: &str) -> Result<ExtractionRun, DaemonError> {
        let request = Request::Cancel {
            project_id: project_id.to_string(),
        };
        match self.call(request).await? {
            Response::Run(run) => Ok(run),
            other => Err(unexpected(other)),
        }
    }

    pub async fn run_status(
        &self,
        run_id: Option<String>,
        project_id: Option<String>,
    ) -> Result<ExtractionRun, DaemonError> {
        match self.call(Request::RunStatus { run_id, project_id }).await? {
            Response::Run(run) => Ok(run),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stats(&self) -> Result<IndexStats, DaemonError> {
        match self.call(Request::IndexStats).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn search(&self, query: SearchQuery) -> Result<SearchResults, DaemonError> {
        match self.call(Request::Search(query)).await? {
            Response::Search(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }
}

pub fn stop_daemon(config: &Config) -> Result<(), DaemonError> {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return Err(DaemonError::NotRunning);
    }

    let pid_str = std::fs::read_to_string(&pid_path)?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .map_err(|_| DaemonError::ProtocolError("invalid pid file".to_string()))?;

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| DaemonError::SocketError(e.to_string()))?;
    }

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(config.socket_path());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::server::protocol::ErrorResponse;

    #[test]
    fn test_remote_errors_keep_kind() {
        let err = unexpected(Response::Error(ErrorResponse {
            kind: ErrorKind::NotFound,
            message: "run not found: abc".to_string(),
        }));
        assert!(matches!(
            err,
            DaemonError::Remote {
                kind: ErrorKind::NotFound,
                ..
            }
        ));

        assert!(matches!(
            unexpected(Response::Pong),
            DaemonError::ProtocolError(_)
        ));
    }

    #[tokio::test]
    async fn test_not_running_without_auto_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.auto_start = false;
        config.daemon.socket_path = Some(dir.path().join("missing.sock"));

        let client = DaemonClient::new(&config);
        assert!(!client.is_running());
        assert!(matches!(
            client.stats().await,
            Err(DaemonError::NotRunning)
        ));
    }
}

//! In-process kubelet stand-in for tests.

use crate::registration::connect_unix;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use vfiodp_api::v1beta1::device_plugin_client::DevicePluginClient;
use vfiodp_api::v1beta1::registration_server::{Registration, RegistrationServer};
use vfiodp_api::v1beta1::{Empty, RegisterRequest};

#[derive(Clone, Default)]
struct RecordingRegistration {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Serves the Registration service on a Unix socket and records every request.
pub struct FakeKubelet {
    socket: PathBuf,
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeKubelet {
    pub async fn start(socket: &Path) -> Self {
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        let service = RecordingRegistration::default();
        let requests = service.requests.clone();
        let (shutdown, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self { socket: socket.to_path_buf(), requests, shutdown: Some(shutdown) }
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait until at least `count` registrations arrived.
    pub async fn wait_for_registrations(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.requests().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests().len() >= count
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// Dial a plugin socket the way the kubelet does.
pub async fn plugin_client(socket: &Path) -> DevicePluginClient<tonic::transport::Channel> {
    DevicePluginClient::new(connect_unix(socket, Duration::from_secs(2)).await.unwrap())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

//! Registration with the kubelet over its Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{info, warn};
use vfiodp_api::v1beta1::registration_client::RegistrationClient;
use vfiodp_api::v1beta1::{DevicePluginOptions, RegisterRequest};
use vfiodp_core::observability::metrics;
use vfiodp_core::{DevicePluginError, Result};

/// How hard `Start()` tries to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// One attempt, connect and RPC bounded by the connection timeout
    Bounded,
    /// Retry on a fixed interval until registered or stopped
    UntilRegistered,
}

/// Open a gRPC channel over a Unix socket, failing after `timeout`.
///
/// The URI is a placeholder; tonic requires one but the connector ignores it.
pub async fn connect_unix(path: &Path, timeout: Duration) -> Result<Channel> {
    let socket_path = path.to_path_buf();
    let endpoint = Endpoint::try_from("http://[::]:50051")
        .map_err(DevicePluginError::internal)?
        .connect_timeout(timeout);

    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        UnixStream::connect(socket_path.clone())
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(DevicePluginError::ConnectFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Err(_) => Err(DevicePluginError::ConnectTimeout { path: path.to_path_buf(), timeout }),
    }
}

/// Options this plugin declares to the kubelet.
pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions { pre_start_required: true, get_preferred_allocation_available: false }
}

/// Announces one plugin socket to the kubelet.
#[derive(Debug, Clone)]
pub struct Registrar {
    kubelet_socket: PathBuf,
    endpoint: String,
    resource_name: String,
    timeout: Duration,
    retry_interval: Duration,
}

impl Registrar {
    pub fn new(
        kubelet_socket: impl Into<PathBuf>,
        plugin_socket: &Path,
        resource_name: impl Into<String>,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        // The kubelet resolves the endpoint relative to its plugin directory
        let endpoint = plugin_socket
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            kubelet_socket: kubelet_socket.into(),
            endpoint,
            resource_name: resource_name.into(),
            timeout,
            retry_interval,
        }
    }

    pub fn request(&self) -> RegisterRequest {
        RegisterRequest {
            version: vfiodp_api::VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(plugin_options()),
        }
    }

    /// Register according to `policy`.
    ///
    /// Returns `Ok(false)` when `stop` fired before registration succeeded.
    pub async fn register(
        &self,
        policy: RegistrationPolicy,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        match policy {
            RegistrationPolicy::Bounded => self.register_once().await.map(|_| true),
            RegistrationPolicy::UntilRegistered => self.register_until_success(stop).await,
        }
    }

    async fn register_until_success(&self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        loop {
            if *stop.borrow() {
                return Ok(false);
            }

            match self.register_once().await {
                Ok(()) => return Ok(true),
                Err(e) => warn!(
                    resource = %self.resource_name,
                    error = %e,
                    retry_in = ?self.retry_interval,
                    "Registration failed, retrying"
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// One connect + Register call, bounded as a whole by the timeout.
    pub async fn register_once(&self) -> Result<()> {
        let attempt = async {
            let channel = connect_unix(&self.kubelet_socket, self.timeout).await?;
            RegistrationClient::new(channel).register(self.request()).await.map_err(|status| {
                DevicePluginError::RegistrationFailed {
                    resource_name: self.resource_name.clone(),
                    reason: status.message().to_string(),
                }
            })?;
            Ok(())
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DevicePluginError::ConnectTimeout {
                path: self.kubelet_socket.clone(),
                timeout: self.timeout,
            }),
        };

        metrics::record_registration(&self.resource_name, result.is_ok());
        if result.is_ok() {
            info!(
                resource = %self.resource_name,
                endpoint = %self.endpoint,
                "Registered device plugin with kubelet"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKubelet;
    use tempfile::TempDir;

    fn registrar(dir: &Path, retry: Duration) -> Registrar {
        Registrar::new(
            dir.join("kubelet.sock"),
            &dir.join("pci-intel.com-gaudi.sock"),
            "intel.com/gaudi",
            Duration::from_millis(500),
            retry,
        )
    }

    #[test]
    fn test_request_uses_socket_basename() {
        let request = registrar(Path::new("/var/lib/kubelet/device-plugins"), Duration::ZERO)
            .request();
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "pci-intel.com-gaudi.sock");
        assert_eq!(request.resource_name, "intel.com/gaudi");
        assert!(request.options.unwrap().pre_start_required);
    }

    #[tokio::test]
    async fn test_bounded_registration_reaches_kubelet() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::start(&dir.path().join("kubelet.sock")).await;
        let (_tx, mut stop) = watch::channel(false);

        let registered = registrar(dir.path(), Duration::from_millis(50))
            .register(RegistrationPolicy::Bounded, &mut stop)
            .await
            .unwrap();

        assert!(registered);
        let requests = kubelet.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resource_name, "intel.com/gaudi");
    }

    #[tokio::test]
    async fn test_bounded_registration_fails_without_kubelet() {
        let dir = TempDir::new().unwrap();
        let (_tx, mut stop) = watch::channel(false);

        let result = registrar(dir.path(), Duration::from_millis(50))
            .register(RegistrationPolicy::Bounded, &mut stop)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_until_registered_waits_for_kubelet() {
        let dir = TempDir::new().unwrap();
        let (_tx, mut stop) = watch::channel(false);
        let registrar = registrar(dir.path(), Duration::from_millis(50));

        let socket = dir.path().join("kubelet.sock");
        let kubelet = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            FakeKubelet::start(&socket).await
        });

        let registered =
            registrar.register(RegistrationPolicy::UntilRegistered, &mut stop).await.unwrap();
        assert!(registered);
        assert_eq!(kubelet.await.unwrap().requests().len(), 1);
    }

    #[tokio::test]
    async fn test_until_registered_observes_stop() {
        let dir = TempDir::new().unwrap();
        let (tx, mut stop) = watch::channel(false);
        let registrar = registrar(dir.path(), Duration::from_millis(50));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(true);
        });

        let registered =
            registrar.register(RegistrationPolicy::UntilRegistered, &mut stop).await.unwrap();
        assert!(!registered);
    }
}

//! Kubelet device plugin server for one resource.
//!
//! # Lifecycle
//!
//! ```text
//! start()
//!   ├── remove stale socket, bind, spawn gRPC server
//!   ├── wait until the socket accepts connections
//!   ├── register with the kubelet (Bounded | UntilRegistered)
//!   ├── health monitor setup, session Running
//!   └── wait: server exit | monitor exit (stop signal, kubelet restart)
//! stop_serving()  (close-once)
//!   ├── publish Stop/Done to ListAndWatch streams
//!   ├── wait ≤1s for the final empty list
//!   ├── shut the server down, remove the socket
//!   └── session Stopped
//! ```
//!
//! The registry sits behind one async mutex. Health changes are applied and
//! published in the same critical section, and streams send snapshots while
//! holding it.

mod session;


pub use session::{Phase, PluginEvent, Session};

use crate::monitor::{HealthMonitor, MonitorExit};
use crate::proto_convert;
use crate::registration::{self, RegistrationPolicy, Registrar};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};
use vfiodp_api::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use vfiodp_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse,
    ContainerPreferredAllocationResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse,
};
use vfiodp_core::observability::metrics;
use vfiodp_core::paths::VFIO_CONTROL_NODE;
use vfiodp_core::{
    BackoffLadder, Config, DeviceHealth, DevicePluginError, DeviceRegistry, DeviceResetter,
    HostPaths, PciDevice, PciScanner, PciSelector, ResourceConfig, Result, WatcherFactory,
};

/// How long stopping waits for `ListAndWatch` to send its final empty list.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

/// How long stopping waits for the gRPC server task before aborting it.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Responses buffered per `ListAndWatch` stream.
const STREAM_BUFFER: usize = 16;

/// Reset every known device on PreStartContainer when set to "true".
pub const TEST_MODE_ENV: &str = "TEST_MODE";

type ServeResult = std::result::Result<(), tonic::transport::Error>;

/// Why a `start()` call returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The process stop signal fired
    Stopped,
    /// The gRPC server ended on its own
    ServerExited,
    /// The plugin socket was deleted; devices were rediscovered
    NodeAgentRestarted,
}

impl ServeExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeExit::Stopped => "stopped",
            ServeExit::ServerExited => "server_exited",
            ServeExit::NodeAgentRestarted => "node_agent_restarted",
        }
    }
}

/// Everything one plugin instance needs to know about its resource.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub resource_name: String,
    pub selector: PciSelector,
    pub socket_path: PathBuf,
    pub paths: HostPaths,
    pub passthrough_driver: String,
    pub connection_timeout: Duration,
    pub registration_retry: Duration,
    pub backoff: BackoffLadder,
}

impl PluginSettings {
    pub fn from_config(config: &Config, resource: &ResourceConfig) -> Result<Self> {
        Ok(Self {
            resource_name: resource.resource_name.clone(),
            selector: resource.parsed_selector()?,
            socket_path: config
                .paths
                .plugin_socket_path(&config.socket_prefix, &resource.resource_name),
            paths: config.paths.clone(),
            passthrough_driver: config.passthrough_driver.clone(),
            connection_timeout: config.connection_timeout(),
            registration_retry: config.registration_retry(),
            backoff: config.backoff(),
        })
    }
}

/// Advertises the devices matching one selector as one kubelet resource.
pub struct PciDevicePlugin {
    settings: PluginSettings,
    scanner: PciScanner,
    resetter: DeviceResetter,
    registrar: Registrar,
    watchers: Arc<dyn WatcherFactory>,
    registry: Arc<Mutex<DeviceRegistry>>,
    session: StdMutex<Option<Arc<Session>>>,
    initialized: AtomicBool,
}

impl PciDevicePlugin {
    pub fn new(
        settings: PluginSettings,
        watchers: Arc<dyn WatcherFactory>,
        devices: &[PciDevice],
    ) -> Self {
        let pci_devices = settings.paths.pci_devices();
        let registrar = Registrar::new(
            settings.paths.kubelet_socket_path(),
            &settings.socket_path,
            settings.resource_name.clone(),
            settings.connection_timeout,
            settings.registration_retry,
        );

        Self {
            scanner: PciScanner::new(&pci_devices, settings.passthrough_driver.clone()),
            resetter: DeviceResetter::new(pci_devices),
            registrar,
            watchers,
            registry: Arc::new(Mutex::new(DeviceRegistry::new(devices))),
            session: StdMutex::new(None),
            initialized: AtomicBool::new(false),
            settings,
        }
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    pub fn resource_name(&self) -> &str {
        &self.settings.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.settings.socket_path
    }

    pub fn scanner(&self) -> &PciScanner {
        &self.scanner
    }

    pub fn watchers(&self) -> &dyn WatcherFactory {
        self.watchers.as_ref()
    }

    /// True while a session is registered and monitored.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn install_session(&self, session: Arc<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Ids currently advertised, in advertisement order.
    pub async fn device_ids(&self) -> Vec<String> {
        self.registry.lock().await.devices().iter().map(|d| d.id.clone()).collect()
    }

    pub async fn health_of(&self, id: &str) -> Option<DeviceHealth> {
        self.registry.lock().await.devices().iter().find(|d| d.id == id).map(|d| d.health)
    }

    /// Set a device's health and notify streams if it changed.
    pub async fn update_health(&self, id: &str, health: DeviceHealth) -> bool {
        let mut registry = self.registry.lock().await;
        if !registry.set_health(id, health) {
            return false;
        }

        info!(resource = %self.settings.resource_name, device = %id, %health, "Device health changed");
        if let Some(session) = self.current_session() {
            session.publish(PluginEvent::DeviceHealthChanged { id: id.to_string(), health });
        }
        true
    }

    /// Rebuild the registry from a fresh discovery.
    pub async fn replace_devices(&self, devices: &[PciDevice]) {
        let mut registry = self.registry.lock().await;
        registry.replace(devices);
        metrics::set_devices_advertised(&self.settings.resource_name, registry.len());
        info!(resource = %self.settings.resource_name, count = registry.len(), "Device list rebuilt");
    }

    /// Remove the plugin socket if present.
    fn cleanup_socket(&self) -> Result<()> {
        match std::fs::remove_file(&self.settings.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DevicePluginError::io(self.settings.socket_path.clone(), e)),
        }
    }

    /// Serve, register and monitor until the session ends.
    ///
    /// Never retries internally; the caller decides whether to start again.
    pub async fn start(
        self: &Arc<Self>,
        policy: RegistrationPolicy,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ServeExit> {
        let session = Arc::new(Session::new());
        self.install_session(session.clone());

        self.cleanup_socket()?;
        let listener = UnixListener::bind(&self.settings.socket_path).map_err(|source| {
            DevicePluginError::SocketBind { path: self.settings.socket_path.clone(), source }
        })?;
        info!(
            resource = %self.settings.resource_name,
            socket = %self.settings.socket_path.display(),
            "Starting device plugin server"
        );

        let (serve_tx, mut serve_rx) = oneshot::channel();
        let service = DevicePluginServer::from_arc(self.clone());
        let shutdown = session.clone();
        let server = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.finished().await
                })
                .await;
            let _ = serve_tx.send(result);
        });
        let server_abort = server.abort_handle();

        let exit = self.run_session(&session, policy, &mut stop, &mut serve_rx).await;

        let process_stop = *stop.borrow();
        self.stop_serving(process_stop).await;
        if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server).await.is_err() {
            warn!(resource = %self.settings.resource_name, "gRPC server did not shut down, aborting");
            server_abort.abort();
        }

        match &exit {
            Ok(reason) => {
                info!(resource = %self.settings.resource_name, reason = reason.as_str(), "Session ended")
            }
            Err(e) => error!(resource = %self.settings.resource_name, error = %e, "Session failed"),
        }
        exit
    }

    async fn run_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
        policy: RegistrationPolicy,
        stop: &mut watch::Receiver<bool>,
        serve_rx: &mut oneshot::Receiver<ServeResult>,
    ) -> Result<ServeExit> {
        registration::connect_unix(&self.settings.socket_path, self.settings.connection_timeout)
            .await?;

        if !self.registrar.register(policy, stop).await? {
            return Ok(ServeExit::Stopped);
        }

        let monitor = HealthMonitor::setup(self.clone(), session.clone(), stop.clone()).await?;
        // Running before the monitor sees its first event
        session.mark_running();
        self.initialized.store(true, Ordering::SeqCst);
        let mut monitor = tokio::spawn(monitor.run());
        let advertised = self.registry.lock().await.len();
        metrics::set_devices_advertised(&self.settings.resource_name, advertised);
        info!(resource = %self.settings.resource_name, devices = advertised, "Device plugin running");

        tokio::select! {
            served = &mut *serve_rx => {
                self.stop_serving(false).await;
                // The monitor may have torn the session down for a kubelet restart
                if let Ok(Ok(MonitorExit::NodeAgentRestarted)) = monitor.await {
                    return Ok(ServeExit::NodeAgentRestarted);
                }
                match served {
                    Ok(Ok(())) => Ok(ServeExit::ServerExited),
                    Ok(Err(e)) => Err(DevicePluginError::ServeFailed {
                        resource_name: self.settings.resource_name.clone(),
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(DevicePluginError::ServeFailed {
                        resource_name: self.settings.resource_name.clone(),
                        reason: "server task ended without a result".to_string(),
                    }),
                }
            }
            monitored = &mut monitor => match monitored {
                Ok(Ok(MonitorExit::Stopped)) => Ok(ServeExit::Stopped),
                Ok(Ok(MonitorExit::NodeAgentRestarted)) => Ok(ServeExit::NodeAgentRestarted),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(DevicePluginError::internal(e)),
            },
        }
    }

    /// Tear the current session down. Safe to call any number of times.
    pub async fn stop_serving(&self, process_stop: bool) {
        let Some(session) = self.current_session() else {
            return;
        };
        if !session.close() {
            return;
        }

        let streams = session.stream_count();
        session.publish(if process_stop { PluginEvent::Stop } else { PluginEvent::Done });
        if streams > 0 && !session.wait_deregistered(DEREGISTER_TIMEOUT).await {
            warn!(resource = %self.settings.resource_name, "ListAndWatch did not finish in time");
        }

        session.signal_done();
        self.initialized.store(false, Ordering::SeqCst);
        if let Err(e) = self.cleanup_socket() {
            warn!(resource = %self.settings.resource_name, error = %e, "Failed to remove plugin socket");
        }
        info!(resource = %self.settings.resource_name, "Stopped serving");
    }
}

fn test_mode() -> bool {
    std::env::var(TEST_MODE_ENV).map(|v| v.trim().eq_ignore_ascii_case("true")).unwrap_or(false)
}

async fn send_devices(
    tx: &mpsc::Sender<std::result::Result<ListAndWatchResponse, Status>>,
    registry: Option<&DeviceRegistry>,
) -> bool {
    let devices = registry.map(|r| proto_convert::devices(r.devices())).unwrap_or_default();
    tx.send(Ok(ListAndWatchResponse { devices })).await.is_ok()
}

/// Body of one `ListAndWatch` stream. The first and last message are always
/// empty lists.
async fn stream_devices(
    registry: Arc<Mutex<DeviceRegistry>>,
    session: Arc<Session>,
    mut events: broadcast::Receiver<PluginEvent>,
    tx: mpsc::Sender<std::result::Result<ListAndWatchResponse, Status>>,
) {
    let mut open = send_devices(&tx, None).await;
    if open {
        let registry = registry.lock().await;
        open = send_devices(&tx, Some(&*registry)).await;
    }

    while open && !session.is_stopped() {
        match events.recv().await {
            Ok(PluginEvent::DeviceHealthChanged { .. }) | Err(RecvError::Lagged(_)) => {
                let registry = registry.lock().await;
                open = send_devices(&tx, Some(&*registry)).await;
            }
            Ok(PluginEvent::Stop | PluginEvent::Done) | Err(RecvError::Closed) => break,
        }
    }

    let _ = send_devices(&tx, None).await;
    session.mark_deregistered();
    debug!("ListAndWatch stream finished");
}

#[tonic::async_trait]
impl DevicePlugin for PciDevicePlugin {
    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ListAndWatchResponse, Status>> + Send>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(registration::plugin_options()))
    }

    #[instrument(skip_all, fields(resource = %self.settings.resource_name))]
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("gRPC: ListAndWatch");

        let session =
            self.current_session().ok_or_else(|| Status::unavailable("plugin is not serving"))?;
        // Subscribe before anything is sent so no event can slip in between
        let events = session.subscribe();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(stream_devices(self.registry.clone(), session, events, tx));

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListAndWatchStream))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        let containers = request.into_inner().container_requests.len();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![ContainerPreferredAllocationResponse::default(); containers],
        }))
    }

    #[instrument(skip_all, fields(resource = %self.settings.resource_name))]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        info!(containers = request.container_requests.len(), "gRPC: Allocate");

        let env_name = proto_convert::resource_env_name(&self.settings.resource_name);
        let vfio_dir = &self.settings.paths.vfio_dev_dir;
        let control = proto_convert::vfio_device_spec(&vfio_dir.join(VFIO_CONTROL_NODE));
        let registry = self.registry.lock().await;

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                let mut devices = vec![control.clone()];
                let mut addresses = Vec::new();

                for id in &container.devices_ids {
                    match registry.resolve(id) {
                        Some(address) => {
                            devices.push(proto_convert::vfio_device_spec(&vfio_dir.join(id)));
                            addresses.push(address.to_string());
                        }
                        None => warn!(device = %id, "Allocate requested unknown device, skipping"),
                    }
                }

                debug!(env = %env_name, addresses = ?addresses, "Container allocation");
                ContainerAllocateResponse {
                    envs: HashMap::from([(env_name.clone(), addresses.join(","))]),
                    devices,
                    ..Default::default()
                }
            })
            .collect();

        Ok(Response::new(AllocateResponse { container_responses }))
    }

    #[instrument(skip_all, fields(resource = %self.settings.resource_name))]
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        let ids = request.into_inner().devices_ids;
        info!(devices = ?ids, "gRPC: PreStartContainer");

        let addresses = {
            let registry = self.registry.lock().await;
            if test_mode() {
                info!("TEST_MODE set, resetting every known device");
                registry.pci_addresses()
            } else {
                let mut addresses: Vec<String> = Vec::with_capacity(ids.len());
                for id in &ids {
                    match registry.resolve(id) {
                        Some(address) if !addresses.iter().any(|a| a == address) => {
                            addresses.push(address.to_string())
                        }
                        Some(_) => {}
                        None => warn!(device = %id, "PreStartContainer for unknown device, skipping"),
                    }
                }
                addresses
            }
        };

        for address in &addresses {
            if let Err(e) = self.resetter.reset(address) {
                metrics::record_reset(false);
                error!(address = %address, error = %e, "Device reset failed");
                return Err(Status::internal(e.to_string()));
            }
            metrics::record_reset(true);
            info!(address = %address, "Device reset");
        }

        Ok(Response::new(PreStartContainerResponse {}))
    }
}

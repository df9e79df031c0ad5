//! Docker Engine API runtime.
//!
//! Talks to the Docker daemon over its unix socket. Each slot becomes one
//! container running the proxy image, with the VPN endpoint and credentials
//! passed as environment and the container's proxy port published on the
//! slot's host port.
//!
//! Reference: https://docs.docker.com/reference/api/engine/

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use hyper::{body::Bytes, Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use vpnpool_reconcile::{ContainerState, ObservedContainer, PoolLayout, Slot};

use super::{ContainerRuntime, RuntimeError};
use crate::config::{ContainerTemplate, Credentials};

/// Device node the VPN client needs inside the container.
const TUN_DEVICE: &str = "/dev/net/tun";

/// Docker runtime for the proxy pool.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
    layout: PoolLayout,
    template: ContainerTemplate,
    credentials: Credentials,
}

impl DockerRuntime {
    /// Create a new runtime for the given Docker socket.
    pub fn new<P: AsRef<Path>>(
        socket_path: P,
        layout: PoolLayout,
        template: ContainerTemplate,
        credentials: Credentials,
    ) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
            layout,
            template,
            credentials,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    fn create_body(&self, slot: &Slot) -> CreateContainerBody {
        create_body(&self.template, &self.credentials, slot)
    }

    /// Perform a request and collect the response body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, bytes))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_managed(&self) -> Result<Vec<ObservedContainer>, RuntimeError> {
        let (status, body) = self
            .send(Method::GET, "/containers/json?all=true", None)
            .await?;

        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        let summaries: Vec<ContainerSummary> = serde_json::from_slice(&body)?;
        Ok(managed_containers(&self.layout, summaries))
    }

    async fn create(&self, index: usize, endpoint: &str) -> Result<Slot, RuntimeError> {
        let slot = Slot::desired(&self.layout, index, endpoint);
        let body = serde_json::to_vec(&self.create_body(&slot))?;
        let path = format!("/containers/create?name={}", slot.name);

        let (status, response) = self.send(Method::POST, &path, Some(body)).await?;
        if !status.is_success() {
            let message = error_message(&response);
            error!(
                name = %slot.name,
                status = %status,
                message = %message,
                "Docker rejected container spec"
            );
            return Err(RuntimeError::Creation { index, message });
        }

        let created: CreateContainerResponse = serde_json::from_slice(&response)?;
        for warning in created.warnings.unwrap_or_default() {
            warn!(name = %slot.name, warning = %warning, "Docker create warning");
        }

        if let Err(e) = self.start(&created.id).await {
            warn!(
                name = %slot.name,
                container_id = %created.id,
                error = %e,
                "Container created but failed to start, removing it"
            );
            if let Err(remove_err) = self.remove(&created.id, true).await {
                warn!(
                    container_id = %created.id,
                    error = %remove_err,
                    "Failed to remove unstarted container"
                );
            }
            return Err(RuntimeError::Creation {
                index,
                message: e.to_string(),
            });
        }

        info!(
            name = %slot.name,
            container_id = %created.id,
            port = slot.port,
            endpoint = %slot.endpoint,
            "Container started"
        );
        Ok(slot.realized(created.id))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}/start");
        let (status, body) = self.send(Method::POST, &path, None).await?;

        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_MODIFIED {
            debug!(container_id = id, "Container already started");
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(RuntimeError::NotFound(id.to_string()))
        } else {
            Err(api_error(status, &body))
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}/stop");
        let (status, body) = self.send(Method::POST, &path, None).await?;

        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_MODIFIED || status == StatusCode::NOT_FOUND {
            debug!(container_id = id, status = %status, "Container already stopped");
            Ok(())
        } else {
            Err(api_error(status, &body))
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}?force={force}");
        let (status, body) = self.send(Method::DELETE, &path, None).await?;

        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            debug!(container_id = id, "Container already removed");
            Ok(())
        } else {
            Err(api_error(status, &body))
        }
    }
}

/// Entry of `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
}

/// Response of `POST /containers/create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerBody {
    image: String,
    env: Vec<String>,
    exposed_ports: BTreeMap<String, EmptyObject>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
struct EmptyObject {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    cap_add: Vec<String>,
    devices: Vec<DeviceMapping>,
    port_bindings: BTreeMap<String, Vec<PortBinding>>,
    restart_policy: RestartPolicy,
    dns: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceMapping {
    path_on_host: String,
    path_in_container: String,
    cgroup_permissions: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RestartPolicy {
    name: String,
}

fn create_body(
    template: &ContainerTemplate,
    credentials: &Credentials,
    slot: &Slot,
) -> CreateContainerBody {
    let container_port = format!("{}/tcp", template.proxy_port);

    CreateContainerBody {
        image: template.image.clone(),
        env: vec![
            format!("USERNAME={}", credentials.username),
            format!("PASSWORD={}", credentials.password),
            format!("SERVER={}", slot.endpoint),
        ],
        exposed_ports: BTreeMap::from([(container_port.clone(), EmptyObject {})]),
        host_config: HostConfig {
            cap_add: vec!["NET_ADMIN".to_string()],
            devices: vec![DeviceMapping {
                path_on_host: TUN_DEVICE.to_string(),
                path_in_container: TUN_DEVICE.to_string(),
                cgroup_permissions: "rwm".to_string(),
            }],
            port_bindings: BTreeMap::from([(
                container_port,
                vec![PortBinding {
                    host_port: slot.port.to_string(),
                }],
            )]),
            restart_policy: RestartPolicy {
                name: template.restart_policy.clone(),
            },
            dns: template.dns.clone(),
        },
    }
}

fn managed_containers(
    layout: &PoolLayout,
    summaries: Vec<ContainerSummary>,
) -> Vec<ObservedContainer> {
    summaries
        .into_iter()
        .filter_map(|summary| {
            let name = summary.names.iter().find(|n| layout.is_managed(n))?.clone();
            Some(ObservedContainer::new(
                summary.id,
                name,
                ContainerState::parse(&summary.state),
            ))
        })
        .collect()
}

/// Docker error bodies are `{"message": "..."}`; fall back to the raw text.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> RuntimeError {
    RuntimeError::Api {
        status: status.as_u16(),
        message: error_message(body),
    }
}

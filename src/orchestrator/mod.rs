//! Typed façade over the container-orchestrator API (C2, §4.2 of the
//! external-interfaces section): list nodes/pods, create/delete workload
//! objects, stream logs, exec, port-forward, describe job status.
//!
//! The real orchestrator (a Kubernetes-alike cluster) is an external
//! collaborator per §1. `DockerOrchestrator` backs the trait for this
//! repository using the teacher's `bollard`-based container management as
//! the concrete stand-in: containers play the role of pods, container
//! labels play the role of node selectors and pod labels. A `kube`-backed
//! implementation is a drop-in extension point behind the same trait.

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;

/// GPU-type-labeled, allocatable-tracked compute node (§4.5's
/// node-by-label enumeration).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub allocatable_gpus: i32,
    pub ready: bool,
    pub schedulable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub node_name: Option<String>,
    pub namespace: String,
    pub gpu_request: i32,
    pub phase: PodPhase,
}

#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub gpu_count: i32,
    pub cpu_millis: i64,
    pub memory_mb: i64,
    pub node_selector: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub volume_name: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WorkloadStatus {
    pub ready: bool,
    pub node_ip: Option<String>,
    pub node_port: Option<i32>,
    pub phase: PodPhase,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient orchestrator error: {0}")]
    Transient(String),
    #[error("permanent orchestrator error: {0}")]
    Permanent(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<OrchestratorError> for crate::CoreError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::NotFound(m) => {
                crate::CoreError::OrchestratorPermanent(format!("not found: {m}"))
            }
            OrchestratorError::Transient(m) => crate::CoreError::OrchestratorTransient(m),
            OrchestratorError::Permanent(m) => crate::CoreError::OrchestratorPermanent(m),
        }
    }
}

/// Required calls (§6): list nodes by label, describe node
/// allocatable/conditions, list pods scoped by node or namespace,
/// create/delete workload with GPU/CPU/memory requests and node selector,
/// stream logs (bounded), exec, port-forward, describe job status.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn list_nodes_by_label(&self, label_key: &str, label_value: &str) -> OrchestratorResult<Vec<NodeInfo>>;

    async fn describe_node(&self, name: &str) -> OrchestratorResult<NodeInfo>;

    async fn list_pods_by_node(&self, node_name: &str) -> OrchestratorResult<Vec<PodInfo>>;

    async fn list_pods_by_namespace(&self, namespace: &str) -> OrchestratorResult<Vec<PodInfo>>;

    async fn create_workload(&self, spec: WorkloadSpec) -> OrchestratorResult<()>;

    async fn delete_workload(&self, name: &str) -> OrchestratorResult<()>;

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()>;

    async fn describe_workload(&self, name: &str) -> OrchestratorResult<WorkloadStatus>;

    /// Bounded log tail, used by the poller to diagnose a failed worker
    /// (§4.3 step 2).
    async fn stream_logs(&self, name: &str, tail_lines: usize) -> OrchestratorResult<Vec<String>>;

    /// Execute a bounded command inside the workload (used by C10's
    /// content-capture listing).
    async fn exec(&self, name: &str, cmd: Vec<String>) -> OrchestratorResult<String>;

    /// Returns the externally reachable (host, port) for the workload's
    /// service, standing in for an actual port-forward tunnel — real L7
    /// traffic passthrough is an external gateway per §1.
    async fn port_forward(&self, name: &str) -> OrchestratorResult<(String, i32)>;

    /// List workload names currently running, used by the poller's
    /// best-effort recovery of in-flight workers on restart (§4.3).
    async fn list_workload_names(&self) -> OrchestratorResult<Vec<String>>;
}

const LABEL_MANAGED_BY: &str = "gpu-reservations.managed-by";
const LABEL_MANAGED_VALUE: &str = "gpu-reservations";
pub(crate) const LABEL_RESERVATION_ID: &str = "gpu-reservations.reservation-id";
pub(crate) const LABEL_GPU_TYPE: &str = "gpu-reservations.gpu-type";

/// Docker-backed stand-in for the cluster orchestrator: one container per
/// workload, labels carrying node-selector/reservation metadata.
#[derive(Debug, Clone)]
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub fn connect(docker_host: &str) -> anyhow::Result<Self> {
        let docker = if docker_host.starts_with("unix://") || docker_host.is_empty() {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_http(docker_host, 120, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { docker })
    }

    fn container_name(workload_name: &str) -> String {
        format!("gpu-reservations-{workload_name}")
    }

    async fn inspect_by_name(&self, workload_name: &str) -> OrchestratorResult<bollard::models::ContainerInspectResponse> {
        self.docker
            .inspect_container(&Self::container_name(workload_name), None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify_docker_err(e, workload_name))
    }
}

fn classify_docker_err(e: bollard::errors::Error, ctx: &str) -> OrchestratorError {
    match &e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404 => {
            OrchestratorError::NotFound(ctx.to_string())
        }
        _ => OrchestratorError::Transient(format!("{ctx}: {e}")),
    }
}

#[async_trait]
impl OrchestratorClient for DockerOrchestrator {
    async fn list_nodes_by_label(&self, _label_key: &str, _label_value: &str) -> OrchestratorResult<Vec<NodeInfo>> {
        // A single-daemon Docker stand-in has exactly one node: the host.
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(vec![NodeInfo {
            name: info.name.unwrap_or_else(|| "docker-host".to_string()),
            labels: HashMap::new(),
            allocatable_gpus: 0,
            ready: true,
            schedulable: true,
        }])
    }

    async fn describe_node(&self, name: &str) -> OrchestratorResult<NodeInfo> {
        let nodes = self.list_nodes_by_label("", "").await?;
        nodes
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn list_pods_by_node(&self, _node_name: &str) -> OrchestratorResult<Vec<PodInfo>> {
        self.list_pods_by_namespace("default").await
    }

    async fn list_pods_by_namespace(&self, namespace: &str) -> OrchestratorResult<Vec<PodInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", LABEL_MANAGED_BY, LABEL_MANAGED_VALUE)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let gpu_request = c
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_GPU_TYPE))
                    .is_some() as i32;
                let phase = match c.state {
                    Some(bollard::models::ContainerSummaryStateEnum::RUNNING) => PodPhase::Running,
                    Some(bollard::models::ContainerSummaryStateEnum::CREATED) => PodPhase::Pending,
                    Some(bollard::models::ContainerSummaryStateEnum::EXITED) => PodPhase::Succeeded,
                    _ => PodPhase::Unknown,
                };
                PodInfo {
                    name: c
                        .names
                        .and_then(|n| n.into_iter().next())
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    node_name: None,
                    namespace: namespace.to_string(),
                    gpu_request,
                    phase,
                }
            })
            .collect())
    }

    async fn create_workload(&self, spec: WorkloadSpec) -> OrchestratorResult<()> {
        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_VALUE.to_string());
        for (k, v) in &spec.node_selector {
            labels.insert(format!("gpu-reservations.selector.{k}"), v.clone());
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let device_requests = if spec.gpu_count > 0 {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(spec.gpu_count),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        } else {
            None
        };

        let binds = spec
            .volume_name
            .as_ref()
            .map(|v| vec![format!("{v}:/workspace")]);

        let host_config = HostConfig {
            device_requests,
            binds,
            nano_cpus: Some(spec.cpu_millis * 1_000_000),
            memory: Some(spec.memory_mb * 1024 * 1024),
            port_bindings: Some(HashMap::from([(
                "22/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None,
                }]),
            )])),
            ..Default::default()
        };

        let config = bollard::models::ContainerCreateBody {
            image: Some(spec.image),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            exposed_ports: Some(HashMap::from([(
                "22/tcp".to_string(),
                bollard::models::ContainerCreateBodyExposedPorts::default(),
            )])),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(Self::container_name(&spec.name)),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| OrchestratorError::Permanent(e.to_string()))?;

        self.docker
            .start_container(&Self::container_name(&spec.name), None::<StartContainerOptions>)
            .await
            .map_err(|e| OrchestratorError::Permanent(e.to_string()))?;

        Ok(())
    }

    async fn delete_workload(&self, name: &str) -> OrchestratorResult<()> {
        let container = Self::container_name(name);
        let _ = self
            .docker
            .stop_container(&container, None::<StopContainerOptions>)
            .await;

        self.docker
            .remove_container(
                &container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify_docker_err(e, name))?;

        Ok(())
    }

    async fn delete_service(&self, _name: &str) -> OrchestratorResult<()> {
        // The Docker stand-in publishes ports directly on the container;
        // there is no separate service object to delete.
        Ok(())
    }

    async fn describe_workload(&self, name: &str) -> OrchestratorResult<WorkloadStatus> {
        let inspect = self.inspect_by_name(name).await?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let node_port = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
            .and_then(|ports| ports.get("22/tcp"))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|b| b.first())
            .and_then(|b| b.host_port.as_ref())
            .and_then(|p| p.parse::<i32>().ok());

        Ok(WorkloadStatus {
            ready: running && node_port.is_some(),
            node_ip: Some("127.0.0.1".to_string()),
            node_port,
            phase: if running { PodPhase::Running } else { PodPhase::Pending },
        })
    }

    async fn stream_logs(&self, name: &str, tail_lines: usize) -> OrchestratorResult<Vec<String>> {
        let mut stream = self.docker.logs(
            &Self::container_name(name),
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                tail: tail_lines.to_string(),
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => lines.push(log.to_string()),
                Err(e) => return Err(classify_docker_err(e, name)),
            }
        }
        Ok(lines)
    }

    async fn exec(&self, name: &str, cmd: Vec<String>) -> OrchestratorResult<String> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                &Self::container_name(name),
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_docker_err(e, name))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(|e| classify_docker_err(e, name))?
        {
            while let Some(Ok(chunk)) = stream.next().await {
                output.push_str(&chunk.to_string());
            }
        }

        Ok(output)
    }

    async fn port_forward(&self, name: &str) -> OrchestratorResult<(String, i32)> {
        let status = self.describe_workload(name).await?;
        let port = status
            .node_port
            .ok_or_else(|| OrchestratorError::Transient("no published port yet".to_string()))?;
        Ok((status.node_ip.unwrap_or_else(|| "127.0.0.1".to_string()), port))
    }

    async fn list_workload_names(&self) -> OrchestratorResult<Vec<String>> {
        let pods = self.list_pods_by_namespace("default").await?;
        Ok(pods
            .into_iter()
            .map(|p| p.name.trim_start_matches("gpu-reservations-").to_string())
            .collect())
    }
}

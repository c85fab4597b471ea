//! In-memory `OrchestratorClient` used by the reservation/multinode/
//! expiry/teardown test suites, mirroring `provider::fake::FakeProvider`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    NodeInfo, OrchestratorClient, OrchestratorError, OrchestratorResult, PodInfo, PodPhase,
    WorkloadSpec, WorkloadStatus,
};

#[derive(Debug, Clone)]
struct FakeWorkload {
    spec_gpu_count: i32,
    node_selector: HashMap<String, String>,
    ready: bool,
    node_port: i32,
}

#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    nodes: Mutex<Vec<NodeInfo>>,
    workloads: Mutex<HashMap<String, FakeWorkload>>,
    next_port: Mutex<i32>,
    /// When true, every `create_workload` call reports not-ready until
    /// `set_ready` is called, simulating a pod stuck in `Pending`.
    pub auto_ready: Mutex<bool>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self {
            next_port: Mutex::new(30000),
            auto_ready: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn with_node(self, node: NodeInfo) -> Self {
        self.nodes.lock().unwrap().push(node);
        self
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(w) = self.workloads.lock().unwrap().get_mut(name) {
            w.ready = ready;
        }
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.lock().unwrap().len()
    }
}

#[async_trait]
impl OrchestratorClient for FakeOrchestrator {
    async fn list_nodes_by_label(&self, label_key: &str, label_value: &str) -> OrchestratorResult<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.labels.get(label_key).map(String::as_str) == Some(label_value))
            .cloned()
            .collect())
    }

    async fn describe_node(&self, name: &str) -> OrchestratorResult<NodeInfo> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn list_pods_by_node(&self, node_name: &str) -> OrchestratorResult<Vec<PodInfo>> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, w)| w.node_selector.get("node").map(String::as_str) == Some(node_name))
            .map(|(name, w)| PodInfo {
                name: name.clone(),
                node_name: Some(node_name.to_string()),
                namespace: "default".to_string(),
                gpu_request: w.spec_gpu_count,
                phase: if w.ready { PodPhase::Running } else { PodPhase::Pending },
            })
            .collect())
    }

    async fn list_pods_by_namespace(&self, namespace: &str) -> OrchestratorResult<Vec<PodInfo>> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .map(|(name, w)| PodInfo {
                name: name.clone(),
                node_name: None,
                namespace: namespace.to_string(),
                gpu_request: w.spec_gpu_count,
                phase: if w.ready { PodPhase::Running } else { PodPhase::Pending },
            })
            .collect())
    }

    async fn create_workload(&self, spec: WorkloadSpec) -> OrchestratorResult<()> {
        let mut port = self.next_port.lock().unwrap();
        *port += 1;
        let assigned_port = *port;
        let ready = *self.auto_ready.lock().unwrap();

        self.workloads.lock().unwrap().insert(
            spec.name.clone(),
            FakeWorkload {
                spec_gpu_count: spec.gpu_count,
                node_selector: spec.node_selector,
                ready,
                node_port: assigned_port,
            },
        );
        Ok(())
    }

    async fn delete_workload(&self, name: &str) -> OrchestratorResult<()> {
        self.workloads
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn delete_service(&self, _name: &str) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn describe_workload(&self, name: &str) -> OrchestratorResult<WorkloadStatus> {
        let workloads = self.workloads.lock().unwrap();
        let w = workloads
            .get(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        Ok(WorkloadStatus {
            ready: w.ready,
            node_ip: Some("10.0.0.1".to_string()),
            node_port: Some(w.node_port),
            phase: if w.ready { PodPhase::Running } else { PodPhase::Pending },
        })
    }

    async fn stream_logs(&self, name: &str, _tail_lines: usize) -> OrchestratorResult<Vec<String>> {
        if !self.workloads.lock().unwrap().contains_key(name) {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        Ok(vec!["fake log line".to_string()])
    }

    async fn exec(&self, name: &str, _cmd: Vec<String>) -> OrchestratorResult<String> {
        if !self.workloads.lock().unwrap().contains_key(name) {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        Ok("4.0K\t/workspace\n".to_string())
    }

    async fn port_forward(&self, name: &str) -> OrchestratorResult<(String, i32)> {
        let status = self.describe_workload(name).await?;
        Ok((status.node_ip.unwrap(), status.node_port.unwrap()))
    }

    async fn list_workload_names(&self) -> OrchestratorResult<Vec<String>> {
        Ok(self.workloads.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_describe_reports_assigned_port() {
        let o = FakeOrchestrator::new();
        o.create_workload(WorkloadSpec {
            name: "r1".into(),
            namespace: "default".into(),
            image: "img".into(),
            gpu_count: 1,
            cpu_millis: 1000,
            memory_mb: 1024,
            node_selector: HashMap::new(),
            env: HashMap::new(),
            volume_name: None,
            labels: HashMap::new(),
        })
        .await
        .unwrap();

        let status = o.describe_workload("r1").await.unwrap();
        assert!(status.ready);
        assert!(status.node_port.is_some());
    }

    #[tokio::test]
    async fn delete_unknown_workload_errors() {
        let o = FakeOrchestrator::new();
        let err = o.delete_workload("nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}

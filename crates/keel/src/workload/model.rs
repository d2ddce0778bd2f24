//! Persisted workload metadata and creation requests.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use keel_protocol::{BackendKind, WorkloadStatus};
use keel_sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ControllerError, ControllerResult};
use super::template;
use crate::backend::{PortBinding, Target};

/// Everything the agent remembers about a workload. Stored as `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadMeta {
    pub id: Uuid,
    pub backend: BackendKind,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub status: WorkloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Startup command template with `{{VAR}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_script: Option<String>,
    #[serde(default)]
    pub installed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Engine name, runtime id or pid of the current run.
    #[serde(default)]
    pub native_id: Option<String>,
}

/// Body of a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub id: Option<Uuid>,
    pub limits: Option<ResourceLimits>,
    pub image: Option<String>,
    pub startup: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub install_script: Option<String>,
}

impl WorkloadMeta {
    pub fn new(id: Uuid, backend: BackendKind, limits: ResourceLimits, spec: WorkloadSpec) -> Self {
        Self {
            id,
            backend,
            limits,
            status: WorkloadStatus::Created,
            image: spec.image,
            startup: spec.startup,
            environment: spec.environment,
            ports: spec.ports,
            install_script: spec.install_script,
            installed: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            exit_code: None,
            native_id: None,
        }
    }

    /// Built-in variables plus the workload environment; the latter wins.
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("SERVER_MEMORY".to_string(), self.limits.memory_mb.to_string());
        vars.insert("SERVER_UUID".to_string(), self.id.to_string());
        if let Some(port) = self.ports.first() {
            vars.insert("SERVER_PORT".to_string(), port.container.to_string());
        }
        vars.extend(self.environment.clone());
        vars
    }

    pub fn rendered_startup(&self) -> Option<String> {
        self.startup
            .as_deref()
            .map(|t| template::render(t, &self.template_vars()))
    }

    /// Environment handed to the workload process, `STARTUP` included.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self.template_vars().into_iter().collect();
        if let Some(startup) = self.rendered_startup() {
            env.push(("STARTUP".to_string(), startup));
        }
        env
    }

    /// Resolve what to run: an explicit command wins, else the startup
    /// template through `/bin/sh -c`.
    pub fn resolve_command(
        &self,
        command: Option<String>,
        args: Vec<String>,
    ) -> ControllerResult<(String, Vec<String>)> {
        if let Some(command) = command.filter(|c| !c.trim().is_empty()) {
            return Ok((command, args));
        }
        match self.rendered_startup().filter(|s| !s.trim().is_empty()) {
            Some(startup) => Ok(("/bin/sh".to_string(), vec!["-c".to_string(), startup])),
            None => Err(ControllerError::Validation(format!(
                "workload {} has no command and no startup template",
                self.id
            ))),
        }
    }

    pub fn target(&self, home: &Path) -> Target {
        Target {
            id: self.id,
            home: home.to_path_buf(),
            image: self.image.clone(),
            limits: self.limits.clone(),
            env: self.process_env(),
            ports: self.ports.clone(),
        }
    }
}

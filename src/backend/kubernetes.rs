//! Kubernetes exec backend over the API server's websocket channel

use super::{BackendKind, BufferedOutput, ContainerBackend, ContainerHandle, ExecRequest};
use crate::error::{ExecError, Result};
use crate::transport::{ChannelStatus, ReaderChannel, Transport, TransportError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Clone)]
pub struct KubernetesBackend {
    client: Client,
    namespace: String,
    container: Option<String>,
}

impl KubernetesBackend {
    /// Connect with the ambient kubeconfig or in-cluster credentials
    pub async fn connect(namespace: String, container: Option<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ExecError::Backend(format!("failed to create kube client: {e}")))?;
        tracing::info!(%namespace, "Connected to Kubernetes API");
        Ok(Self {
            client,
            namespace,
            container,
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn attach(&self, handle: &ContainerHandle, request: &ExecRequest) -> Result<AttachedProcess> {
        let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(container) = &self.container {
            params = params.container(container.clone());
        }

        self.pods()
            .exec(&handle.name, request.shell_argv(), &params)
            .await
            .map_err(|e| ExecError::Backend(format!("failed to exec in pod {}: {e}", handle.name)))
    }
}

/// Map the exec channel's final status object to an exit code
fn channel_status(status: Option<Status>) -> ChannelStatus {
    let Some(status) = status else {
        return ChannelStatus::Failed("exec finished without a status".to_string());
    };

    if status.status.as_deref() == Some("Success") {
        return ChannelStatus::Exited(0);
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|details| details.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|cause| cause.message.as_deref())
            .and_then(|message| message.parse::<i32>().ok());
        if let Some(code) = code {
            return ChannelStatus::Exited(code);
        }
    }

    ChannelStatus::Failed(
        status
            .message
            .unwrap_or_else(|| "exec failed without a message".to_string()),
    )
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl ContainerBackend for KubernetesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn resolve(&self, container: &str) -> Result<ContainerHandle> {
        let pod = self.pods().get(container).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => {
                ExecError::ContainerNotFound(container.to_string())
            }
            other => ExecError::Backend(format!("failed to get pod {container}: {other}")),
        })?;

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some("Running") {
            return Err(ExecError::ContainerNotRunning(format!(
                "{container} (phase {})",
                phase.unwrap_or("unknown")
            )));
        }

        let id = pod
            .metadata
            .uid
            .clone()
            .unwrap_or_else(|| container.to_string());
        Ok(ContainerHandle::new(id, container, BackendKind::Kubernetes))
    }

    async fn exec_buffered(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<BufferedOutput> {
        let mut attached = self.attach(handle, request).await?;
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let stdout = stdout.map_err(|e| {
            ExecError::transport(TransportError::Backend(format!("stdout read failed: {e}")))
        })?;
        let stderr = stderr.map_err(|e| {
            ExecError::transport(TransportError::Backend(format!("stderr read failed: {e}")))
        })?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        match channel_status(status) {
            ChannelStatus::Exited(exit_code) => Ok(BufferedOutput {
                exit_code,
                stdout,
                stderr,
            }),
            ChannelStatus::Failed(message) => {
                Err(ExecError::transport(TransportError::Status(message)))
            }
        }
    }

    async fn exec_streaming(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Transport> {
        let mut attached = self.attach(handle, request).await?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        // the status task owns the attached process so the websocket stays up
        let status = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            drop(attached);
            channel_status(status)
        };

        Ok(Transport::Pollable(Box::new(ReaderChannel::spawn(
            stdout, stderr, status,
        ))))
    }
}

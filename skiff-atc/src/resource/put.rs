use std::sync::Arc;

use skiff_client::Container;
use skiff_core::domain::container::{BindMount, BindMountMode};
use skiff_core::domain::resource::{Params, Resource};
use skiff_core::dto::script::{OutRequest, OutResponse};
use tokio::sync::watch;
use tracing::info;

use super::{ARTIFACTS_DIRECTORY, OUT_SCRIPT, ResourceError, ResourceManager};
use crate::script::{ScriptError, ScriptProcess};
use crate::volume::{NamedArtifacts, VolumeTarget};

impl ResourceManager {
    /// Publishes `artifacts` through the resource's out script.
    ///
    /// The script works on COW clones, so the caller's volumes are never
    /// modified.
    pub async fn put(
        &self,
        resource: &Resource,
        params: &Params,
        artifacts: &NamedArtifacts,
        cancel: watch::Receiver<bool>,
    ) -> Result<OutResponse, ResourceError> {
        let rootfs = self.rootfs(&resource.resource_type.rootfs_path).await?;

        let service = self.worker.volume_service();
        let target = VolumeTarget::new(self.worker.name(), service.as_ref());
        let inputs = self.volumes.cow_artifacts(target, artifacts).await?;

        let mounts = inputs
            .iter()
            .map(|(name, volume)| BindMount {
                src_path: volume.path().to_string(),
                dst_path: format!("{}/{}", ARTIFACTS_DIRECTORY, name),
                mode: BindMountMode::ReadWrite,
            })
            .collect();
        let container = self.create_container(&rootfs, mounts).await?;
        let handle = container.handle().to_string();

        let request = OutRequest {
            source: resource.source.clone(),
            params: params.clone(),
        };

        let result = Self::publish(container, &request, cancel).await;
        self.release(&handle).await;
        let published = result?;

        info!(
            worker = %self.worker.name(),
            resource_type = %resource.resource_type.name,
            version = ?published.version,
            "Published resource"
        );

        Ok(published)
    }

    async fn publish(
        container: Arc<dyn Container>,
        request: &OutRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<OutResponse, ResourceError> {
        // An empty archive creates the artifacts directory if nothing is
        // mounted under it
        let empty = tar::Builder::new(Vec::new()).into_inner()?;
        container.stream_in(ARTIFACTS_DIRECTORY, empty).await?;

        let mut script =
            ScriptProcess::new(container, OUT_SCRIPT, vec![ARTIFACTS_DIRECTORY.to_string()]);
        match script.run(request, cancel).await {
            Ok(published) => Ok(published),
            Err(ScriptError::Failed(mut failed)) => {
                if failed.stderr.is_empty() {
                    failed.stderr = script.stderr().to_string();
                }
                Err(ScriptError::Failed(failed).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

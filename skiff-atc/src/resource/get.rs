use skiff_core::domain::container::{BindMount, BindMountMode};
use skiff_core::domain::resource::{Params, Resource, Version};
use skiff_core::dto::script::{InRequest, InResponse};
use tokio::sync::watch;
use tracing::info;

use super::{GET_DESTINATION, IN_SCRIPT, ResourceError, ResourceManager};
use crate::script::ScriptProcess;
use crate::volume::WorkerVolume;

impl ResourceManager {
    /// Fetches `version` of `resource` into a fresh volume and hands the
    /// volume back to the caller
    pub async fn get(
        &self,
        resource: &Resource,
        version: &Version,
        params: &Params,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkerVolume, ResourceError> {
        let rootfs = self.rootfs(&resource.resource_type.rootfs_path).await?;
        let destination = self.empty_volume().await?;

        let mount = BindMount {
            src_path: destination.path().to_string(),
            dst_path: GET_DESTINATION.to_string(),
            mode: BindMountMode::ReadWrite,
        };
        let container = self.create_container(&rootfs, vec![mount]).await?;

        let request = InRequest {
            source: resource.source.clone(),
            params: params.clone(),
            version: Some(version.clone()),
        };

        let handle = container.handle().to_string();
        let mut script = ScriptProcess::new(container, IN_SCRIPT, vec![GET_DESTINATION.to_string()]);
        let result: Result<InResponse, _> = script.run(&request, cancel).await;
        self.release(&handle).await;
        let fetched = result?;

        info!(
            worker = %self.worker.name(),
            resource_type = %resource.resource_type.name,
            volume = %destination.handle(),
            version = ?fetched.version,
            "Fetched resource"
        );

        Ok(destination)
    }
}

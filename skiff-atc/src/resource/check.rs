use skiff_core::domain::resource::{Resource, Version};
use skiff_core::dto::script::{CheckRequest, CheckResponse};
use tokio::sync::watch;
use tracing::info;

use super::{CHECK_SCRIPT, ResourceError, ResourceManager};
use crate::script::ScriptProcess;

impl ResourceManager {
    /// Versions of `resource` after `since`, oldest first, as the check
    /// script reports them
    pub async fn check(
        &self,
        resource: &Resource,
        since: Option<&Version>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<Version>, ResourceError> {
        let rootfs = self.rootfs(&resource.resource_type.rootfs_path).await?;
        let container = self.create_container(&rootfs, vec![]).await?;

        let request = CheckRequest {
            source: resource.source.clone(),
            version: since.cloned(),
        };

        let handle = container.handle().to_string();
        let mut script = ScriptProcess::new(container, CHECK_SCRIPT, vec![]);
        let result: Result<CheckResponse, _> = script.run(&request, cancel).await;
        self.release(&handle).await;
        let versions = result?;

        info!(
            worker = %self.worker.name(),
            resource_type = %resource.resource_type.name,
            versions = versions.len(),
            "Checked resource"
        );

        Ok(versions)
    }
}

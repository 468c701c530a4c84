use crate::backend::{Backend, Backends};
use crate::core::{Result, SyncError, Target};
use crate::schema::Schema;
use crate::store::StoreConfig;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Collaborators shared by every record of one collection.
pub struct SyncContext {
    schema: Arc<dyn Schema>,
    backends: Backends,
    config: StoreConfig,
    runtime: Handle,
}

impl SyncContext {
    /// Bind the collaborators to the current tokio runtime.
    ///
    /// Fails outside a runtime, since records spawn their sync tasks on it.
    pub fn new(
        schema: Arc<dyn Schema>,
        backends: Backends,
        config: StoreConfig,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|err| SyncError::NoRuntime(err.to_string()))?;
        Ok(Arc::new(Self {
            schema,
            backends,
            config,
            runtime,
        }))
    }

    pub fn schema(&self) -> &dyn Schema {
        self.schema.as_ref()
    }

    pub fn backend(&self, target: Target) -> Arc<dyn Backend> {
        Arc::clone(self.backends.get(target))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn key_identifier(&self, target: Target) -> &str {
        self.schema.key_identifier_for(target)
    }
}

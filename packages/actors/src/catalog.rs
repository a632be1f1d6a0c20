//! Cached plan parameter definitions.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use queue_client::QueueServer;
use queue_core::{PlanDefinition, PlanKind, PlanParameter};
use tokio::time::Instant;

use crate::error::ReconcileError;
use crate::projection_actor::remote_call;

/// Wait after a failed fetch before trying again.
pub const CATALOG_RETRY: Duration = Duration::from_secs(5);

/// Plan definitions fetched from the server, cached per plan name.
///
/// The cache survives polls and is only dropped by [`invalidate`] when the
/// server connection is replaced. Fetching happens outside the catalog: the
/// owner calls [`begin_load`], runs [`fetch`] wherever it likes and hands the
/// outcome to [`finish_load`]. A failed fetch is not cached, but the next
/// attempt waits for [`CATALOG_RETRY`].
///
/// [`invalidate`]: ParameterCatalog::invalidate
/// [`begin_load`]: ParameterCatalog::begin_load
/// [`fetch`]: ParameterCatalog::fetch
/// [`finish_load`]: ParameterCatalog::finish_load
#[derive(Debug, Default)]
pub struct ParameterCatalog {
    definitions: Option<HashMap<String, PlanDefinition>>,
    names: HashMap<String, HashSet<String>>,
    loading: bool,
    retry_at: Option<Instant>,
    /// Bumped on invalidation so late fetches for an old server are ignored.
    generation: u64,
}

impl ParameterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.definitions.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claim the next fetch. Returns the generation to pass back to
    /// [`finish_load`](Self::finish_load), or `None` when the definitions are
    /// cached, a fetch is already running or a recent failure is cooling down.
    pub fn begin_load(&mut self) -> Option<u64> {
        if self.definitions.is_some() || self.loading {
            return None;
        }
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return None;
        }
        self.loading = true;
        Some(self.generation)
    }

    /// Fetch the allowed plans.
    pub async fn fetch(
        server: &dyn QueueServer,
        timeout: Duration,
    ) -> Result<Vec<PlanDefinition>, ReconcileError> {
        remote_call(timeout, server.allowed_definitions(PlanKind::Plan)).await
    }

    /// Store the outcome of a fetch. Returns `false` when the fetch belongs to
    /// an invalidated generation and was dropped.
    pub fn finish_load(
        &mut self,
        generation: u64,
        fetched: Result<Vec<PlanDefinition>, ReconcileError>,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.loading = false;
        match fetched {
            Ok(definitions) => {
                tracing::debug!("Cached {} plan definitions", definitions.len());
                self.retry_at = None;
                self.definitions = Some(
                    definitions
                        .into_iter()
                        .map(|definition| (definition.name.clone(), definition))
                        .collect(),
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch plan definitions, retrying in {:?}: {}",
                    CATALOG_RETRY,
                    e
                );
                self.retry_at = Some(Instant::now() + CATALOG_RETRY);
            }
        }
        true
    }

    /// Number of cached plan definitions.
    pub fn len(&self) -> usize {
        self.definitions.as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definition of `plan`, if cached.
    pub fn definition(&self, plan: &str) -> Option<&PlanDefinition> {
        self.definitions.as_ref()?.get(plan)
    }

    /// Parameters of `plan`; empty for unknown plans.
    pub fn definitions_for(&self, plan: &str) -> &[PlanParameter] {
        self.definition(plan)
            .map(|definition| definition.parameters.as_slice())
            .unwrap_or(&[])
    }

    /// Declared parameter names of `plan`.
    pub fn parameter_names(&mut self, plan: &str) -> HashSet<String> {
        if let Some(names) = self.names.get(plan) {
            return names.clone();
        }
        let Some(definition) = self.definition(plan) else {
            return HashSet::new();
        };
        let names: HashSet<String> = definition.parameter_names().map(str::to_string).collect();
        self.names.insert(plan.to_string(), names.clone());
        names
    }

    /// Parameter names for every plan in `plans`, keyed by plan name.
    pub fn names_by_plan<'a>(
        &mut self,
        plans: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, HashSet<String>> {
        plans
            .into_iter()
            .map(|plan| (plan.to_string(), self.parameter_names(plan)))
            .collect()
    }

    /// Forget everything; the next lookup fetches again.
    pub fn invalidate(&mut self) {
        self.definitions = None;
        self.names.clear();
        self.loading = false;
        self.retry_at = None;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use queue_client::MemoryQueueServer;

    fn server() -> MemoryQueueServer {
        MemoryQueueServer::new().with_definition(
            PlanDefinition::new("count", PlanKind::Plan)
                .with_parameter(PlanParameter::new("num").with_default(1.into())),
        )
    }

    async fn load(catalog: &mut ParameterCatalog, server: &MemoryQueueServer) -> bool {
        let Some(generation) = catalog.begin_load() else {
            return false;
        };
        let fetched = ParameterCatalog::fetch(server, Duration::from_secs(1)).await;
        catalog.finish_load(generation, fetched)
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let server = server();
        let mut catalog = ParameterCatalog::new();
        assert!(load(&mut catalog, &server).await);
        assert!(catalog.is_loaded());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.definitions_for("count").len(), 1);
        assert_eq!(catalog.parameter_names("count"), HashSet::from(["num".to_string()]));
        assert!(catalog.definitions_for("unknown").is_empty());
        assert!(catalog.parameter_names("unknown").is_empty());
        assert_eq!(catalog.begin_load(), None);

        catalog.invalidate();
        assert!(!catalog.is_loaded());
        assert!(catalog.parameter_names("count").is_empty());
        assert!(load(&mut catalog, &server).await);
    }

    #[tokio::test]
    async fn one_fetch_at_a_time() {
        let mut catalog = ParameterCatalog::new();
        let generation = catalog.begin_load();
        assert_eq!(generation, Some(0));
        assert!(catalog.is_loading());
        assert_eq!(catalog.begin_load(), None);
    }

    #[tokio::test]
    async fn failure_backs_off_before_retrying() {
        let mut catalog = ParameterCatalog::new();
        let generation = catalog.begin_load().unwrap();
        let failed = Err(ReconcileError::Transport("no response".to_string()));
        assert!(catalog.finish_load(generation, failed));
        assert!(!catalog.is_loaded());
        assert!(!catalog.is_loading());
        assert_eq!(catalog.begin_load(), None);

        // Invalidation clears the cooldown.
        catalog.invalidate();
        assert!(catalog.begin_load().is_some());
    }

    #[tokio::test]
    async fn late_fetch_for_replaced_server_is_dropped() {
        let server = server();
        let mut catalog = ParameterCatalog::new();
        let stale = catalog.begin_load().unwrap();
        catalog.invalidate();

        let fetched = ParameterCatalog::fetch(&server, Duration::from_secs(1)).await;
        assert!(!catalog.finish_load(stale, fetched));
        assert!(!catalog.is_loaded());
        assert!(catalog.begin_load().is_some());
    }
}

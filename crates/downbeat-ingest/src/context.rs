//! Shared state for the ingest service, constructed once at boot and
//! passed to every handler.

use crate::search_cache::SearchCache;
use crate::token::TokenManager;
use downbeat_core::paths::ProjectPaths;
use downbeat_core::settings::Settings;
use downbeat_core::users::UserDirectory;
use downbeat_store::{QueueNotifier, TaskQueueStore, TokenFile};
use std::sync::Arc;

/// Everything the submission API and resolver need.
pub struct IngestContext {
    pub settings: Settings,
    pub paths: ProjectPaths,
    pub users: UserDirectory,
    pub queue: TaskQueueStore,
    pub token: Arc<TokenManager>,
    pub search_cache: Option<SearchCache>,
    pub client: reqwest::Client,
}

/// Handler state alias.
pub type AppState = Arc<IngestContext>;

impl IngestContext {
    /// Wire up the context from validated settings.
    pub fn build(
        settings: Settings,
        paths: ProjectPaths,
        users: UserDirectory,
    ) -> Result<Self, downbeat_core::CoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| downbeat_core::CoreError::Internal(e.to_string()))?;

        let queue = TaskQueueStore::new(paths.task_queue.clone(), QueueNotifier::new());
        let token_file = TokenFile::new(paths.token.clone());
        let token = Arc::new(TokenManager::new(
            settings.upstream.clone(),
            token_file,
            client.clone(),
        ));
        let search_cache = SearchCache::open(&settings.search_cache, &paths.root);

        Ok(Self {
            settings,
            paths,
            users,
            queue,
            token,
            search_cache,
            client,
        })
    }

    /// Allowed storefront set for link validation.
    #[must_use]
    pub fn allowed_storefronts(&self) -> std::collections::HashSet<String> {
        self.settings
            .upstream
            .storefront_language_map
            .keys()
            .cloned()
            .collect()
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthKeys;
use crate::db::{CreditLedger, JobStore};
use crate::services::backend::AnalysisBackend;
use crate::services::jobs::JobService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub backend: Arc<dyn AnalysisBackend>,
    pub jobs: JobService,
    pub auth: Arc<AuthKeys>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        backend: Arc<dyn AnalysisBackend>,
        auth: AuthKeys,
        stale_after: Duration,
    ) -> Self {
        let jobs = JobService::new(store.clone(), ledger.clone(), backend.clone(), stale_after);
        Self {
            store,
            ledger,
            backend,
            jobs,
            auth: Arc::new(auth),
        }
    }
}

//! Process-wide application context.
//!
//! Constructed once at startup and shared by the API handlers and the jobs
//! they submit.

use anchor_core::Config;

use crate::builder::SnapshotBuilder;
use crate::cloud::{CloudClient, FetchError};
use crate::coresidency::CoResidency;
use crate::jobs::JobQueue;
use crate::store::CacheStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: CacheStore,
    pub cloud: CloudClient,
    pub builder: SnapshotBuilder,
    pub coresidency: CoResidency,
    pub jobs: JobQueue,
}

impl AppContext {
    pub fn new(config: Config, store: CacheStore) -> Result<Self, FetchError> {
        let cloud = CloudClient::new(&config.cloud)?;
        let builder = SnapshotBuilder::new(cloud.clone(), &config.cache);
        let coresidency = CoResidency::new(store.clone());
        let jobs = JobQueue::new(config.jobs.max_concurrency);
        Ok(Self {
            config,
            store,
            cloud,
            builder,
            coresidency,
            jobs,
        })
    }
}

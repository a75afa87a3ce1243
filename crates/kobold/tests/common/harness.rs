//! Isolated environment for integration tests.
//!
//! A `TestHarness` owns a temporary directory holding a library (the single
//! watch root and organize target) and a data directory with a real SQLite
//! job store.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kobold::convert::Converter;
use kobold::embed::OpfEmbedder;
use kobold::jobs::{Job, JobStore};
use kobold::metadata::{EmbeddedProvider, MetadataProvider, MetadataResolver};
use kobold::watcher::{reconcile, WatchTarget};
use kobold::worker::{Scheduler, TickSummary};
use kobold::{Pipeline, PipelineConfig};

use super::builders::ConfigBuilder;

pub struct TestHarness {
    temp_dir: TempDir,
    pub library: PathBuf,
    pub data_dir: PathBuf,
    pub store: JobStore,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let library = temp_dir.path().join("library");
        let data_dir = temp_dir.path().join("data");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::create_dir_all(&data_dir).unwrap();
        let store = JobStore::open(&kobold::db::database_path(&data_dir)).unwrap();

        Self {
            temp_dir,
            library,
            data_dir,
            store,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Config pointing at this harness's directories.
    pub fn config(&self) -> ConfigBuilder {
        ConfigBuilder::new(&self.library, &self.data_dir)
    }

    /// Pipeline settings with every stage on except conversion, which
    /// needs an explicit converter double.
    pub fn pipeline_config(&self, template: &str) -> PipelineConfig {
        let config = self
            .config()
            .organize(template)
            .set("EMBED_METADATA", "true")
            .build();
        PipelineConfig::from_config(&config)
    }

    /// A pipeline with the real embedded reader and OPF embedder, the given
    /// external providers and converter.
    pub fn pipeline(
        &self,
        config: PipelineConfig,
        external: Vec<Arc<dyn MetadataProvider>>,
        converter: Arc<dyn Converter>,
    ) -> Arc<Pipeline> {
        let fetch = !external.is_empty();
        let resolver = MetadataResolver::new(
            Arc::new(EmbeddedProvider::new()),
            external,
            fetch,
            config.provider_timeout,
        );
        Arc::new(Pipeline::new(
            Arc::new(config),
            resolver,
            converter,
            Arc::new(OpfEmbedder::new()),
        ))
    }

    pub fn scheduler(&self, pipeline: Arc<Pipeline>) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            pipeline,
            "test-worker",
            16,
            Duration::from_secs(60),
        )
    }

    pub fn tick(&self, scheduler: &Scheduler) -> TickSummary {
        scheduler.tick(&AtomicBool::new(false)).unwrap()
    }

    /// Path of a file relative to the library.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.library.join(relative)
    }

    /// Runs the startup consistency pass and records what it found.
    pub fn reconcile(&self) -> usize {
        let targets = vec![WatchTarget::new(self.library.clone(), false)];
        let events = reconcile(&targets, &self.store).unwrap();
        for event in &events {
            self.store.upsert(event).unwrap();
        }
        events.len()
    }

    pub fn job_at(&self, path: &Path) -> Option<Job> {
        self.store.find_by_path(path).unwrap()
    }

    pub fn job(&self, id: &str) -> Job {
        self.store.get(id).unwrap().expect("job exists")
    }
}

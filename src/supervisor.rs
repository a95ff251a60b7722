//! Supervisor: discovers entity records and keeps one worker per entity.
//!
//! Scans `profiles/` and `buildings/` on a 60-second cadence. New files
//! get a worker, removed files retire theirs, and a changed connection
//! identity (system, host, credential reference) forces a restart. Plain
//! edits like poll interval or signal map are picked up live by the worker
//! itself. Workers that exited on their own (for example a fatal
//! credential problem) stay parked until their file changes, so a broken
//! record cannot spam restart attempts.

use log::{info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::entity::{EntityKind, scan_dir};
use crate::worker::{WorkerContext, run_worker};

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
    identity: String,
    spawn_mtime: Option<SystemTime>,
}

pub struct Supervisor {
    base: WorkerContext,
    profiles_dir: PathBuf,
    buildings_dir: PathBuf,
    workers: BTreeMap<String, WorkerHandle>,
    /// Entities whose worker exited while the file stayed unchanged.
    parked: BTreeMap<String, Option<SystemTime>>,
}

impl Supervisor {
    pub fn new(base: WorkerContext) -> Supervisor {
        let profiles_dir = PathBuf::from(&base.config.profiles_dir);
        let buildings_dir = PathBuf::from(&base.config.buildings_dir);
        Supervisor {
            base,
            profiles_dir,
            buildings_dir,
            workers: BTreeMap::new(),
            parked: BTreeMap::new(),
        }
    }

    /// Main loop: scan, sleep, repeat until shutdown; then retire every
    /// worker and wait for them.
    pub fn run(&mut self) {
        info!(
            "Supervisor watching {} and {}",
            self.profiles_dir.display(),
            self.buildings_dir.display()
        );

        while !self.base.shutdown.load(Ordering::Relaxed) {
            self.scan();
            self.sleep_interruptibly(SCAN_INTERVAL);
        }

        info!("Shutting down {} worker(s)", self.workers.len());
        for handle in self.workers.values() {
            handle.stop.store(true, Ordering::Relaxed);
        }
        for (entity_id, handle) in std::mem::take(&mut self.workers) {
            if handle.join.join().is_err() {
                warn!("Worker {} panicked during shutdown", entity_id);
            }
        }
    }

    fn scan(&mut self) {
        let mut current: BTreeMap<String, (PathBuf, EntityKind, String)> = BTreeMap::new();
        for entity in scan_dir(&self.profiles_dir, EntityKind::House) {
            current.insert(
                entity.entity_id.clone(),
                (entity.path.clone(), EntityKind::House, entity.worker_identity()),
            );
        }
        for entity in scan_dir(&self.buildings_dir, EntityKind::Building) {
            if current.contains_key(&entity.entity_id) {
                warn!(
                    "Entity id {} exists in both config directories, keeping the house",
                    entity.entity_id
                );
                continue;
            }
            current.insert(
                entity.entity_id.clone(),
                (entity.path.clone(), EntityKind::Building, entity.worker_identity()),
            );
        }

        // Retire workers whose file vanished or whose identity changed.
        let mut to_remove = Vec::new();
        for (entity_id, handle) in &self.workers {
            match current.get(entity_id) {
                None => {
                    info!("Entity {} removed, retiring worker", entity_id);
                    to_remove.push(entity_id.clone());
                }
                Some((_, _, identity)) if *identity != handle.identity => {
                    info!("Entity {} connection changed, restarting worker", entity_id);
                    to_remove.push(entity_id.clone());
                }
                Some((path, _, _)) => {
                    if handle.join.is_finished() {
                        // Self-retired. Park it until the file changes.
                        let mtime = file_mtime(path);
                        if mtime == handle.spawn_mtime {
                            self.parked.insert(entity_id.clone(), mtime);
                        }
                        to_remove.push(entity_id.clone());
                    }
                }
            }
        }
        for entity_id in to_remove {
            if let Some(handle) = self.workers.remove(&entity_id) {
                handle.stop.store(true, Ordering::Relaxed);
                let _ = handle.join.join();
            }
        }

        // Spawn workers for entities without one.
        for (entity_id, (path, kind, identity)) in current {
            if self.workers.contains_key(&entity_id) {
                continue;
            }
            let mtime = file_mtime(&path);
            if let Some(parked_mtime) = self.parked.get(&entity_id) {
                if *parked_mtime == mtime {
                    continue;
                }
                self.parked.remove(&entity_id);
            }

            let stop = Arc::new(AtomicBool::new(false));
            let ctx = WorkerContext {
                stop: stop.clone(),
                ..self.base.clone()
            };
            let thread_path = path.clone();
            let join = std::thread::Builder::new()
                .name(format!("worker-{}", entity_id))
                .spawn(move || run_worker(ctx, thread_path, kind));

            match join {
                Ok(join) => {
                    info!("Spawned worker for {}", entity_id);
                    self.workers.insert(
                        entity_id,
                        WorkerHandle {
                            stop,
                            join,
                            identity,
                            spawn_mtime: mtime,
                        },
                    );
                }
                Err(e) => warn!("Could not spawn worker for {}: {}", entity_id, e),
            }
        }
    }

    fn sleep_interruptibly(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.base.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(Duration::from_secs(1)));
        }
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

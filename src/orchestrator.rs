use crate::cache::Cache;
use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::provider::realdebrid::RealDebrid;
use crate::provider::Provider;
use crate::scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Owns one `Cache` per configured provider and supervises their background
/// jobs. Grounded on the teacher's top-level `main.rs` wiring (one
/// `run_with_retry`-wrapped task per subsystem), generalized from a single
/// fixed set of tasks to N providers' worth.
pub struct Orchestrator {
    caches: HashMap<String, Arc<Cache>>,
}

impl Orchestrator {
    /// Builds a `Cache` per configured provider. A provider that fails to
    /// construct (not yet implemented, bad config) is skipped with a warning
    /// rather than aborting the others — only an empty result is fatal
    /// (spec §9: "the offending provider is skipped, not fatal to the whole
    /// process, unless zero providers end up configured").
    pub async fn bootstrap(config: &Config) -> anyhow::Result<Arc<Self>> {
        let mut caches = HashMap::new();

        for provider_cfg in &config.providers {
            let provider = match build_provider(provider_cfg) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!("skipping provider {}: {}", provider_cfg.folder, e);
                    continue;
                }
            };

            let cache_dir = config.provider_cache_dir(&provider_cfg.folder);
            match Cache::new(provider_cfg, provider, cache_dir) {
                Ok(cache) => {
                    caches.insert(provider_cfg.folder.clone(), cache);
                }
                Err(e) => warn!("skipping provider {}: {}", provider_cfg.folder, e),
            }
        }

        if caches.is_empty() {
            anyhow::bail!("no providers could be configured");
        }

        Ok(Arc::new(Orchestrator { caches }))
    }

    pub fn cache(&self, folder: &str) -> Option<Arc<Cache>> {
        self.caches.get(folder).cloned()
    }

    pub fn caches(&self) -> Vec<Arc<Cache>> {
        self.caches.values().cloned().collect()
    }

    /// Boots every provider's cache (initial load + sync against the
    /// provider) under the supervised-retry wrapper. Once bootstrap
    /// succeeds, its three periodic jobs (torrent refresh, download-link
    /// refresh, daily reset) are handed to the scheduler, each under its own
    /// supervised wrapper so a panic inside any of them is retried the same
    /// way a panic in bootstrap itself would be (spec §9).
    pub async fn start(self: &Arc<Self>, config: &Config) -> anyhow::Result<()> {
        for provider_cfg in &config.providers {
            let Some(cache) = self.cache(&provider_cfg.folder) else {
                continue;
            };

            let torrents_interval = scheduler::parse_interval(&provider_cfg.torrents_refresh_interval)?;
            let links_interval = scheduler::parse_interval(&provider_cfg.download_links_refresh_interval)?;
            let folder = provider_cfg.folder.clone();

            spawn_supervised(format!("{folder}/bootstrap"), move || {
                let cache = cache.clone();
                let folder = folder.clone();
                let torrents_interval = torrents_interval.clone();
                let links_interval = links_interval.clone();
                async move {
                    cache.start().await.map_err(|e| e.to_string())?;
                    spawn_periodic_jobs(folder, cache, torrents_interval, links_interval);
                    Ok(())
                }
            });
        }

        Ok(())
    }
}

/// Wraps each of a cache's periodic background jobs in its own
/// `spawn_supervised` so a panic inside `run_interval`/`run_daily_cet` (or
/// their task closures) is retried at the orchestrator boundary instead of
/// silently killing that job's `tokio::spawn`.
fn spawn_periodic_jobs(folder: String, cache: Arc<Cache>, torrents_interval: scheduler::Interval, links_interval: scheduler::Interval) {
    spawn_supervised(format!("{folder}/torrents-refresh"), {
        let cache = cache.clone();
        let folder = folder.clone();
        move || {
            let cache = cache.clone();
            let folder = folder.clone();
            let torrents_interval = torrents_interval.clone();
            async move {
                scheduler::run_interval(format!("{folder}/torrents-refresh"), torrents_interval, {
                    let cache = cache.clone();
                    move || {
                        let cache = cache.clone();
                        async move { cache.sync().await }
                    }
                })
                .await;
                Ok(())
            }
        }
    });

    spawn_supervised(format!("{folder}/links-refresh"), {
        let cache = cache.clone();
        let folder = folder.clone();
        move || {
            let cache = cache.clone();
            let folder = folder.clone();
            let links_interval = links_interval.clone();
            async move {
                scheduler::run_interval(format!("{folder}/links-refresh"), links_interval, {
                    let cache = cache.clone();
                    move || {
                        let cache = cache.clone();
                        async move { cache.refresh_download_links().await.map_err(anyhow::Error::from) }
                    }
                })
                .await;
                Ok(())
            }
        }
    });

    spawn_supervised(format!("{folder}/daily-reset"), move || {
        let cache = cache.clone();
        let folder = folder.clone();
        async move {
            scheduler::run_daily_cet(format!("{folder}/daily-reset"), {
                let cache = cache.clone();
                move || {
                    let cache = cache.clone();
                    async move {
                        cache.provider.reset_active_accounts().await;
                        cache.reset_invalid_links();
                        info!("daily reset complete for provider {}", cache.provider_name);
                    }
                }
            })
            .await;
            Ok(())
        }
    });
}

fn build_provider(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
    match cfg.name {
        ProviderKind::Realdebrid => Ok(Arc::new(RealDebrid::new(cfg)?)),
        other => anyhow::bail!("provider {other:?} is not yet implemented"),
    }
}

/// Grounded on the teacher's `run_with_retry`: retries a failing background
/// task up to 3 times with a 5 minute backoff, resetting the attempt count
/// if a run survived at least 60 seconds before failing. Exits the process
/// once retries are exhausted, since a dead cache subsystem leaves the
/// WebDAV tree silently stale.
///
/// Each attempt runs in its own `tokio::spawn` so a panic inside the task
/// surfaces as a `JoinError` here instead of silently killing an untracked
/// task — panics are treated the same as an `Err` for retry purposes.
fn spawn_supervised<F, Fut>(name: String, task_factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(300);
        const RESET_THRESHOLD: Duration = Duration::from_secs(60);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            info!("starting {} (attempt {})", name, attempts);

            let outcome = match tokio::spawn(task_factory()).await {
                Ok(result) => result,
                Err(join_err) => Err(format!("panicked: {join_err}")),
            };

            match outcome {
                Ok(()) => {
                    info!("{} completed successfully", name);
                    return;
                }
                Err(e) => {
                    let runtime = started.elapsed();
                    if runtime >= RESET_THRESHOLD {
                        warn!("{} failed after running for {:?}, resetting attempt counter: {}", name, runtime, e);
                        attempts = 0;
                    } else {
                        warn!("{} failed after {:?}: {}", name, runtime, e);
                    }

                    if attempts >= MAX_ATTEMPTS {
                        error!("{} failed {} times consecutively, giving up", name, MAX_ATTEMPTS);
                        return;
                    }

                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    });
}

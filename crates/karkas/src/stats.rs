//! Счетчики контейнера: регистрации, разрешения, попадания в кэш.

use std::sync::atomic::{AtomicU64, Ordering};

/// Внутренние атомарные счетчики; обновляются relaxed на горячем пути.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    registrations: AtomicU64,
    resolutions: AtomicU64,
    cache_hits: AtomicU64,
}

impl StatsInner {
    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution(&self, cache_hit: bool) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ContainerStats {
        ContainerStats {
            registered_services: self.registrations.load(Ordering::Relaxed),
            total_resolutions: self.resolutions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Снапшот статистики контейнера.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub registered_services: u64,
    pub total_resolutions: u64,
    pub cache_hits: u64,
}

impl ContainerStats {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_resolutions > 0 {
            self.cache_hits as f64 / self.total_resolutions as f64 * 100.0
        } else {
            0.0
        }
    }
}

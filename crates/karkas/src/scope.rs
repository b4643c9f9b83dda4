//! Scope: кэш `factory id → экземпляр` плюс список disposables.
//!
//! Конструирование per id выполняется не более одного раза даже под
//! конкуренцией: слот берется под коротким мьютексом, инициализация идет
//! через once-ячейку слота, так что фабрика не выполняется под общим локом
//! и вложенные разрешения в тот же scope не блокируются.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::ContainerError;
use crate::Object;

/// Ресурс, требующий явного освобождения при закрытии scope.
/// Rust не умеет выяснять disposability во время выполнения, поэтому она
/// объявляется на дескрипторе конструктора (`Ctor::of_disposable`).
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

/// Результат фабрики scope: экземпляр и, опционально, его disposer.
pub type ScopedItem = (Object, Option<Arc<dyn Disposable>>);

pub struct Scope {
    items: Mutex<HashMap<usize, Arc<OnceCell<Object>>>>,
    disposables: Mutex<Vec<Arc<dyn Disposable>>>,
    disposed: AtomicBool,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            disposables: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Вернуть экземпляр для id, создав его фабрикой не более одного раза.
    /// Конкурирующие вызовы того же id наблюдают один и тот же объект.
    /// Фабрика — `FnMut`: ей разрешено держать `&mut` слот resolution scope
    /// вызывающего.
    pub fn get_or_add(
        &self,
        id: usize,
        create: &mut dyn FnMut() -> Result<ScopedItem>,
    ) -> Result<Object> {
        if self.is_disposed() {
            return Err(ContainerError::ScopeIsDisposed.into());
        }

        let slot = {
            let mut items = self.items.lock();
            items.entry(id).or_default().clone()
        };

        let value = slot.get_or_try_init(|| -> Result<Object> {
            let (object, disposer) = create()?;
            if let Some(d) = disposer {
                self.disposables.lock().push(d);
            }
            Ok(object)
        })?;
        Ok(value.clone())
    }

    /// Идемпотентный teardown: каждый отслеживаемый disposable освобождается
    /// ровно один раз, в порядке создания.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let disposables = {
            let mut guard = self.disposables.lock();
            std::mem::take(&mut *guard)
        };
        let count = disposables.len();
        for d in disposables {
            d.dispose();
        }
        self.items.lock().clear();
        debug!(disposed_items = count, "scope disposed");
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Probe {
        drops: Arc<AtomicU32>,
    }

    impl Disposable for Probe {
        fn dispose(&self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn plain_item(value: u32) -> Result<ScopedItem> {
        Ok((Arc::new(value) as Object, None))
    }

    #[test]
    fn test_get_or_add_caches_per_id() {
        let scope = Scope::new();
        let a = scope.get_or_add(1, &mut || plain_item(10)).expect("first add");
        let b = scope.get_or_add(1, &mut || plain_item(20)).expect("second add");
        assert!(Arc::ptr_eq(&a, &b));

        let c = scope.get_or_add(2, &mut || plain_item(30)).expect("other id");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_factory_runs_at_most_once_under_contention() {
        let scope = Arc::new(Scope::new());
        let created = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scope = scope.clone();
            let created = created.clone();
            handles.push(std::thread::spawn(move || {
                scope
                    .get_or_add(7, &mut || {
                        created.fetch_add(1, Ordering::SeqCst);
                        plain_item(7)
                    })
                    .expect("get_or_add")
            }));
        }
        let objects: Vec<Object> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        for o in &objects[1..] {
            assert!(Arc::ptr_eq(&objects[0], o));
        }
    }

    #[test]
    fn test_dispose_is_idempotent_and_exact_once() {
        let scope = Scope::new();
        let drops = Arc::new(AtomicU32::new(0));
        let drops_in = drops.clone();

        scope
            .get_or_add(1, &mut move || {
                let probe = Arc::new(Probe {
                    drops: drops_in.clone(),
                });
                Ok((probe.clone() as Object, Some(probe as Arc<dyn Disposable>)))
            })
            .expect("add disposable");

        scope.dispose();
        scope.dispose();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_or_add_after_dispose_fails() {
        let scope = Scope::new();
        scope.dispose();
        let err = scope
            .get_or_add(1, &mut || plain_item(1))
            .expect_err("disposed scope must reject");
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::ScopeIsDisposed)
        ));
    }
}

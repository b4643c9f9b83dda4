//! Тесты встроенных врапперов: func, lazy, many, vec-снапшот, meta,
//! debug-expression.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use karkas::wrappers::{debug_expr_of, func_of, lazy_of, many_of, meta_of, vec_of};
use karkas::{
    Container, ContainerError, Ctor, ExprView, FuncValue, LazyValue, ManyValue, MetaValue,
    ParamSpec, Reuse, Setup, TypeToken,
};

trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Для composite: сколько вложенных плагинов он собрал.
    fn inner_count(&self) -> usize {
        0
    }
}

type PluginObj = Arc<dyn Plugin>;

struct AuthPlugin;
struct CachePlugin;
struct TracePlugin;

impl Plugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }
}

impl Plugin for CachePlugin {
    fn name(&self) -> &'static str {
        "cache"
    }
}

impl Plugin for TracePlugin {
    fn name(&self) -> &'static str {
        "trace"
    }
}

fn plugin_ctor<P: Plugin + Default + 'static>() -> Ctor {
    Ctor::of::<PluginObj, _>(vec![], |_| Ok(Arc::new(P::default()) as PluginObj))
}

impl Default for AuthPlugin {
    fn default() -> Self {
        AuthPlugin
    }
}

impl Default for CachePlugin {
    fn default() -> Self {
        CachePlugin
    }
}

impl Default for TracePlugin {
    fn default() -> Self {
        TracePlugin
    }
}

#[derive(Debug)]
struct Worker {
    id: u32,
}

#[test]
fn test_func_wrapper_defers_construction() -> Result<()> {
    let created = Arc::new(AtomicU32::new(0));
    let container = Container::new()?;
    let created_in = created.clone();
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], move |_| {
            Ok(Worker {
                id: created_in.fetch_add(1, Ordering::SeqCst),
            })
        }),
        None,
    )?;

    let func_token = func_of(&[], &TypeToken::of::<Worker>());
    let func = container
        .resolve_token(&func_token)?
        .downcast::<FuncValue>()
        .expect("func value");
    // Конструирования еще не было
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let a = func.invoke0_as::<Worker>()?;
    let b = func.invoke0_as::<Worker>()?;
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&a, &b));
    Ok(())
}

#[test]
fn test_func_over_singleton_yields_the_singleton() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], |_| Ok(Worker { id: 7 })),
        Some(Reuse::Singleton),
    )?;

    // Func разрешен ДО какого-либо прямого разрешения
    let func_token = func_of(&[], &TypeToken::of::<Worker>());
    let func = container
        .resolve_token(&func_token)?
        .downcast::<FuncValue>()
        .expect("func value");

    let from_func_a = func.invoke0_as::<Worker>()?;
    let from_func_b = func.invoke0_as::<Worker>()?;
    assert!(Arc::ptr_eq(&from_func_a, &from_func_b));

    // Прямое разрешение дает тот же singleton
    let direct = container.resolve::<Worker>()?;
    assert!(Arc::ptr_eq(&from_func_a, &direct));
    Ok(())
}

#[test]
fn test_func_with_argument_matches_ctor_parameter() -> Result<()> {
    #[derive(Debug)]
    struct Greeting {
        text: Arc<String>,
        worker: Arc<Worker>,
    }

    let container = Container::new()?;
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], |_| Ok(Worker { id: 1 })),
        None,
    )?;
    container.register_type::<Greeting>(
        Ctor::of::<Greeting, _>(
            vec![
                ParamSpec::of::<String>("text"),
                ParamSpec::of::<Worker>("worker"),
            ],
            |args| {
                Ok(Greeting {
                    text: args.take::<String>()?,
                    worker: args.take::<Worker>()?,
                })
            },
        ),
        None,
    )?;

    let func_token = func_of(&[TypeToken::of::<String>()], &TypeToken::of::<Greeting>());
    let func = container
        .resolve_token(&func_token)?
        .downcast::<FuncValue>()
        .expect("func value");
    assert_eq!(func.arity(), 1);

    let greeting = func
        .invoke(vec![Arc::new("privet".to_string()) as karkas::Object])?
        .downcast::<Greeting>()
        .expect("greeting");
    assert_eq!(greeting.text.as_str(), "privet");
    assert_eq!(greeting.worker.id, 1);
    Ok(())
}

#[test]
fn test_func_with_unused_argument_fails() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], |_| Ok(Worker { id: 1 })),
        None,
    )?;

    // Worker не принимает String — аргумент функции останется неиспользованным
    let func_token = func_of(&[TypeToken::of::<String>()], &TypeToken::of::<Worker>());
    let err = container
        .resolve_token(&func_token)
        .expect_err("unused func argument must fail");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::SomeFuncParamsAreUnused { .. })
    ));
    Ok(())
}

#[test]
fn test_lazy_wrapper_memoizes_first_call() -> Result<()> {
    let created = Arc::new(AtomicU32::new(0));
    let container = Container::new()?;
    let created_in = created.clone();
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], move |_| {
            Ok(Worker {
                id: created_in.fetch_add(1, Ordering::SeqCst),
            })
        }),
        None,
    )?;

    let lazy = container
        .resolve_token(&lazy_of(&TypeToken::of::<Worker>()))?
        .downcast::<LazyValue>()
        .expect("lazy value");
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let a = lazy.get_as::<Worker>()?;
    let b = lazy.get_as::<Worker>()?;
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_vec_snapshot_in_registration_order() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<PluginObj>(plugin_ctor::<AuthPlugin>(), None)?;
    container.register_type::<PluginObj>(plugin_ctor::<CachePlugin>(), None)?;
    container.register_type::<PluginObj>(plugin_ctor::<TracePlugin>(), None)?;

    let sequence = container
        .resolve_token(&vec_of(&TypeToken::of::<PluginObj>()))?
        .downcast::<Vec<karkas::Object>>()
        .expect("sequence");
    let names: Vec<&str> = sequence
        .iter()
        .map(|item| {
            item.clone()
                .downcast::<PluginObj>()
                .expect("plugin")
                .name()
        })
        .collect();
    assert_eq!(names, vec!["auth", "cache", "trace"]);
    Ok(())
}

#[test]
fn test_vec_snapshot_does_not_see_later_registrations() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<PluginObj>(plugin_ctor::<AuthPlugin>(), None)?;

    let first = container
        .resolve_token(&vec_of(&TypeToken::of::<PluginObj>()))?
        .downcast::<Vec<karkas::Object>>()
        .expect("sequence");
    assert_eq!(first.len(), 1);

    container.register_type::<PluginObj>(plugin_ctor::<CachePlugin>(), None)?;

    // Снапшот зафиксирован при первом разрешении
    let second = container
        .resolve_token(&vec_of(&TypeToken::of::<PluginObj>()))?
        .downcast::<Vec<karkas::Object>>()
        .expect("sequence");
    assert_eq!(second.len(), 1);
    Ok(())
}

#[test]
fn test_many_is_a_live_view() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<PluginObj>(plugin_ctor::<AuthPlugin>(), None)?;

    let many = container
        .resolve_token(&many_of(&TypeToken::of::<PluginObj>()))?
        .downcast::<ManyValue>()
        .expect("many value");
    assert_eq!(many.items()?.len(), 1);

    container.register_type::<PluginObj>(plugin_ctor::<CachePlugin>(), None)?;

    // Живой view видит регистрации после создания враппера
    assert_eq!(many.items()?.len(), 2);
    Ok(())
}

#[test]
fn test_many_fails_after_container_is_gone() -> Result<()> {
    let many = {
        let container = Container::new()?;
        container.register_type::<PluginObj>(plugin_ctor::<AuthPlugin>(), None)?;
        container
            .resolve_token(&many_of(&TypeToken::of::<PluginObj>()))?
            .downcast::<ManyValue>()
            .expect("many value")
    };
    let err = many.items().expect_err("container is gone");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::ContainerIsGarbageCollected)
    ));
    Ok(())
}

#[test]
fn test_composite_is_filtered_from_its_own_enumerable() -> Result<()> {
    struct CompositePlugin {
        inner: Vec<karkas::Object>,
    }

    impl Plugin for CompositePlugin {
        fn name(&self) -> &'static str {
            "composite"
        }

        fn inner_count(&self) -> usize {
            self.inner.len()
        }
    }

    let container = Container::new()?;
    container.register_type::<PluginObj>(plugin_ctor::<AuthPlugin>(), None)?;
    container.register_type::<PluginObj>(plugin_ctor::<CachePlugin>(), None)?;
    container.register_type::<PluginObj>(plugin_ctor::<TracePlugin>(), None)?;

    let vec_token = vec_of(&TypeToken::of::<PluginObj>());
    container.register_type_named::<PluginObj>(
        Ctor::of::<PluginObj, _>(vec![ParamSpec::new("plugins", vec_token)], |args| {
            let inner = args.take::<Vec<karkas::Object>>()?;
            Ok(Arc::new(CompositePlugin {
                inner: (*inner).clone(),
            }) as PluginObj)
        }),
        None,
        "composite",
    )?;

    let composite = container.resolve_named::<PluginObj>("composite")?;
    assert_eq!(composite.name(), "composite");
    // Сам composite отфильтрован из собственного перечисления
    assert_eq!(composite.inner_count(), 3);
    Ok(())
}

#[test]
fn test_meta_wrapper_selects_by_metadata_type() -> Result<()> {
    let container = Container::new()?;
    container.register_impl(
        karkas::ClosedImpl::of::<Worker>(Ctor::of::<Worker, _>(vec![], |_| {
            Ok(Worker { id: 3 })
        })),
        TypeToken::of::<Worker>(),
        None,
        None,
        Setup::with_metadata::<String>("background".to_string()),
    )?;

    let meta = container
        .resolve_token(&meta_of(&TypeToken::of::<Worker>(), &TypeToken::of::<String>()))?
        .downcast::<MetaValue>()
        .expect("meta value");
    let worker = meta.value.clone().downcast::<Worker>().expect("worker");
    let label = meta.metadata.clone().downcast::<String>().expect("label");
    assert_eq!(worker.id, 3);
    assert_eq!(label.as_str(), "background");
    Ok(())
}

#[test]
fn test_meta_miss_falls_through_to_unresolved() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], |_| Ok(Worker { id: 3 })),
        None,
    )?;

    // Метаданных типа u64 нет — враппер неприменим, сервис неразрешим
    let err = container
        .resolve_token(&meta_of(&TypeToken::of::<Worker>(), &TypeToken::of::<u64>()))
        .expect_err("metadata miss must fall through");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::UnableToResolve { .. })
    ));
    Ok(())
}

#[test]
fn test_debug_expression_exposes_the_ir() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<Worker>(
        Ctor::of::<Worker, _>(vec![], |_| Ok(Worker { id: 1 })),
        None,
    )?;

    let view = container
        .resolve_token(&debug_expr_of(&TypeToken::of::<Worker>()))?
        .downcast::<ExprView>()
        .expect("expression view");
    let printed = view.to_string();
    assert!(printed.contains("new"), "got: {printed}");
    assert!(printed.contains("Worker"), "got: {printed}");
    Ok(())
}

#[test]
fn test_empty_enumerable_fails() -> Result<()> {
    let container = Container::new()?;
    let err = container
        .resolve_token(&vec_of(&TypeToken::of::<Worker>()))
        .expect_err("no items registered");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::UnableToFindRegisteredEnumerableItems { .. })
    ));
    Ok(())
}

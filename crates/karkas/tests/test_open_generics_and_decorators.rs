//! Тесты open-generic специализации и композиции декораторов.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use karkas::{
    ClosedImpl, Container, ContainerError, Ctor, GenericDef, OpenImpl, ParamSpec, Reuse, Setup,
    TypeToken,
};
use once_cell::sync::Lazy;

// === OPEN-GENERIC FIXTURES ===

static IREPO: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("IRepo", 1));

#[derive(Debug)]
struct Repo<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Repo<T> {
    fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

fn repo_open_impl() -> OpenImpl {
    let repo_def = GenericDef::new("Repo", 1);
    OpenImpl::new(
        repo_def,
        vec![IREPO.token(vec![TypeToken::Var(0)])],
        |args| {
            let arg = args
                .first()
                .ok_or_else(|| anyhow!("repo requires one type argument"))?;
            if *arg == TypeToken::of::<i32>() {
                Ok(ClosedImpl::of::<Repo<i32>>(Ctor::of::<Repo<i32>, _>(
                    vec![],
                    |_| Ok(Repo::<i32>::new()),
                )))
            } else if *arg == TypeToken::of::<String>() {
                Ok(ClosedImpl::of::<Repo<String>>(Ctor::of::<Repo<String>, _>(
                    vec![],
                    |_| Ok(Repo::<String>::new()),
                )))
            } else {
                Err(anyhow!("unsupported repo argument {arg}"))
            }
        },
    )
}

#[test]
fn test_open_generic_specializes_per_closed_type() -> Result<()> {
    let container = Container::new()?;
    container.register_open(repo_open_impl(), IREPO.open(), Some(Reuse::Singleton))?;

    let int_token = IREPO.token(vec![TypeToken::of::<i32>()]);
    let string_token = IREPO.token(vec![TypeToken::of::<String>()]);

    let int_repo = container.resolve_token(&int_token)?;
    let string_repo = container.resolve_token(&string_token)?;

    // Закрытые формы имеют правильные конкретные типы
    assert!(int_repo.clone().downcast::<Repo<i32>>().is_ok());
    assert!(string_repo.clone().downcast::<Repo<String>>().is_ok());

    // Singleton — per закрытый тип
    assert!(!Arc::ptr_eq(&int_repo, &string_repo));
    let int_again = container.resolve_token(&int_token)?;
    assert!(Arc::ptr_eq(&int_repo, &int_again));
    Ok(())
}

#[test]
fn test_open_generic_specialization_is_memoized() -> Result<()> {
    let container = Container::new()?;
    container.register_open(repo_open_impl(), IREPO.open(), None)?;

    let int_token = IREPO.token(vec![TypeToken::of::<i32>()]);
    let _ = container.resolve_token(&int_token)?;
    // Закрытая форма зарегистрирована и находится без провайдера
    assert!(container.is_registered(&int_token, None));
    Ok(())
}

#[test]
fn test_open_impl_must_cover_all_type_args() -> Result<()> {
    let container = Container::new()?;
    let pair_def = GenericDef::new("PairImpl", 2);
    let service = GenericDef::new("IPairService", 1);
    // View упоминает только первый параметр реализации
    let open = OpenImpl::new(
        pair_def,
        vec![service.token(vec![TypeToken::Var(0)])],
        |_| Err(anyhow!("never specialized")),
    );
    let err = container
        .register_open(open, service.open(), None)
        .expect_err("uncovered type arg must be rejected");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::OpenGenericImplDoesNotSpecifyAllTypeArgs { .. })
    ));
    Ok(())
}

#[test]
fn test_closed_impl_cannot_serve_open_service() -> Result<()> {
    let container = Container::new()?;
    let err = container
        .register_impl(
            ClosedImpl::of::<Repo<i32>>(Ctor::of::<Repo<i32>, _>(vec![], |_| {
                Ok(Repo::<i32>::new())
            })),
            IREPO.open(),
            None,
            None,
            Setup::service(),
        )
        .expect_err("closed impl against open service must fail");
    assert!(matches!(
        err.downcast_ref::<ContainerError>(),
        Some(ContainerError::UnableToRegisterOpenGenericImplWithNonGenericService { .. })
    ));
    Ok(())
}

// === DECORATOR FIXTURES ===

trait Notifier: Send + Sync {
    fn describe(&self) -> String;
}

type NotifierObj = Arc<dyn Notifier>;

struct EmailNotifier;

impl Notifier for EmailNotifier {
    fn describe(&self) -> String {
        "email".to_string()
    }
}

struct LoggingNotifier {
    inner: NotifierObj,
}

impl Notifier for LoggingNotifier {
    fn describe(&self) -> String {
        format!("logging({})", self.inner.describe())
    }
}

struct MetricsNotifier {
    inner: NotifierObj,
}

impl Notifier for MetricsNotifier {
    fn describe(&self) -> String {
        format!("metrics({})", self.inner.describe())
    }
}

fn email_ctor() -> Ctor {
    Ctor::of::<NotifierObj, _>(vec![], |_| Ok(Arc::new(EmailNotifier) as NotifierObj))
}

fn logging_decorator() -> ClosedImpl {
    ClosedImpl::of::<NotifierObj>(Ctor::of::<NotifierObj, _>(
        vec![ParamSpec::of::<NotifierObj>("inner")],
        |args| {
            let inner = args.take::<NotifierObj>()?;
            Ok(Arc::new(LoggingNotifier {
                inner: (*inner).clone(),
            }) as NotifierObj)
        },
    ))
}

fn metrics_decorator() -> ClosedImpl {
    ClosedImpl::of::<NotifierObj>(Ctor::of::<NotifierObj, _>(
        vec![ParamSpec::of::<NotifierObj>("inner")],
        |args| {
            let inner = args.take::<NotifierObj>()?;
            Ok(Arc::new(MetricsNotifier {
                inner: (*inner).clone(),
            }) as NotifierObj)
        },
    ))
}

#[test]
fn test_decorator_wraps_service() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<NotifierObj>(email_ctor(), None)?;
    container.register_decorator(
        logging_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator(),
    )?;

    let notifier = container.resolve::<NotifierObj>()?;
    assert_eq!(notifier.describe(), "logging(email)");
    Ok(())
}

#[test]
fn test_second_decorator_registered_later_is_applied_outermost() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<NotifierObj>(email_ctor(), None)?;
    container.register_decorator(
        logging_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator(),
    )?;

    let first = container.resolve::<NotifierObj>()?;
    assert_eq!(first.describe(), "logging(email)");

    // Декоратор, добавленный после первого разрешения, виден дальше
    container.register_decorator(
        metrics_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator(),
    )?;
    let second = container.resolve::<NotifierObj>()?;
    assert_eq!(second.describe(), "metrics(logging(email))");
    Ok(())
}

#[test]
fn test_conditional_decorator_is_skipped_when_inapplicable() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<NotifierObj>(email_ctor(), None)?;
    container.register_decorator(
        logging_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator_when(|request| request.service_key != karkas::ServiceKey::Default),
    )?;

    // Условие декоратора не выполняется для default ключа
    let notifier = container.resolve::<NotifierObj>()?;
    assert_eq!(notifier.describe(), "email");
    Ok(())
}

#[test]
fn test_func_decorator_composes_with_direct_decorator() -> Result<()> {
    let container = Container::new()?;
    container.register_type::<NotifierObj>(email_ctor(), None)?;
    container.register_func_decorator::<NotifierObj, _>(|inner| {
        Ok(Arc::new(LoggingNotifier {
            inner: (*inner).clone(),
        }) as NotifierObj)
    })?;
    container.register_decorator(
        metrics_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator(),
    )?;

    // Функциональные декораторы применяются первыми, прямые — поверх
    let notifier = container.resolve::<NotifierObj>()?;
    assert_eq!(notifier.describe(), "metrics(logging(email))");
    Ok(())
}

#[test]
fn test_decorated_singleton_keeps_single_inner_instance() -> Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};

    static CREATED: AtomicU32 = AtomicU32::new(0);

    let container = Container::new()?;
    container.register_type::<NotifierObj>(
        Ctor::of::<NotifierObj, _>(vec![], |_| {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EmailNotifier) as NotifierObj)
        }),
        Some(Reuse::Singleton),
    )?;
    container.register_decorator(
        logging_decorator(),
        TypeToken::of::<NotifierObj>(),
        Setup::decorator(),
    )?;

    let a = container.resolve::<NotifierObj>()?;
    let b = container.resolve::<NotifierObj>()?;
    assert_eq!(a.describe(), "logging(email)");
    assert_eq!(b.describe(), "logging(email)");
    // Внутренний singleton сконструирован один раз
    assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_open_generic_decorator_specializes_per_service() -> Result<()> {
    trait Described: Send + Sync {
        fn describe(&self) -> String;
    }

    static ISOURCE: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("ISource", 1));

    struct IntSource;
    struct AuditSource {
        inner: Arc<dyn Described>,
    }

    impl Described for IntSource {
        fn describe(&self) -> String {
            "ints".to_string()
        }
    }

    impl Described for AuditSource {
        fn describe(&self) -> String {
            format!("audit({})", self.inner.describe())
        }
    }

    type SourceObj = Arc<dyn Described>;

    let container = Container::new()?;
    let int_token = ISOURCE.token(vec![TypeToken::of::<i32>()]);

    // Закрытый сервис под generic токеном
    container.register_impl(
        ClosedImpl::new(int_token.clone()).with_ctor(Ctor::of::<SourceObj, _>(vec![], |_| {
            Ok(Arc::new(IntSource) as SourceObj)
        })),
        int_token.clone(),
        None,
        None,
        Setup::service(),
    )?;

    // Open-generic декоратор: применяется к любому ISource<T>
    let audit_def = GenericDef::new("AuditSource", 1);
    let int_token_for_ctor = int_token.clone();
    container.register(
        karkas::Factory::reflection_open(
            OpenImpl::new(
                audit_def,
                vec![ISOURCE.token(vec![TypeToken::Var(0)])],
                move |_args| {
                    Ok(ClosedImpl::new(int_token_for_ctor.clone()).with_ctor(
                        Ctor::of::<SourceObj, _>(
                            vec![ParamSpec::new("inner", int_token_for_ctor.clone())],
                            |args| {
                                let inner = args.take::<SourceObj>()?;
                                Ok(Arc::new(AuditSource {
                                    inner: (*inner).clone(),
                                }) as SourceObj)
                            },
                        ),
                    ))
                },
            ),
            None,
            Setup::decorator(),
        ),
        ISOURCE.open(),
        None,
    )?;

    let source = container
        .resolve_token(&int_token)?
        .downcast::<SourceObj>()
        .map_err(|_| anyhow!("source object expected"))?;
    assert_eq!(source.describe(), "audit(ints)");
    Ok(())
}

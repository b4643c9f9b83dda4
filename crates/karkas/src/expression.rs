//! Expression IR и компиляция в фабрики.
//!
//! Каждое разрешение понижается в дерево конструирующих выражений, которое
//! один раз компилируется в замыкание `CompiledFactory` и кэшируется.
//! Компиляция — построение дерева вложенных замыканий: без повторного
//! обхода IR на горячем пути и без какой-либо кодогенерации.
//!
//! Сигнатура скомпилированной фабрики: `(constants, &mut resolution_scope)`.
//! Слот resolution scope общий для всех вложенных вычислений одного
//! top-level вызова и лениво инициализируется первым InResolutionScope
//! сервисом.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};

use crate::container::Container;
use crate::errors::ContainerError;
use crate::factory::{Ctor, Member};
use crate::scope::{Disposable, Scope, ScopedItem};
use crate::type_token::TypeToken;
use crate::Object;

/// Слот resolution scope, протаскиваемый через все вложенные вычисления
/// одного top-level разрешения.
pub type ResolutionScope = Option<Arc<Scope>>;

pub type CompiledFactory =
    Arc<dyn Fn(&Constants, &mut ResolutionScope) -> Result<Object> + Send + Sync>;

/// Попытка получить disposer для только что созданного объекта.
pub type DisposerFn = Arc<dyn Fn(&Object) -> Option<Arc<dyn Disposable>> + Send + Sync>;

/// Зарезервированный слот таблицы констант со слабой ссылкой на контейнер.
pub const REGISTRY_CONSTANT_INDEX: usize = 0;
pub(crate) const RESERVED_CONSTANTS: usize = 3;

/// Слабая ссылка на контейнер, хранимая в слоте 0 таблицы констант.
/// Скомпилированные выражения врапперов разыменовывают ее в момент
/// выполнения и падают, если контейнер уже уничтожен.
#[derive(Clone)]
pub struct RegistryWeakRef(pub(crate) Weak<Container>);

impl RegistryWeakRef {
    pub fn upgrade(&self) -> Result<Arc<Container>> {
        self.0
            .upgrade()
            .ok_or_else(|| ContainerError::ContainerIsGarbageCollected.into())
    }
}

/// View таблицы констант конкретного контейнера: слоты 0..2 свои у каждого
/// scoped контейнера, хвост (>= 3) общий между родителем и детьми, поэтому
/// индексы в разделяемых кэшированных выражениях валидны для всех.
#[derive(Clone)]
pub struct Constants {
    pub registry: Object,
    pub singleton_scope: Arc<Scope>,
    pub current_scope: Arc<Scope>,
    pub extra: Arc<Vec<Object>>,
}

impl Constants {
    pub fn get(&self, index: usize) -> Result<Object> {
        if index == REGISTRY_CONSTANT_INDEX {
            return Ok(self.registry.clone());
        }
        if index < RESERVED_CONSTANTS {
            return Err(anyhow!(
                "constant slot {index} is reserved and not addressable as object"
            ));
        }
        self.extra
            .get(index - RESERVED_CONSTANTS)
            .cloned()
            .ok_or_else(|| anyhow!("constant slot {index} is out of bounds"))
    }
}

static NEXT_PARAM_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_param_id() -> usize {
    NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Значение function wrapper: разрешенная функция от N объектов-аргументов.
#[derive(Clone)]
pub struct FuncValue {
    arity: usize,
    call: Arc<dyn Fn(Vec<Object>) -> Result<Object> + Send + Sync>,
}

impl FuncValue {
    pub fn new(
        arity: usize,
        call: Arc<dyn Fn(Vec<Object>) -> Result<Object> + Send + Sync>,
    ) -> Self {
        Self { arity, call }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn invoke(&self, args: Vec<Object>) -> Result<Object> {
        if args.len() != self.arity {
            return Err(anyhow!(
                "function wrapper expects {} argument(s), got {}",
                self.arity,
                args.len()
            ));
        }
        self.call.as_ref()(args)
    }

    pub fn invoke0(&self) -> Result<Object> {
        self.invoke(Vec::new())
    }

    /// Типизированный вызов без аргументов.
    pub fn invoke0_as<T: std::any::Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let object = self.invoke0()?;
        object.downcast::<T>().map_err(|_| {
            ContainerError::WrongResolvedObjectType {
                service_type: std::any::type_name::<T>().to_string(),
            }
            .into()
        })
    }
}

/// Пользовательский delegate, встраиваемый константой и вызываемый против
/// слабой ссылки на контейнер.
#[derive(Clone)]
pub struct DelegateValue {
    run: Arc<dyn Fn(&Arc<Container>) -> Result<Object> + Send + Sync>,
}

impl DelegateValue {
    pub fn new(run: Arc<dyn Fn(&Arc<Container>) -> Result<Object> + Send + Sync>) -> Self {
        Self { run }
    }

    pub fn invoke(&self, container: &Arc<Container>) -> Result<Object> {
        self.run.as_ref()(container)
    }
}

/// Источник scope для reuse-обертки.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScopeSource {
    Singleton,
    Current,
    Resolution,
}

/// Конструирующее выражение.
#[derive(Clone)]
pub enum Expr {
    /// Индекс в таблице констант контейнера.
    Constant { index: usize, service_type: TypeToken },
    /// Вызов конструктора реализации.
    New { ctor: Ctor, args: Vec<Expr> },
    /// Конструктор + инициализация writable членов.
    MemberInit {
        ctor: Ctor,
        args: Vec<Expr>,
        binds: Vec<(Member, Expr)>,
    },
    /// Параметр лямбды.
    Param { id: usize, service_type: TypeToken },
    /// Функциональная абстракция; при вычислении дает `FuncValue`.
    Lambda {
        params: Vec<(usize, TypeToken)>,
        body: Box<Expr>,
    },
    /// Применение: цель — `FuncValue` или `DelegateValue`.
    Invoke { target: Box<Expr>, args: Vec<Expr> },
    /// Снапшот-массив элементов.
    Array { item_type: TypeToken, items: Vec<Expr> },
    /// Reuse-обертка: get-or-add в выбранном scope по id фабрики.
    Scoped {
        source: ScopeSource,
        factory_id: usize,
        disposer: Option<DisposerFn>,
        body: Box<Expr>,
    },
}

impl Expr {
    /// Бета-редукция: подстановка выражения вместо параметра лямбды.
    pub fn substitute(&self, param_id: usize, replacement: &Expr) -> Expr {
        match self {
            Expr::Param { id, .. } if *id == param_id => replacement.clone(),
            Expr::Param { .. } | Expr::Constant { .. } => self.clone(),
            Expr::New { ctor, args } => Expr::New {
                ctor: ctor.clone(),
                args: args
                    .iter()
                    .map(|a| a.substitute(param_id, replacement))
                    .collect(),
            },
            Expr::MemberInit { ctor, args, binds } => Expr::MemberInit {
                ctor: ctor.clone(),
                args: args
                    .iter()
                    .map(|a| a.substitute(param_id, replacement))
                    .collect(),
                binds: binds
                    .iter()
                    .map(|(m, e)| (m.clone(), e.substitute(param_id, replacement)))
                    .collect(),
            },
            Expr::Lambda { params, body } => {
                // Затенение: внутренняя лямбда с тем же параметром не трогается
                if params.iter().any(|(id, _)| *id == param_id) {
                    self.clone()
                } else {
                    Expr::Lambda {
                        params: params.clone(),
                        body: Box::new(body.substitute(param_id, replacement)),
                    }
                }
            }
            Expr::Invoke { target, args } => Expr::Invoke {
                target: Box::new(target.substitute(param_id, replacement)),
                args: args
                    .iter()
                    .map(|a| a.substitute(param_id, replacement))
                    .collect(),
            },
            Expr::Array { item_type, items } => Expr::Array {
                item_type: item_type.clone(),
                items: items
                    .iter()
                    .map(|i| i.substitute(param_id, replacement))
                    .collect(),
            },
            Expr::Scoped {
                source,
                factory_id,
                disposer,
                body,
            } => Expr::Scoped {
                source: *source,
                factory_id: *factory_id,
                disposer: disposer.clone(),
                body: Box::new(body.substitute(param_id, replacement)),
            },
        }
    }

    /// Disposer конструируемого значения, если выражение его объявляет.
    pub(crate) fn find_disposer(&self) -> Option<DisposerFn> {
        match self {
            Expr::New { ctor, .. } | Expr::MemberInit { ctor, .. } => ctor.disposer(),
            Expr::Scoped { body, .. } => body.find_disposer(),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant { index, service_type } => write!(f, "const[{index}]: {service_type}"),
            Expr::New { ctor, args } => {
                write!(f, "new {}(", ctor.produced_type())?;
                join(f, args)?;
                write!(f, ")")
            }
            Expr::MemberInit { ctor, args, binds } => {
                write!(f, "new {}(", ctor.produced_type())?;
                join(f, args)?;
                write!(f, ") {{ ")?;
                for (i, (m, e)) in binds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {e}", m.name)?;
                }
                write!(f, " }}")
            }
            Expr::Param { id, service_type } => write!(f, "p{id}: {service_type}"),
            Expr::Lambda { params, body } => {
                write!(f, "(")?;
                for (i, (id, t)) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "p{id}: {t}")?;
                }
                write!(f, ") => {body}")
            }
            Expr::Invoke { target, args } => {
                write!(f, "({target})(")?;
                join(f, args)?;
                write!(f, ")")
            }
            Expr::Array { item_type, items } => {
                write!(f, "new {item_type}[] {{ ")?;
                join(f, items)?;
                write!(f, " }}")
            }
            Expr::Scoped {
                source,
                factory_id,
                body,
                ..
            } => write!(f, "scoped({source:?}, #{factory_id}, {body})"),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Окружение параметров лямбд во время выполнения: персистентный список.
#[derive(Clone, Default)]
pub(crate) struct Env(Option<Arc<EnvNode>>);

struct EnvNode {
    id: usize,
    value: Object,
    next: Env,
}

impl Env {
    fn bind(&self, id: usize, value: Object) -> Env {
        Env(Some(Arc::new(EnvNode {
            id,
            value,
            next: self.clone(),
        })))
    }

    fn lookup(&self, id: usize) -> Option<Object> {
        let mut node = self.0.as_ref();
        while let Some(n) = node {
            if n.id == id {
                return Some(n.value.clone());
            }
            node = n.next.0.as_ref();
        }
        None
    }
}

type EvalFn = Arc<dyn Fn(&Constants, &mut ResolutionScope, &Env) -> Result<Object> + Send + Sync>;

/// Скомпилировать выражение в замкнутую фабрику.
pub fn compile_factory(expr: &Expr) -> CompiledFactory {
    let eval = compile(expr);
    Arc::new(move |constants, resolution_scope| {
        eval.as_ref()(constants, resolution_scope, &Env::default())
    })
}

fn compile(expr: &Expr) -> EvalFn {
    match expr {
        Expr::Constant { index, .. } => {
            let index = *index;
            Arc::new(move |constants, _, _| constants.get(index))
        }
        Expr::New { ctor, args } => {
            let ctor = ctor.clone();
            let args: Vec<EvalFn> = args.iter().map(compile).collect();
            Arc::new(move |constants, scope, env| {
                let mut values = Vec::with_capacity(args.len());
                for a in &args {
                    values.push(a.as_ref()(constants, scope, env)?);
                }
                let boxed = ctor.invoke(values)?;
                Ok(Arc::from(boxed))
            })
        }
        Expr::MemberInit { ctor, args, binds } => {
            let ctor = ctor.clone();
            let args: Vec<EvalFn> = args.iter().map(compile).collect();
            let binds: Vec<(Member, EvalFn)> = binds
                .iter()
                .map(|(m, e)| (m.clone(), compile(e)))
                .collect();
            Arc::new(move |constants, scope, env| {
                let mut values = Vec::with_capacity(args.len());
                for a in &args {
                    values.push(a.as_ref()(constants, scope, env)?);
                }
                let mut boxed = ctor.invoke(values)?;
                for (member, bind) in &binds {
                    let value = bind.as_ref()(constants, scope, env)?;
                    member.set(boxed.as_mut(), value)?;
                }
                Ok(Arc::from(boxed))
            })
        }
        Expr::Param { id, .. } => {
            let id = *id;
            Arc::new(move |_, _, env| {
                env.lookup(id)
                    .ok_or_else(|| anyhow!("unbound lambda parameter p{id}"))
            })
        }
        Expr::Lambda { params, body } => {
            let params = params.clone();
            let body = compile(body);
            Arc::new(move |constants, _, env| {
                let constants = constants.clone();
                let env = env.clone();
                let body = body.clone();
                let params = params.clone();
                let arity = params.len();
                let call = move |args: Vec<Object>| -> Result<Object> {
                    let mut bound = env.clone();
                    for ((id, _), value) in params.iter().zip(args) {
                        bound = bound.bind(*id, value);
                    }
                    // Вызов разрешенной функции — новый top-level resolve:
                    // свой слот resolution scope на каждый вызов.
                    let mut resolution_scope: ResolutionScope = None;
                    body.as_ref()(&constants, &mut resolution_scope, &bound)
                };
                Ok(Arc::new(FuncValue::new(arity, Arc::new(call))) as Object)
            })
        }
        Expr::Invoke { target, args } => {
            let target = compile(target);
            let args: Vec<EvalFn> = args.iter().map(compile).collect();
            Arc::new(move |constants, scope, env| {
                let callee = target.as_ref()(constants, scope, env)?;
                if let Ok(func) = callee.clone().downcast::<FuncValue>() {
                    let mut values = Vec::with_capacity(args.len());
                    for a in &args {
                        values.push(a.as_ref()(constants, scope, env)?);
                    }
                    return func.invoke(values);
                }
                if let Ok(delegate) = callee.downcast::<DelegateValue>() {
                    let registry_arg = args
                        .first()
                        .ok_or_else(|| anyhow!("delegate invocation misses registry argument"))?;
                    let registry = registry_arg.as_ref()(constants, scope, env)?;
                    let weak = registry.downcast::<RegistryWeakRef>().map_err(|_| {
                        anyhow!("delegate invocation expects registry weak reference argument")
                    })?;
                    let container = weak.upgrade()?;
                    return delegate.invoke(&container);
                }
                Err(anyhow!("invocation target is neither function nor delegate"))
            })
        }
        Expr::Array { items, .. } => {
            let items: Vec<EvalFn> = items.iter().map(compile).collect();
            Arc::new(move |constants, scope, env| {
                let mut values = Vec::with_capacity(items.len());
                for item in &items {
                    values.push(item.as_ref()(constants, scope, env)?);
                }
                Ok(Arc::new(values) as Object)
            })
        }
        Expr::Scoped {
            source,
            factory_id,
            disposer,
            body,
        } => {
            let source = *source;
            let factory_id = *factory_id;
            let disposer = disposer.clone();
            let body = compile(body);
            Arc::new(move |constants, resolution_scope, env| {
                let scope: Arc<Scope> = match source {
                    ScopeSource::Singleton => constants.singleton_scope.clone(),
                    ScopeSource::Current => constants.current_scope.clone(),
                    ScopeSource::Resolution => resolution_scope
                        .get_or_insert_with(|| Arc::new(Scope::new()))
                        .clone(),
                };
                // Конструктор видит тот же слот resolution scope, что и
                // остальные выражения этого top-level вызова: вложенный
                // InResolutionScope сервис, инициализировавший слот внутри
                // scoped-конструирования, разделяется с siblings
                let mut create = || -> Result<ScopedItem> {
                    let object = body.as_ref()(constants, &mut *resolution_scope, env)?;
                    let tracked = disposer.as_ref().and_then(|d| d.as_ref()(&object));
                    Ok((object, tracked))
                };
                scope.get_or_add(factory_id, &mut create)
            })
        }
    }
}

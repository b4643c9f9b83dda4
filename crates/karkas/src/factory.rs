//! Фабрики: зарегистрированные рецепты конструирования сервисов.
//!
//! `Factory` — заголовок (id, reuse, setup) плюс тело-вариант:
//! - Reflection: конструирование по дескриптору конструктора реализации
//!   (закрытому или open-generic со специализацией per request);
//! - Delegate: пользовательская функция `(request, registry) -> expression`;
//! - Provider: отложенный выбор фабрики per request (open-generics,
//!   metadata matching).
//!
//! Дескрипторы (`Ctor`, `Member`, `OpenImpl`) заменяют runtime reflection:
//! список параметров и мономорфное замыкание конструирования объявляются
//! при регистрации.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::container::Container;
use crate::errors::ContainerError;
use crate::expression::{DisposerFn, Expr};
use crate::request::{DependencyInfo, FactoryType, Request};
use crate::reuse::Reuse;
use crate::scope::Disposable;
use crate::type_token::{ServiceKey, TypeToken};
use crate::Object;

/// Глобальный монотонный счетчик id фабрик. Единственное глобальное
/// состояние системы; инкременты атомарны.
static NEXT_FACTORY_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_factory_id() -> usize {
    NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed)
}

type CtorInvokeFn = Arc<dyn Fn(Vec<Object>) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;
type SetterFn = Arc<dyn Fn(&mut dyn Any, Object) -> Result<()> + Send + Sync>;
type SpecializeFn = Arc<dyn Fn(&[TypeToken]) -> Result<ClosedImpl> + Send + Sync>;
/// Пользовательская функция delegate-фабрики; `None` — отказ построить
/// выражение.
pub type DelegateExprFn =
    Arc<dyn Fn(&Request, &Arc<Container>) -> Result<Option<Expr>> + Send + Sync>;
pub type ProvideFn =
    Arc<dyn Fn(&Request, &Arc<Container>) -> Result<Option<Factory>> + Send + Sync>;
pub type ApplicableFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Разрешенные аргументы конструктора, выдаваемые по порядку объявления.
pub struct Args {
    objects: Vec<Object>,
    index: usize,
}

impl Args {
    fn new(objects: Vec<Object>) -> Self {
        Self { objects, index: 0 }
    }

    pub fn take_object(&mut self) -> Result<Object> {
        let object = self
            .objects
            .get(self.index)
            .cloned()
            .ok_or_else(|| anyhow!("constructor argument {} is missing", self.index))?;
        self.index += 1;
        Ok(object)
    }

    pub fn take<T: Any + Send + Sync>(&mut self) -> Result<Arc<T>> {
        let object = self.take_object()?;
        object.downcast::<T>().map_err(|_| {
            ContainerError::WrongResolvedObjectType {
                service_type: std::any::type_name::<T>().to_string(),
            }
            .into()
        })
    }
}

/// Параметр конструктора: имя для диагностики + тип сервиса.
#[derive(Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub service_type: TypeToken,
}

impl ParamSpec {
    pub fn of<T: Any>(name: &'static str) -> Self {
        Self {
            name,
            service_type: TypeToken::of::<T>(),
        }
    }

    pub fn new(name: &'static str, service_type: TypeToken) -> Self {
        Self { name, service_type }
    }
}

/// Дескриптор конструктора: параметры и мономорфное замыкание вызова.
#[derive(Clone)]
pub struct Ctor {
    pub params: Vec<ParamSpec>,
    produced: TypeToken,
    invoke: CtorInvokeFn,
    disposer: Option<DisposerFn>,
}

impl Ctor {
    pub fn of<T, F>(params: Vec<ParamSpec>, make: F) -> Ctor
    where
        T: Any + Send + Sync,
        F: Fn(&mut Args) -> Result<T> + Send + Sync + 'static,
    {
        Ctor {
            params,
            produced: TypeToken::of::<T>(),
            invoke: Arc::new(move |objects| {
                let mut args = Args::new(objects);
                let value = make(&mut args)?;
                Ok(Box::new(value) as Box<dyn Any + Send + Sync>)
            }),
            disposer: None,
        }
    }

    /// Как `of`, но созданные экземпляры отслеживаются scope'ом и
    /// освобождаются при его закрытии.
    pub fn of_disposable<T, F>(params: Vec<ParamSpec>, make: F) -> Ctor
    where
        T: Any + Send + Sync + Disposable,
        F: Fn(&mut Args) -> Result<T> + Send + Sync + 'static,
    {
        let mut ctor = Ctor::of::<T, F>(params, make);
        ctor.disposer = Some(Arc::new(|object: &Object| {
            object
                .clone()
                .downcast::<T>()
                .ok()
                .map(|typed| typed as Arc<dyn Disposable>)
        }));
        ctor
    }

    pub(crate) fn invoke(&self, args: Vec<Object>) -> Result<Box<dyn Any + Send + Sync>> {
        self.invoke.as_ref()(args)
    }

    pub(crate) fn disposer(&self) -> Option<DisposerFn> {
        self.disposer.clone()
    }

    pub fn produced_type(&self) -> &TypeToken {
        &self.produced
    }
}

/// Writable член реализации для инъекции после конструирования.
#[derive(Clone)]
pub struct Member {
    pub name: &'static str,
    pub service_type: TypeToken,
    setter: SetterFn,
}

impl Member {
    pub fn of<T, V, F>(name: &'static str, assign: F) -> Member
    where
        T: Any,
        V: Any + Send + Sync,
        F: Fn(&mut T, Arc<V>) + Send + Sync + 'static,
    {
        Member {
            name,
            service_type: TypeToken::of::<V>(),
            setter: Arc::new(move |target, value| {
                let target = target
                    .downcast_mut::<T>()
                    .ok_or_else(|| anyhow!("member \"{name}\" target type mismatch"))?;
                let value = value.downcast::<V>().map_err(|_| {
                    ContainerError::WrongResolvedObjectType {
                        service_type: std::any::type_name::<V>().to_string(),
                    }
                })?;
                assign(target, value);
                Ok(())
            }),
        }
    }

    pub(crate) fn set(&self, target: &mut dyn Any, value: Object) -> Result<()> {
        self.setter.as_ref()(target, value)
    }
}

/// Закрытая реализация: конкретный тип, объявленные service view,
/// конструкторы и инжектируемые члены.
#[derive(Clone)]
pub struct ClosedImpl {
    pub impl_type: TypeToken,
    pub views: Vec<TypeToken>,
    pub ctors: Vec<Ctor>,
    pub members: Vec<Member>,
}

impl ClosedImpl {
    pub fn of<T: Any>(ctor: Ctor) -> Self {
        Self {
            impl_type: TypeToken::of::<T>(),
            views: Vec::new(),
            ctors: vec![ctor],
            members: Vec::new(),
        }
    }

    pub fn new(impl_type: TypeToken) -> Self {
        Self {
            impl_type,
            views: Vec::new(),
            ctors: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn with_view(mut self, view: TypeToken) -> Self {
        self.views.push(view);
        self
    }

    pub fn with_ctor(mut self, ctor: Ctor) -> Self {
        self.ctors.push(ctor);
        self
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }
}

/// Open-generic реализация: generic определение, реализуемые open view
/// (формы над переменными собственных параметров) и специализатор,
/// выдающий закрытый дескриптор для выведенных аргументов.
#[derive(Clone)]
pub struct OpenImpl {
    pub def: crate::type_token::GenericDef,
    pub views: Vec<TypeToken>,
    specialize: SpecializeFn,
}

impl OpenImpl {
    pub fn new<F>(
        def: crate::type_token::GenericDef,
        views: Vec<TypeToken>,
        specialize: F,
    ) -> Self
    where
        F: Fn(&[TypeToken]) -> Result<ClosedImpl> + Send + Sync + 'static,
    {
        Self {
            def,
            views,
            specialize: Arc::new(specialize),
        }
    }
}

/// Метаданные поведения фабрики: сервис / generic wrapper / декоратор.
#[derive(Clone)]
pub enum Setup {
    Service {
        cache_expression: bool,
        metadata: Option<(TypeToken, Object)>,
    },
    GenericWrapper {
        /// Индекс обернутого аргумента; `None` допустим только при арности 1.
        wrapped_arg_index: Option<usize>,
    },
    Decorator {
        condition: Option<ApplicableFn>,
    },
}

impl Setup {
    pub fn service() -> Setup {
        Setup::Service {
            cache_expression: true,
            metadata: None,
        }
    }

    pub fn service_no_cache() -> Setup {
        Setup::Service {
            cache_expression: false,
            metadata: None,
        }
    }

    pub fn with_metadata<M: Any + Send + Sync>(metadata: M) -> Setup {
        Setup::Service {
            cache_expression: true,
            metadata: Some((TypeToken::of::<M>(), Arc::new(metadata) as Object)),
        }
    }

    pub fn wrapper() -> Setup {
        Setup::GenericWrapper {
            wrapped_arg_index: None,
        }
    }

    pub fn wrapper_at(index: usize) -> Setup {
        Setup::GenericWrapper {
            wrapped_arg_index: Some(index),
        }
    }

    pub fn decorator() -> Setup {
        Setup::Decorator { condition: None }
    }

    pub fn decorator_when<F>(condition: F) -> Setup
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        Setup::Decorator {
            condition: Some(Arc::new(condition)),
        }
    }

    pub fn factory_type(&self) -> FactoryType {
        match self {
            Setup::Service { .. } => FactoryType::Service,
            Setup::GenericWrapper { .. } => FactoryType::GenericWrapper,
            Setup::Decorator { .. } => FactoryType::Decorator,
        }
    }

    /// Декораторы и open-формы врапперов выражения не кэшируют: выражение
    /// враппера зависит от закрытого типа запроса, а не только от фабрики.
    pub(crate) fn cache_expression(&self) -> bool {
        match self {
            Setup::Service { cache_expression, .. } => *cache_expression,
            Setup::GenericWrapper { .. } => false,
            Setup::Decorator { .. } => false,
        }
    }

    pub fn metadata(&self) -> Option<&(TypeToken, Object)> {
        match self {
            Setup::Service { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }

    pub fn metadata_object(&self) -> Option<Object> {
        self.metadata().map(|(_, object)| object.clone())
    }

    pub(crate) fn is_applicable(&self, request: &Request) -> bool {
        match self {
            Setup::Decorator { condition } => condition
                .as_ref()
                .map_or(true, |cond| cond.as_ref()(request)),
            _ => true,
        }
    }

    pub(crate) fn wrapped_arg_index(&self) -> usize {
        match self {
            Setup::GenericWrapper { wrapped_arg_index } => wrapped_arg_index.unwrap_or(0),
            _ => 0,
        }
    }
}

#[derive(Clone)]
pub enum ImplDesc {
    Closed(ClosedImpl),
    Open(OpenImpl),
}

#[derive(Clone)]
pub enum FactoryBody {
    Reflection(ImplDesc),
    Delegate(DelegateExprFn),
    Provider(ProvideFn),
}

/// Зарегистрированный рецепт конструирования сервиса.
#[derive(Clone)]
pub struct Factory {
    pub id: usize,
    pub reuse: Option<Reuse>,
    pub setup: Setup,
    pub body: FactoryBody,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory").field("id", &self.id).finish()
    }
}

impl Factory {
    pub fn reflection_closed(closed: ClosedImpl, reuse: Option<Reuse>, setup: Setup) -> Factory {
        Factory {
            id: next_factory_id(),
            reuse,
            setup,
            body: FactoryBody::Reflection(ImplDesc::Closed(closed)),
        }
    }

    pub fn reflection_open(open: OpenImpl, reuse: Option<Reuse>, setup: Setup) -> Factory {
        Factory {
            id: next_factory_id(),
            reuse,
            setup,
            body: FactoryBody::Reflection(ImplDesc::Open(open)),
        }
    }

    pub fn delegate<F>(make: F, reuse: Option<Reuse>, setup: Setup) -> Factory
    where
        F: Fn(&Request, &Arc<Container>) -> Result<Option<Expr>> + Send + Sync + 'static,
    {
        Factory {
            id: next_factory_id(),
            reuse,
            setup,
            body: FactoryBody::Delegate(Arc::new(make)),
        }
    }

    pub fn provider<F>(get: F, setup: Setup) -> Factory
    where
        F: Fn(&Request, &Arc<Container>) -> Result<Option<Factory>> + Send + Sync + 'static,
    {
        Factory {
            id: next_factory_id(),
            reuse: None,
            setup,
            body: FactoryBody::Provider(Arc::new(get)),
        }
    }

    pub fn factory_type(&self) -> FactoryType {
        self.setup.factory_type()
    }

    pub fn implementation_type(&self) -> Option<TypeToken> {
        match &self.body {
            FactoryBody::Reflection(ImplDesc::Closed(closed)) => Some(closed.impl_type.clone()),
            FactoryBody::Reflection(ImplDesc::Open(open)) => Some(open.def.open()),
            _ => None,
        }
    }

    pub fn provides_factory_per_request(&self) -> bool {
        matches!(
            &self.body,
            FactoryBody::Provider(_) | FactoryBody::Reflection(ImplDesc::Open(_))
        )
    }

    /// Специализированная фабрика для конкретного запроса: open-generic
    /// закрывается унификацией, provider решает сам.
    pub fn get_factory_per_request(
        &self,
        request: &Request,
        container: &Arc<Container>,
    ) -> Result<Option<Factory>> {
        match &self.body {
            FactoryBody::Provider(get) => get.as_ref()(request, container),
            FactoryBody::Reflection(ImplDesc::Open(open)) => self.specialize_open(open, request),
            _ => Ok(None),
        }
    }

    fn specialize_open(&self, open: &OpenImpl, request: &Request) -> Result<Option<Factory>> {
        let service = &request.service_type;
        let service_def = match service.generic_def() {
            Some(def) => def,
            None => return Ok(None),
        };
        let self_view = open.def.open();
        for view in open.views.iter().chain(std::iter::once(&self_view)) {
            if view.generic_def() != Some(service_def) {
                continue;
            }
            let mut bound: Vec<Option<TypeToken>> = vec![None; open.def.arity()];
            if !view.unify(service, &mut bound) {
                continue;
            }
            let mut closed_args = Vec::with_capacity(bound.len());
            for slot in &bound {
                match slot {
                    Some(token) => closed_args.push(token.clone()),
                    None => {
                        return Err(ContainerError::UnableToFindOpenGenericImplTypeArg {
                            impl_type: open.def.open().to_string(),
                            service_type: service.to_string(),
                        }
                        .into())
                    }
                }
            }
            let mut closed = open.specialize.as_ref()(&closed_args)?;
            for open_view in &open.views {
                if let Some(closed_view) = open_view.substitute(&bound) {
                    if !closed.views.contains(&closed_view) {
                        closed.views.push(closed_view);
                    }
                }
            }
            debug!(
                service = %service,
                implementation = %closed.impl_type,
                "specialized open-generic registration"
            );
            return Ok(Some(Factory {
                id: next_factory_id(),
                reuse: self.reuse,
                setup: self.setup.clone(),
                body: FactoryBody::Reflection(ImplDesc::Closed(closed)),
            }));
        }
        Ok(None)
    }

    /// Проверка совместимости при регистрации.
    pub(crate) fn validate_registrable(&self, service_type: &TypeToken) -> Result<()> {
        if let Setup::GenericWrapper { wrapped_arg_index } = &self.setup {
            if let Some(def) = service_type.generic_def() {
                if def.arity() > 1 && wrapped_arg_index.is_none() {
                    return Err(ContainerError::GenericWrapperExpectsSingleTypeArgByDefault {
                        wrapper_type: service_type.to_string(),
                    }
                    .into());
                }
            }
        }
        match &self.body {
            FactoryBody::Reflection(ImplDesc::Closed(closed)) => {
                if closed.ctors.is_empty() {
                    return Err(ContainerError::ExpectedNonAbstractImplType {
                        impl_type: closed.impl_type.to_string(),
                    }
                    .into());
                }
                if service_type.is_open() {
                    return Err(
                        ContainerError::UnableToRegisterOpenGenericImplWithNonGenericService {
                            impl_type: closed.impl_type.to_string(),
                            service_type: service_type.to_string(),
                        }
                        .into(),
                    );
                }
                if *service_type != closed.impl_type && !closed.views.contains(service_type) {
                    return Err(ContainerError::ExpectedImplAssignableToService {
                        impl_type: closed.impl_type.to_string(),
                        service_type: service_type.to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            FactoryBody::Reflection(ImplDesc::Open(open)) => {
                if !service_type.is_open() {
                    return Err(
                        ContainerError::UnableToRegisterOpenGenericImplWithNonGenericService {
                            impl_type: open.def.open().to_string(),
                            service_type: service_type.to_string(),
                        }
                        .into(),
                    );
                }
                let service_def = match service_type.generic_def() {
                    Some(def) => def,
                    None => {
                        return Err(ContainerError::ExpectedImplAssignableToService {
                            impl_type: open.def.open().to_string(),
                            service_type: service_type.to_string(),
                        }
                        .into())
                    }
                };
                if service_def == &open.def {
                    return Ok(());
                }
                let view = open
                    .views
                    .iter()
                    .find(|v| v.generic_def() == Some(service_def))
                    .ok_or_else(|| ContainerError::ExpectedImplAssignableToService {
                        impl_type: open.def.open().to_string(),
                        service_type: service_type.to_string(),
                    })?;
                let mut vars = HashSet::new();
                collect_vars(view, &mut vars);
                if (0..open.def.arity()).any(|i| !vars.contains(&i)) {
                    return Err(ContainerError::OpenGenericImplDoesNotSpecifyAllTypeArgs {
                        impl_type: open.def.open().to_string(),
                        service_type: service_type.to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Пайплайн получения выражения: закрепление фабрики за запросом,
    /// декораторы, кэш по id, reuse.
    pub fn get_expression(&self, request: &Request, container: &Arc<Container>) -> Result<Expr> {
        let request = request.resolved_to(self)?;

        let decorator = if request.decorated_factory_id == self.id {
            None
        } else {
            container.get_decorator_expression_or_default(&request)?
        };
        if let Some(expr) = &decorator {
            if !matches!(expr, Expr::Lambda { .. }) {
                // Декоратор-замена: возвращается вместо сервисного выражения
                return Ok(expr.clone());
            }
        }

        let service_expr = match container.get_cached_factory_expression(self.id) {
            Some(cached) => cached,
            None => {
                let core = self.create_expression(&request, container)?;
                let wrapped = match self.reuse {
                    Some(reuse) => reuse.apply(core, self, &request, container)?,
                    None => core,
                };
                if self.setup.cache_expression() {
                    container.cache_factory_expression(self.id, &wrapped)?;
                }
                wrapped
            }
        };

        match decorator {
            Some(Expr::Lambda { params, body }) => {
                let (param_id, _) = params
                    .first()
                    .ok_or_else(|| anyhow!("decorator lambda without parameter"))?;
                Ok(body.substitute(*param_id, &service_expr))
            }
            _ => Ok(service_expr),
        }
    }

    pub(crate) fn create_expression(
        &self,
        request: &Request,
        container: &Arc<Container>,
    ) -> Result<Expr> {
        match &self.body {
            FactoryBody::Reflection(ImplDesc::Closed(closed)) => {
                self.reflection_expr(closed, request, container, None)
            }
            FactoryBody::Reflection(ImplDesc::Open(_)) => Err(anyhow!(
                "open-generic factory must be specialized before expression synthesis"
            )),
            FactoryBody::Delegate(make) => {
                make.as_ref()(request, container)?.ok_or_else(|| {
                    ContainerError::DelegateFactoryExpressionReturnedNull {
                        request: request.to_string(),
                    }
                    .into()
                })
            }
            FactoryBody::Provider(_) => Err(anyhow!(
                "provider factory must be resolved to a concrete factory before expression synthesis"
            )),
        }
    }

    /// Синтез function-wrapper выражения: лямбда с параметрами `func_params`,
    /// где параметры конструктора жадно сопоставляются по типу.
    pub(crate) fn func_expression(
        &self,
        func_params: &[(usize, TypeToken)],
        request: &Request,
        container: &Arc<Container>,
    ) -> Result<Expr> {
        match &self.body {
            FactoryBody::Reflection(ImplDesc::Closed(closed)) => {
                self.reflection_expr(closed, request, container, Some(func_params))
            }
            _ => Err(ContainerError::UnsupportedFuncWithArgs {
                request: request.to_string(),
            }
            .into()),
        }
    }

    fn reflection_expr(
        &self,
        closed: &ClosedImpl,
        request: &Request,
        container: &Arc<Container>,
        func_params: Option<&[(usize, TypeToken)]>,
    ) -> Result<Expr> {
        let rules = container.rules_snapshot();
        let ctor = match &rules.constructor_selector {
            Some(select) => select.as_ref()(&closed.ctors, request).ok_or_else(|| {
                ContainerError::UnableToSelectConstructor {
                    impl_type: closed.impl_type.to_string(),
                    count: closed.ctors.len(),
                }
            })?,
            None => match closed.ctors.len() {
                0 => {
                    return Err(ContainerError::NoPublicConstructorDefined {
                        impl_type: closed.impl_type.to_string(),
                    }
                    .into())
                }
                1 => closed.ctors[0].clone(),
                count => {
                    return Err(ContainerError::UnableToSelectConstructor {
                        impl_type: closed.impl_type.to_string(),
                        count,
                    }
                    .into())
                }
            },
        };

        let mut used = vec![false; func_params.map_or(0, |p| p.len())];
        let mut args = Vec::with_capacity(ctor.params.len());
        for param in &ctor.params {
            if let Some(fps) = func_params {
                let matched = fps
                    .iter()
                    .enumerate()
                    .find(|(i, (_, t))| !used[*i] && *t == param.service_type)
                    .map(|(i, _)| i);
                if let Some(pos) = matched {
                    used[pos] = true;
                    let (id, token) = &fps[pos];
                    args.push(Expr::Param {
                        id: *id,
                        service_type: token.clone(),
                    });
                    continue;
                }
            }

            let dependency = Some(DependencyInfo::Parameter { name: param.name });
            let key = rules.parameter_key(param, request);
            let child = if self.factory_type() == FactoryType::Service {
                request.push(
                    param.service_type.clone(),
                    key.unwrap_or(ServiceKey::Default),
                    dependency,
                )
            } else {
                // Декораторы и врапперы наследуют ключ родителя
                match key {
                    Some(k) => request.push(param.service_type.clone(), k, dependency),
                    None => {
                        request.push_preserving_parent_key(param.service_type.clone(), dependency)
                    }
                }
            };

            let child_factory = if func_params.is_some() {
                container.try_get_factory(&child)?.ok_or_else(|| {
                    ContainerError::ConstructorMissesSomeParameters {
                        impl_type: closed.impl_type.to_string(),
                        param: param.name.to_string(),
                        request: child.to_string(),
                    }
                })?
            } else {
                container.get_factory(&child)?
            };
            args.push(child_factory.get_expression(&child, container)?);
        }

        if let Some(fps) = func_params {
            let unused: Vec<String> = fps
                .iter()
                .zip(&used)
                .filter(|(_, was_used)| !**was_used)
                .map(|((_, token), _)| token.to_string())
                .collect();
            if !unused.is_empty() {
                return Err(ContainerError::SomeFuncParamsAreUnused {
                    unused: unused.join(", "),
                    request: request.to_string(),
                }
                .into());
            }
        }

        let mut binds = Vec::new();
        for member in &closed.members {
            if let Some(key) = rules.member_key(member, request) {
                let child = request.push(
                    member.service_type.clone(),
                    key,
                    Some(DependencyInfo::Member { name: member.name }),
                );
                let member_factory = container.get_factory(&child)?;
                binds.push((
                    member.clone(),
                    member_factory.get_expression(&child, container)?,
                ));
            }
        }

        let core = if binds.is_empty() {
            Expr::New { ctor, args }
        } else {
            Expr::MemberInit { ctor, args, binds }
        };
        match func_params {
            Some(fps) => Ok(Expr::Lambda {
                params: fps.to_vec(),
                body: Box::new(core),
            }),
            None => Ok(core),
        }
    }
}

fn collect_vars(token: &TypeToken, out: &mut HashSet<usize>) {
    match token {
        TypeToken::Var(i) => {
            out.insert(*i);
        }
        TypeToken::Generic { args, .. } => {
            for a in args {
                collect_vars(a, out);
            }
        }
        TypeToken::Plain { .. } => {}
    }
}

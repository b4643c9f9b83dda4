//! Контейнер: таблицы регистраций, точки входа разрешения, кэши и scopes.
//!
//! АРХИТЕКТУРА РАЗРЕШЕНИЯ:
//! - Горячий путь: lock-free lookup скомпилированной фабрики в persistent
//!   trie по типу (и ключу) и немедленный вызов
//! - Холодный путь: построение цепочки Request, выбор Factory, синтез
//!   expression (рекурсивно для зависимостей), декораторы, reuse,
//!   компиляция и публикация в кэш атомарным swap
//! - Таблицы фабрик и декораторов — под одним мьютексом контейнера,
//!   разделяемым со scoped детьми
//!
//! Регистрация инвалидирует resolution кэши целиком (registry считается
//! почти статичным); кэш выражений по id фабрики живет до teardown, на этом
//! держится snapshot-семантика enumerable.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::errors::ContainerError;
use crate::expression::{
    compile_factory, CompiledFactory, Constants, DelegateValue, Expr, RegistryWeakRef,
    ResolutionScope, REGISTRY_CONSTANT_INDEX, RESERVED_CONSTANTS,
};
use crate::factory::{ClosedImpl, Ctor, Factory, FactoryBody, ImplDesc, OpenImpl, Setup};
use crate::hash_trie::{CacheRef, HashTrie};
use crate::request::{FactoryType, Request};
use crate::reuse::Reuse;
use crate::rules::ResolutionRules;
use crate::scope::Scope;
use crate::stats::{ContainerStats, StatsInner};
use crate::type_token::{ServiceKey, TypeToken};
use crate::wrappers;
use crate::Object;

/// Поведение при неразрешимом сервисе.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IfUnresolved {
    Throw,
    ReturnNull,
}

/// Запись декоратора: фабрика + мемоизированная лямбда.
struct DecoratorEntry {
    factory: Factory,
    cached_expression: Option<Expr>,
    /// id open-generic фабрики, из которой запись специализирована.
    origin_open_id: Option<usize>,
}

/// Регистрации одного типа сервиса.
#[derive(Default)]
struct FactoriesEntry {
    /// Последняя default регистрация; единственная, пока их не станет >= 2.
    last_default: Option<Factory>,
    /// Индексированное дерево default регистраций (ключ = индекс вставки);
    /// заполняется только при >= 2 default.
    default_factories: Option<HashTrie<usize, Factory>>,
    default_count: usize,
    max_default_index: usize,
    named: Option<HashTrie<String, Factory>>,
}

#[derive(Default)]
struct Tables {
    factories: HashMap<TypeToken, FactoriesEntry>,
    decorators: HashMap<TypeToken, Vec<DecoratorEntry>>,
}

pub struct Container {
    tables: Arc<Mutex<Tables>>,
    rules: Arc<RwLock<ResolutionRules>>,
    default_cache: Arc<CacheRef<HashTrie<TypeToken, CompiledFactory>>>,
    keyed_cache: Arc<CacheRef<HashTrie<(TypeToken, ServiceKey), CompiledFactory>>>,
    expression_cache: Arc<CacheRef<HashTrie<usize, Expr>>>,
    /// Copy-on-write хвост таблицы констант (слоты >= 3); общий с детьми.
    extra_constants: Arc<RwLock<Arc<Vec<Object>>>>,
    singleton_scope: Arc<Scope>,
    current_scope: Arc<Scope>,
    /// Слот 0: слабая ссылка на самого себя как Object.
    self_object: Object,
    weak_self: Weak<Container>,
    owns_singletons: bool,
    stats: Arc<StatsInner>,
}

impl Container {
    /// Контейнер с набором врапперов по умолчанию (func, lazy, many, meta,
    /// debug-expression) и правилом enumerable.
    pub fn new() -> Result<Arc<Container>> {
        let container = Self::minimal();
        wrappers::install_default_wrappers(&container)?;
        Ok(container)
    }

    /// Пустой контейнер: без встроенных врапперов и правил.
    pub fn minimal() -> Arc<Container> {
        Arc::new_cyclic(|weak: &Weak<Container>| Container {
            tables: Arc::new(Mutex::new(Tables::default())),
            rules: Arc::new(RwLock::new(ResolutionRules::default())),
            default_cache: Arc::new(CacheRef::default()),
            keyed_cache: Arc::new(CacheRef::default()),
            expression_cache: Arc::new(CacheRef::default()),
            extra_constants: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            singleton_scope: Arc::new(Scope::new()),
            current_scope: Arc::new(Scope::new()),
            self_object: Arc::new(RegistryWeakRef(weak.clone())) as Object,
            weak_self: weak.clone(),
            owns_singletons: true,
            stats: Arc::new(StatsInner::default()),
        })
    }

    /// Scoped потомок: общие таблицы, правила, кэши, singleton scope и
    /// константы; свежий current scope и свой слот 0.
    pub fn open_scope(&self) -> Arc<Container> {
        debug!("opening scoped container");
        Arc::new_cyclic(|weak: &Weak<Container>| Container {
            tables: self.tables.clone(),
            rules: self.rules.clone(),
            default_cache: self.default_cache.clone(),
            keyed_cache: self.keyed_cache.clone(),
            expression_cache: self.expression_cache.clone(),
            extra_constants: self.extra_constants.clone(),
            singleton_scope: self.singleton_scope.clone(),
            current_scope: Arc::new(Scope::new()),
            self_object: Arc::new(RegistryWeakRef(weak.clone())) as Object,
            weak_self: weak.clone(),
            owns_singletons: false,
            stats: self.stats.clone(),
        })
    }

    /// Teardown: закрывает current scope; singleton scope — только у
    /// контейнера-корня, который им владеет.
    pub fn dispose(&self) {
        self.current_scope.dispose();
        if self.owns_singletons {
            self.singleton_scope.dispose();
        }
    }

    pub fn stats(&self) -> ContainerStats {
        self.stats.snapshot()
    }

    pub fn update_rules(&self, update: impl FnOnce(&mut ResolutionRules)) {
        update(&mut *self.rules.write());
    }

    pub(crate) fn rules_snapshot(&self) -> ResolutionRules {
        self.rules.read().clone()
    }

    /// Сильная ссылка на самого себя для передачи в фабрики.
    fn strong_self(&self) -> Result<Arc<Container>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| ContainerError::ContainerIsGarbageCollected.into())
    }

    // === РЕГИСТРАЦИЯ ===

    /// Зарегистрировать фабрику под типом сервиса и ключом.
    pub fn register(
        &self,
        factory: Factory,
        service_type: TypeToken,
        service_key: Option<ServiceKey>,
    ) -> Result<Factory> {
        factory.validate_registrable(&service_type)?;

        if factory.factory_type() == FactoryType::Decorator {
            let mut tables = self.tables.lock();
            tables
                .decorators
                .entry(service_type.clone())
                .or_default()
                .push(DecoratorEntry {
                    factory: factory.clone(),
                    cached_expression: None,
                    origin_open_id: None,
                });
            drop(tables);
            self.invalidate_resolution_caches()?;
            self.stats.record_registration();
            debug!(service = %service_type, factory = factory.id, "registered decorator");
            return Ok(factory);
        }

        {
            let mut tables = self.tables.lock();
            let entry = tables.factories.entry(service_type.clone()).or_default();
            match service_key.unwrap_or(ServiceKey::Default) {
                ServiceKey::Default => {
                    if entry.last_default.is_none() && entry.default_factories.is_none() {
                        entry.last_default = Some(factory.clone());
                        entry.default_count = 1;
                        entry.max_default_index = 0;
                    } else {
                        let trie = match entry.default_factories.take() {
                            Some(trie) => trie,
                            None => {
                                // промоция единственного default в дерево
                                let mut promoted = HashTrie::new();
                                if let Some(first) = entry.last_default.clone() {
                                    promoted = promoted.insert(0usize, first);
                                }
                                promoted
                            }
                        };
                        let index = entry.max_default_index + 1;
                        entry.default_factories = Some(trie.insert(index, factory.clone()));
                        entry.max_default_index = index;
                        entry.default_count += 1;
                        entry.last_default = Some(factory.clone());
                    }
                }
                ServiceKey::Index(index) => {
                    let trie = match entry.default_factories.take() {
                        Some(trie) => trie,
                        None => {
                            let mut promoted = HashTrie::new();
                            if let Some(first) = entry.last_default.clone() {
                                promoted = promoted.insert(0usize, first);
                            }
                            promoted
                        }
                    };
                    if trie.get(&index).is_some() {
                        tracing::warn!(
                            service = %service_type,
                            index,
                            "default registration at index is overwritten"
                        );
                    } else {
                        entry.default_count += 1;
                    }
                    entry.default_factories = Some(trie.insert(index, factory.clone()));
                    entry.max_default_index = entry.max_default_index.max(index);
                    entry.last_default = Some(factory.clone());
                }
                ServiceKey::Name(name) => {
                    let named = entry.named.take().unwrap_or_default();
                    if named.get(&name).is_some() {
                        entry.named = Some(named);
                        return Err(ContainerError::DuplicateServiceName {
                            service_type: service_type.to_string(),
                            name,
                        }
                        .into());
                    }
                    entry.named = Some(named.insert(name, factory.clone()));
                }
            }
        }

        self.invalidate_resolution_caches()?;
        self.stats.record_registration();
        debug!(service = %service_type, factory = factory.id, "registered service");
        Ok(factory)
    }

    /// Мемоизация специализированной (open-generic / metadata) фабрики под
    /// закрытым типом; при гонке выигрывает первая регистрация.
    fn register_specialized(&self, factory: Factory, service_type: TypeToken) -> Result<Factory> {
        factory.validate_registrable(&service_type)?;
        let registered = {
            let mut tables = self.tables.lock();
            let entry = tables.factories.entry(service_type.clone()).or_default();
            match &entry.last_default {
                Some(existing) => existing.clone(),
                None => {
                    entry.last_default = Some(factory.clone());
                    entry.default_count = 1;
                    factory
                }
            }
        };
        self.stats.record_registration();
        debug!(service = %service_type, factory = registered.id, "memoized specialized factory");
        Ok(registered)
    }

    pub fn is_registered(&self, service_type: &TypeToken, name: Option<&str>) -> bool {
        let tables = self.tables.lock();
        match tables.factories.get(service_type) {
            None => false,
            Some(entry) => match name {
                None => entry.last_default.is_some() || entry.default_factories.is_some(),
                Some(name) => entry
                    .named
                    .as_ref()
                    .map_or(false, |named| named.get(&name.to_string()).is_some()),
            },
        }
    }

    // === УДОБНАЯ ПОВЕРХНОСТЬ РЕГИСТРАЦИИ ===

    /// Тип, сконструированный собственным конструктором: сервис = реализация.
    pub fn register_type<T: Any + Send + Sync>(
        &self,
        ctor: Ctor,
        reuse: Option<Reuse>,
    ) -> Result<Factory> {
        self.register(
            Factory::reflection_closed(ClosedImpl::of::<T>(ctor), reuse, Setup::service()),
            TypeToken::of::<T>(),
            None,
        )
    }

    pub fn register_type_named<T: Any + Send + Sync>(
        &self,
        ctor: Ctor,
        reuse: Option<Reuse>,
        name: &str,
    ) -> Result<Factory> {
        self.register(
            Factory::reflection_closed(ClosedImpl::of::<T>(ctor), reuse, Setup::service()),
            TypeToken::of::<T>(),
            Some(ServiceKey::named(name)),
        )
    }

    /// Реализация под явным типом сервиса (view должен быть объявлен).
    pub fn register_impl(
        &self,
        closed: ClosedImpl,
        service_type: TypeToken,
        service_key: Option<ServiceKey>,
        reuse: Option<Reuse>,
        setup: Setup,
    ) -> Result<Factory> {
        self.register(
            Factory::reflection_closed(closed, reuse, setup),
            service_type,
            service_key,
        )
    }

    /// Open-generic реализация под open-generic сервисом.
    pub fn register_open(
        &self,
        open: OpenImpl,
        service_type: TypeToken,
        reuse: Option<Reuse>,
    ) -> Result<Factory> {
        self.register(
            Factory::reflection_open(open, reuse, Setup::service()),
            service_type,
            None,
        )
    }

    /// Регистрация реализации под всеми ее объявленными view плюс под
    /// собственным типом; одна фабрика (общие id, reuse и singleton).
    pub fn register_all(&self, closed: ClosedImpl, reuse: Option<Reuse>) -> Result<Factory> {
        let views = closed.views.clone();
        let impl_type = closed.impl_type.clone();
        let factory = Factory::reflection_closed(closed, reuse, Setup::service());
        let registered = self.register(factory, impl_type, None)?;
        for view in views {
            self.register(registered.clone(), view, None)?;
        }
        Ok(registered)
    }

    /// Готовый экземпляр: всегда возвращается захваченный объект.
    pub fn register_instance<T: Any + Send + Sync>(
        &self,
        instance: T,
        service_key: Option<ServiceKey>,
    ) -> Result<Factory> {
        let object: Object = Arc::new(instance);
        let factory = Factory::delegate(
            move |request, container| {
                let expr = container
                    .get_constant_expression(object.clone(), request.service_type.clone())?;
                Ok(Some(expr))
            },
            None,
            Setup::service(),
        );
        self.register(factory, TypeToken::of::<T>(), service_key)
    }

    /// Пользовательская фабрика-замыкание, вызываемая против слабой ссылки
    /// на контейнер.
    pub fn register_delegate<T, F>(
        &self,
        make: F,
        reuse: Option<Reuse>,
        service_key: Option<ServiceKey>,
    ) -> Result<Factory>
    where
        T: Any + Send + Sync,
        F: Fn(&Arc<Container>) -> Result<T> + Send + Sync + 'static,
    {
        let delegate: Object = Arc::new(DelegateValue::new(Arc::new(move |container| {
            make(container).map(|value| Arc::new(value) as Object)
        })));
        let factory = Factory::delegate(
            move |request, container| {
                let target = container
                    .get_constant_expression(delegate.clone(), request.service_type.clone())?;
                Ok(Some(Expr::Invoke {
                    target: Box::new(target),
                    args: vec![Expr::Constant {
                        index: REGISTRY_CONSTANT_INDEX,
                        service_type: TypeToken::of::<RegistryWeakRef>(),
                    }],
                }))
            },
            reuse,
            Setup::service(),
        );
        self.register(factory, TypeToken::of::<T>(), service_key)
    }

    /// Декоратор-реализация: конструктор принимает декорируемый сервис.
    pub fn register_decorator(
        &self,
        closed: ClosedImpl,
        service_type: TypeToken,
        setup: Setup,
    ) -> Result<Factory> {
        self.register(
            Factory::reflection_closed(closed, None, setup),
            service_type,
            None,
        )
    }

    /// Функциональный декоратор: unary transform сервиса, хранится под
    /// function-wrapper типом `Func<T, T>`.
    pub fn register_func_decorator<T, F>(&self, transform: F) -> Result<Factory>
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>) -> Result<T> + Send + Sync + 'static,
    {
        let service_type = TypeToken::of::<T>();
        let func_type = wrappers::func_of(&[service_type.clone()], &service_type);
        let func_object: Object = Arc::new(crate::expression::FuncValue::new(
            1,
            Arc::new(move |mut args: Vec<Object>| {
                let inner = args
                    .pop()
                    .ok_or_else(|| anyhow!("function decorator misses its argument"))?
                    .downcast::<T>()
                    .map_err(|_| ContainerError::WrongResolvedObjectType {
                        service_type: std::any::type_name::<T>().to_string(),
                    })?;
                Ok(Arc::new(transform(inner)?) as Object)
            }),
        ));
        let factory = Factory::delegate(
            move |request, container| {
                let expr = container
                    .get_constant_expression(func_object.clone(), request.service_type.clone())?;
                Ok(Some(expr))
            },
            None,
            Setup::decorator(),
        );
        self.register(factory, func_type, None)
    }

    /// Fallback-цепочка: незарегистрированные здесь сервисы ищутся в другом
    /// контейнере.
    pub fn resolve_unregistered_from(&self, other: &Arc<Container>) {
        let weak = Arc::downgrade(other);
        self.update_rules(move |rules| {
            rules.unregistered_services.push(Arc::new(move |request, _current| {
                match weak.upgrade() {
                    Some(other) => other.get_or_add_factory(request, IfUnresolved::ReturnNull),
                    None => Ok(None),
                }
            }));
        });
    }

    // === РАЗРЕШЕНИЕ ===

    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.resolve_keyed::<T>(ServiceKey::Default)
    }

    pub fn resolve_named<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.resolve_keyed::<T>(ServiceKey::named(name))
    }

    pub fn resolve_keyed<T: Any + Send + Sync>(&self, service_key: ServiceKey) -> Result<Arc<T>> {
        let service_type = TypeToken::of::<T>();
        let object = self
            .resolve_object(&service_type, service_key, IfUnresolved::Throw)?
            .ok_or_else(|| ContainerError::UnableToResolve {
                request: service_type.to_string(),
            })?;
        object.downcast::<T>().map_err(|_| {
            ContainerError::WrongResolvedObjectType {
                service_type: service_type.to_string(),
            }
            .into()
        })
    }

    pub fn try_resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.resolve_object(
            &TypeToken::of::<T>(),
            ServiceKey::Default,
            IfUnresolved::ReturnNull,
        ) {
            Ok(Some(object)) => object.downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Разрешение по токену (для generic сервисов и врапперов).
    pub fn resolve_token(&self, service_type: &TypeToken) -> Result<Object> {
        self.resolve_object(service_type, ServiceKey::Default, IfUnresolved::Throw)?
            .ok_or_else(|| {
                ContainerError::UnableToResolve {
                    request: service_type.to_string(),
                }
                .into()
            })
    }

    pub fn resolve_token_keyed(
        &self,
        service_type: &TypeToken,
        service_key: ServiceKey,
    ) -> Result<Object> {
        self.resolve_object(service_type, service_key.clone(), IfUnresolved::Throw)?
            .ok_or_else(|| {
                ContainerError::UnableToResolve {
                    request: format!("{service_type} {service_key}"),
                }
                .into()
            })
    }

    /// Основная точка входа разрешения.
    pub fn resolve_object(
        &self,
        service_type: &TypeToken,
        service_key: ServiceKey,
        if_unresolved: IfUnresolved,
    ) -> Result<Option<Object>> {
        if service_type.is_open() {
            return Err(ContainerError::ExpectedClosedGenericServiceType {
                service_type: service_type.to_string(),
            }
            .into());
        }

        let cached = match &service_key {
            ServiceKey::Default => self.default_cache.load().get(service_type),
            key => self
                .keyed_cache
                .load()
                .get(&(service_type.clone(), key.clone())),
        };
        if let Some(compiled) = cached {
            self.stats.record_resolution(true);
            return self.invoke_compiled(&compiled).map(Some);
        }
        self.stats.record_resolution(false);

        let this = self.strong_self()?;
        let request = Request::root(service_type.clone(), service_key.clone());
        let factory = match self.get_or_add_factory(&request, if_unresolved)? {
            Some(factory) => factory,
            None => return Ok(None),
        };
        let expr = factory.get_expression(&request, &this)?;
        let compiled = compile_factory(&expr);

        match &service_key {
            ServiceKey::Default => {
                let token = service_type.clone();
                let entry = compiled.clone();
                self.default_cache
                    .swap(&move |trie| trie.insert(token.clone(), entry.clone()))?;
            }
            key => {
                let cache_key = (service_type.clone(), key.clone());
                let entry = compiled.clone();
                self.keyed_cache
                    .swap(&move |trie| trie.insert(cache_key.clone(), entry.clone()))?;
            }
        }
        debug!(service = %service_type, key = %service_key, "compiled and cached resolution");

        self.invoke_compiled(&compiled).map(Some)
    }

    /// Инъекция членов в экземпляр, сконструированный вне контейнера.
    /// Без member-правил инжектируются все объявленные члены.
    pub fn resolve_members<T: Any + Send + Sync>(&self, target: &mut T) -> Result<()> {
        let service_type = TypeToken::of::<T>();
        let request = Request::root(service_type, ServiceKey::Default);
        let factory = self.get_factory(&request)?;
        let members = match &factory.body {
            FactoryBody::Reflection(ImplDesc::Closed(closed)) => closed.members.clone(),
            _ => Vec::new(),
        };
        let rules = self.rules_snapshot();
        for member in &members {
            let key = if rules.members.is_empty() {
                Some(ServiceKey::Default)
            } else {
                rules.member_key(member, &request)
            };
            if let Some(key) = key {
                let object = self
                    .resolve_object(&member.service_type, key, IfUnresolved::Throw)?
                    .ok_or_else(|| ContainerError::UnableToResolve {
                        request: member.service_type.to_string(),
                    })?;
                member.set(target as &mut dyn Any, object)?;
            }
        }
        Ok(())
    }

    fn invoke_compiled(&self, compiled: &CompiledFactory) -> Result<Object> {
        let constants = self.make_constants();
        let mut resolution_scope: ResolutionScope = None;
        compiled.as_ref()(&constants, &mut resolution_scope)
    }

    // === ВЫБОР ФАБРИКИ ===

    /// Пайплайн `get_or_add_factory`: точный тип, open-generic форма, выбор
    /// по ключу, специализация провайдеров, правила незарегистрированных.
    pub(crate) fn get_or_add_factory(
        &self,
        request: &Request,
        if_unresolved: IfUnresolved,
    ) -> Result<Option<Factory>> {
        let this = self.strong_self()?;
        if let Some(factory) = self.select_factory(&request.service_type, &request.service_key)? {
            if factory.provides_factory_per_request() {
                if let Some(specialized) = factory.get_factory_per_request(request, &this)? {
                    let registered =
                        self.register_specialized(specialized, request.service_type.clone())?;
                    return Ok(Some(registered));
                }
                // провайдер отказался (например, metadata miss) — падаем
                // насквозь в правила незарегистрированных сервисов
            } else {
                return Ok(Some(factory));
            }
        }

        let unregistered_rules = { self.rules.read().unregistered_services.clone() };
        for rule in unregistered_rules {
            if let Some(factory) = rule.as_ref()(request, &this)? {
                let registered = self.register(
                    factory,
                    request.service_type.clone(),
                    Some(request.service_key.clone()),
                )?;
                return Ok(Some(registered));
            }
        }

        match if_unresolved {
            IfUnresolved::Throw => Err(ContainerError::UnableToResolve {
                request: request.to_string(),
            }
            .into()),
            IfUnresolved::ReturnNull => Ok(None),
        }
    }

    pub(crate) fn get_factory(&self, request: &Request) -> Result<Factory> {
        self.get_or_add_factory(request, IfUnresolved::Throw)?
            .ok_or_else(|| anyhow!("factory lookup with Throw returned nothing"))
    }

    pub(crate) fn try_get_factory(&self, request: &Request) -> Result<Option<Factory>> {
        self.get_or_add_factory(request, IfUnresolved::ReturnNull)
    }

    fn select_factory(
        &self,
        service_type: &TypeToken,
        service_key: &ServiceKey,
    ) -> Result<Option<Factory>> {
        let tables = self.tables.lock();
        let entry = match tables.factories.get(service_type) {
            Some(entry) => entry,
            None => match service_type.open_form() {
                Some(open) => match tables.factories.get(&open) {
                    Some(entry) => entry,
                    None => return Ok(None),
                },
                None => return Ok(None),
            },
        };
        match service_key {
            ServiceKey::Default => {
                if entry.default_count > 1 {
                    let candidates: Vec<(usize, Factory)> = entry
                        .default_factories
                        .as_ref()
                        .map(|trie| trie.to_vec())
                        .unwrap_or_default();
                    let rules = self.rules.read();
                    if let Some(select) = &rules.single_default_factory {
                        if let Some(chosen) = select.as_ref()(service_type, &candidates) {
                            return Ok(Some(chosen));
                        }
                    }
                    return Err(ContainerError::ExpectedSingleDefaultFactory {
                        service_type: service_type.to_string(),
                        count: entry.default_count,
                    }
                    .into());
                }
                Ok(entry.last_default.clone())
            }
            ServiceKey::Index(index) => {
                if let Some(trie) = &entry.default_factories {
                    Ok(trie.get(index))
                } else if *index == 0 {
                    Ok(entry.last_default.clone())
                } else {
                    Ok(None)
                }
            }
            ServiceKey::Name(name) => Ok(entry
                .named
                .as_ref()
                .and_then(|named| named.get(name))),
        }
    }

    pub(crate) fn get_factory_or_default(
        &self,
        service_type: &TypeToken,
        service_key: &ServiceKey,
    ) -> Option<Factory> {
        self.select_factory(service_type, service_key).ok().flatten()
    }

    /// Ключи и фабрики типа в порядке регистрации (индексированные default,
    /// затем именованные).
    pub fn get_keys(
        &self,
        service_type: &TypeToken,
        filter: Option<&dyn Fn(&Factory) -> bool>,
    ) -> Vec<(ServiceKey, Factory)> {
        let tables = self.tables.lock();
        let entry = match tables.factories.get(service_type) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let mut keys = Vec::new();
        if let Some(trie) = &entry.default_factories {
            trie.for_each(&mut |index, factory| {
                if filter.map_or(true, |accept| accept(factory)) {
                    keys.push((ServiceKey::Index(*index), factory.clone()));
                }
            });
        } else if let Some(factory) = &entry.last_default {
            if filter.map_or(true, |accept| accept(factory)) {
                keys.push((ServiceKey::Default, factory.clone()));
            }
        }
        if let Some(named) = &entry.named {
            named.for_each(&mut |name, factory| {
                if filter.map_or(true, |accept| accept(factory)) {
                    keys.push((ServiceKey::Name(name.clone()), factory.clone()));
                }
            });
        }
        keys
    }

    /// Размотать цепочку generic врапперов до конечного типа сервиса.
    pub fn get_wrapped_service_type_or_self(&self, service_type: &TypeToken) -> TypeToken {
        let mut current = service_type.clone();
        loop {
            let next = if wrappers::is_sequence_token(&current) {
                current.generic_args().first().cloned()
            } else if let Some(open) = current.open_form() {
                let tables = self.tables.lock();
                match tables
                    .factories
                    .get(&open)
                    .and_then(|entry| entry.last_default.clone())
                {
                    Some(factory) if factory.factory_type() == FactoryType::GenericWrapper => {
                        current.generic_args().get(factory.setup.wrapped_arg_index()).cloned()
                    }
                    _ => None,
                }
            } else {
                None
            };
            match next {
                Some(token) => current = token,
                None => return current,
            }
        }
    }

    // === ДЕКОРАТОРЫ ===

    /// Составить декорирующее выражение для запроса: функциональные
    /// декораторы под `Func<T,T>`, затем прямые (конкретные раньше
    /// специализированных open-generic). Лямбды компонуются подстановкой;
    /// не-лямбда — полная замена.
    pub(crate) fn get_decorator_expression_or_default(
        &self,
        request: &Request,
    ) -> Result<Option<Expr>> {
        let this = self.strong_self()?;
        let service_type = &request.service_type;
        let mut result: Option<Expr> = None;

        // 1) функциональные декораторы
        let func_type = wrappers::func_of(&[service_type.clone()], service_type);
        let func_factories: Vec<Factory> = {
            let tables = self.tables.lock();
            tables
                .decorators
                .get(&func_type)
                .map(|entries| entries.iter().map(|e| e.factory.clone()).collect())
                .unwrap_or_default()
        };
        for factory in func_factories {
            if !factory.setup.is_applicable(request) {
                continue;
            }
            let func_request = request
                .push_preserving_parent_key(func_type.clone(), None)
                .resolved_to(&factory)?;
            let func_expr = factory.create_expression(&func_request, &this)?;
            let param_id = crate::expression::next_param_id();
            let unary = Expr::Lambda {
                params: vec![(param_id, service_type.clone())],
                body: Box::new(Expr::Invoke {
                    target: Box::new(func_expr),
                    args: vec![Expr::Param {
                        id: param_id,
                        service_type: service_type.clone(),
                    }],
                }),
            };
            result = Some(compose_decorator(result, unary));
        }

        // 2) специализация open-generic декораторов в закрытые записи
        if let Some(open_type) = service_type.open_form() {
            let pending: Vec<Factory> = {
                let tables = self.tables.lock();
                let existing_origins: Vec<usize> = tables
                    .decorators
                    .get(service_type)
                    .map(|entries| entries.iter().filter_map(|e| e.origin_open_id).collect())
                    .unwrap_or_default();
                tables
                    .decorators
                    .get(&open_type)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| !existing_origins.contains(&e.factory.id))
                            .map(|e| e.factory.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for open_factory in pending {
                if let Some(specialized) = open_factory.get_factory_per_request(request, &this)? {
                    let mut tables = self.tables.lock();
                    let entries = tables.decorators.entry(service_type.clone()).or_default();
                    if !entries
                        .iter()
                        .any(|e| e.origin_open_id == Some(open_factory.id))
                    {
                        entries.push(DecoratorEntry {
                            factory: specialized,
                            cached_expression: None,
                            origin_open_id: Some(open_factory.id),
                        });
                    }
                }
            }
        }

        // 3) прямые декораторы (включая только что специализированные)
        let direct: Vec<(usize, Factory, Option<Expr>)> = {
            let tables = self.tables.lock();
            tables
                .decorators
                .get(service_type)
                .map(|entries| {
                    entries
                        .iter()
                        .enumerate()
                        .map(|(i, e)| (i, e.factory.clone(), e.cached_expression.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (index, factory, cached) in direct {
            if !factory.setup.is_applicable(request) {
                continue;
            }
            let lambda = match cached {
                Some(expr) => expr,
                None => {
                    let decorated = request.make_decorated().resolved_to(&factory)?;
                    let param = (crate::expression::next_param_id(), service_type.clone());
                    let expr = factory
                        .func_expression(&[param], &decorated, &this)
                        .map_err(|err| map_decorator_error(err, &factory, service_type))?;
                    let mut tables = self.tables.lock();
                    if let Some(entries) = tables.decorators.get_mut(service_type) {
                        if let Some(entry) = entries.get_mut(index) {
                            entry.cached_expression = Some(expr.clone());
                        }
                    }
                    expr
                }
            };
            result = Some(compose_decorator(result, lambda));
        }

        Ok(result)
    }

    // === КЭШИ И КОНСТАНТЫ ===

    fn invalidate_resolution_caches(&self) -> Result<()> {
        self.default_cache.swap(&|_| HashTrie::new())?;
        self.keyed_cache.swap(&|_| HashTrie::new())?;
        Ok(())
    }

    pub(crate) fn get_cached_factory_expression(&self, factory_id: usize) -> Option<Expr> {
        self.expression_cache.load().get(&factory_id)
    }

    pub(crate) fn cache_factory_expression(&self, factory_id: usize, expr: &Expr) -> Result<()> {
        let expr = expr.clone();
        self.expression_cache
            .swap(&move |trie| trie.insert(factory_id, expr.clone()))?;
        Ok(())
    }

    /// Выражение-ссылка на константу: линейный поиск по identity, добавление
    /// в общий copy-on-write хвост при отсутствии.
    pub fn get_constant_expression(
        &self,
        object: Object,
        service_type: TypeToken,
    ) -> Result<Expr> {
        let mut guard = self.extra_constants.write();
        let position = guard.iter().position(|existing| Arc::ptr_eq(existing, &object));
        let index = match position {
            Some(position) => position,
            None => {
                let mut next = (**guard).clone();
                next.push(object);
                let position = next.len() - 1;
                *guard = Arc::new(next);
                position
            }
        };
        Ok(Expr::Constant {
            index: index + RESERVED_CONSTANTS,
            service_type,
        })
    }

    pub(crate) fn make_constants(&self) -> Constants {
        Constants {
            registry: self.self_object.clone(),
            singleton_scope: self.singleton_scope.clone(),
            current_scope: self.current_scope.clone(),
            extra: self.extra_constants.read().clone(),
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Композиция декораторов: новая лямбда оборачивает накопленный результат;
/// не-лямбда перекрывает его полностью.
fn compose_decorator(result: Option<Expr>, next: Expr) -> Expr {
    match next {
        Expr::Lambda { params, body } => {
            let param_id = match params.first() {
                Some((id, _)) => *id,
                None => return Expr::Lambda { params, body },
            };
            match result {
                None => Expr::Lambda { params, body },
                Some(Expr::Lambda {
                    params: prev_params,
                    body: prev_body,
                }) => Expr::Lambda {
                    params: prev_params,
                    body: Box::new(body.substitute(param_id, &prev_body)),
                },
                Some(replacement) => body.substitute(param_id, &replacement),
            }
        }
        replacement => replacement,
    }
}

fn map_decorator_error(
    err: anyhow::Error,
    factory: &Factory,
    service_type: &TypeToken,
) -> anyhow::Error {
    match err.downcast_ref::<ContainerError>() {
        Some(ContainerError::UnsupportedFuncWithArgs { .. })
        | Some(ContainerError::SomeFuncParamsAreUnused { .. }) => {
            ContainerError::DecoratorFactoryShouldSupportFuncResolution {
                decorator_type: factory
                    .implementation_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| format!("factory #{}", factory.id)),
                service_type: service_type.to_string(),
            }
            .into()
        }
        _ => err,
    }
}

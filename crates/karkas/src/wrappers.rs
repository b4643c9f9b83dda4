//! Встроенные generic врапперы: function, lazy, many, metadata,
//! debug-expression и правило enumerable (Vec-снапшот).
//!
//! Врапперы регистрируются под open-формами своих определений и синтезируют
//! выражение по закрытому типу конкретного запроса. Vec — не регистрация, а
//! правило незарегистрированного сервиса: фабрика снапшотит текущие ключи
//! элементов в момент первого разрешения.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::{Lazy, OnceCell};
use tracing::debug;

use crate::container::{Container, IfUnresolved};
use crate::errors::ContainerError;
use crate::expression::{
    next_param_id, Expr, FuncValue, RegistryWeakRef, REGISTRY_CONSTANT_INDEX,
};
use crate::factory::{Ctor, Factory, ParamSpec, Setup};
use crate::request::Request;
use crate::type_token::{GenericDef, ServiceKey, TypeToken};
use crate::Object;

/// Function врапперы: `Func<R>`, `Func<A, R>`, ... до трех аргументов.
static FUNC_DEFS: Lazy<Vec<GenericDef>> =
    Lazy::new(|| (0..=3).map(|extra| GenericDef::new("Func", extra + 1)).collect());

pub static LAZY_DEF: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("Lazy", 1));
pub static MANY_DEF: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("Many", 1));
pub static META_DEF: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("Meta", 2));
pub static DEBUG_EXPR_DEF: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("DebugExpr", 1));
pub static VEC_DEF: Lazy<GenericDef> = Lazy::new(|| GenericDef::new("Vec", 1));

/// Токен `Func<args..., result>`; поддерживается до трех аргументов.
pub fn func_of(args: &[TypeToken], result: &TypeToken) -> TypeToken {
    let def = &FUNC_DEFS[args.len()];
    let mut all = args.to_vec();
    all.push(result.clone());
    def.token(all)
}

pub fn lazy_of(item: &TypeToken) -> TypeToken {
    LAZY_DEF.token(vec![item.clone()])
}

pub fn many_of(item: &TypeToken) -> TypeToken {
    MANY_DEF.token(vec![item.clone()])
}

pub fn meta_of(item: &TypeToken, metadata: &TypeToken) -> TypeToken {
    META_DEF.token(vec![item.clone(), metadata.clone()])
}

pub fn debug_expr_of(item: &TypeToken) -> TypeToken {
    DEBUG_EXPR_DEF.token(vec![item.clone()])
}

pub fn vec_of(item: &TypeToken) -> TypeToken {
    VEC_DEF.token(vec![item.clone()])
}

pub fn is_func_token(token: &TypeToken) -> bool {
    token
        .generic_def()
        .map_or(false, |def| FUNC_DEFS.iter().any(|d| d == def))
}

pub fn is_sequence_token(token: &TypeToken) -> bool {
    token.generic_def().map_or(false, |def| def == &*VEC_DEF)
}

// === ЗНАЧЕНИЯ ВРАППЕРОВ ===

/// Значение `Lazy<T>`: мемоизированный первый вызов разрешенной функции.
pub struct LazyValue {
    factory: Arc<FuncValue>,
    cell: OnceCell<Object>,
}

impl LazyValue {
    pub fn new(factory: Arc<FuncValue>) -> Self {
        Self {
            factory,
            cell: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Result<Object> {
        self.cell
            .get_or_try_init(|| self.factory.invoke0())
            .map(|object| object.clone())
    }

    pub fn get_as<T: std::any::Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.get()?.downcast::<T>().map_err(|_| {
            ContainerError::WrongResolvedObjectType {
                service_type: std::any::type_name::<T>().to_string(),
            }
            .into()
        })
    }
}

/// Значение `Many<T>`: живой view регистраций. Каждый вызов `items`
/// перечитывает ключи через слабую ссылку на контейнер, так что регистрации
/// после создания враппера видны (в отличие от Vec-снапшота).
pub struct ManyValue {
    registry: RegistryWeakRef,
    item_type: TypeToken,
    exclude_factory_id: Option<usize>,
}

impl ManyValue {
    pub fn items(&self) -> Result<Vec<Object>> {
        let container = self.registry.upgrade()?;
        let unwrapped = container.get_wrapped_service_type_or_self(&self.item_type);
        let exclude = self.exclude_factory_id;
        let filter = |factory: &Factory| Some(factory.id) != exclude;
        let keys = container.get_keys(&unwrapped, Some(&filter));
        let mut items = Vec::with_capacity(keys.len());
        for (key, _) in keys {
            if let Some(object) =
                container.resolve_object(&self.item_type, key, IfUnresolved::ReturnNull)?
            {
                items.push(object);
            }
        }
        Ok(items)
    }
}

/// Значение `Meta<T, M>`: сервис вместе с метаданными его регистрации.
pub struct MetaValue {
    pub value: Object,
    pub metadata: Object,
}

/// Значение `DebugExpr<T>`: построенное выражение сервиса для инспекции.
pub struct ExprView(Arc<Expr>);

impl ExprView {
    pub fn new(expr: Arc<Expr>) -> Self {
        Self(expr)
    }

    pub fn expression(&self) -> &Expr {
        &self.0
    }
}

impl fmt::Display for ExprView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ExprView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// === УСТАНОВКА ===

/// Зарегистрировать врапперы по умолчанию и правило enumerable.
pub fn install_default_wrappers(container: &Arc<Container>) -> Result<()> {
    for (extra, def) in FUNC_DEFS.iter().enumerate() {
        container.register(
            Factory::delegate(func_wrapper_expr, None, Setup::wrapper_at(extra)),
            def.open(),
            None,
        )?;
    }
    container.register(
        Factory::delegate(lazy_wrapper_expr, None, Setup::wrapper_at(0)),
        LAZY_DEF.open(),
        None,
    )?;
    container.register(
        Factory::delegate(many_wrapper_expr, None, Setup::wrapper_at(0)),
        MANY_DEF.open(),
        None,
    )?;
    container.register(
        Factory::provider(meta_provide, Setup::wrapper_at(0)),
        META_DEF.open(),
        None,
    )?;
    container.register(
        Factory::delegate(debug_expr_wrapper_expr, None, Setup::wrapper_at(0)),
        DEBUG_EXPR_DEF.open(),
        None,
    )?;
    container.update_rules(|rules| {
        rules
            .unregistered_services
            .push(Arc::new(sequence_rule));
    });
    debug!("installed default wrappers and enumerable rule");
    Ok(())
}

// === СИНТЕЗ ВЫРАЖЕНИЙ ===

/// `Func<..., T>`: лямбда, связывающая последний аргумент типа как результат.
fn func_wrapper_expr(request: &Request, container: &Arc<Container>) -> Result<Option<Expr>> {
    let args = request.service_type.generic_args();
    if args.is_empty() {
        return Err(anyhow!("function wrapper requires at least result type"));
    }
    let (func_args, result) = args.split_at(args.len() - 1);
    let result_type = &result[0];
    let child = request.push_preserving_parent_key(result_type.clone(), None);

    if func_args.is_empty() {
        let factory = container.get_factory(&child)?;
        let body = factory.get_expression(&child, container)?;
        return Ok(Some(Expr::Lambda {
            params: Vec::new(),
            body: Box::new(body),
        }));
    }

    let factory = container.get_factory(&child)?;
    let params: Vec<(usize, TypeToken)> = func_args
        .iter()
        .map(|token| (next_param_id(), token.clone()))
        .collect();
    let resolved = child.resolved_to(&factory)?;
    let lambda = factory.func_expression(&params, &resolved, container)?;
    // Reuse применяется к телу: выражение с параметрами не кэшируется по id
    match (factory.reuse, lambda) {
        (Some(reuse), Expr::Lambda { params, body }) => {
            let wrapped = reuse.apply(*body, &factory, &resolved, container)?;
            Ok(Some(Expr::Lambda {
                params,
                body: Box::new(wrapped),
            }))
        }
        (_, lambda) => Ok(Some(lambda)),
    }
}

/// `Lazy<T>`: конструктор принимает `Func<T>`; разрешение рекурсивно идет
/// через function wrapper.
fn lazy_wrapper_expr(request: &Request, container: &Arc<Container>) -> Result<Option<Expr>> {
    let item = request
        .service_type
        .generic_args()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("lazy wrapper requires item type"))?;
    let func_type = func_of(&[], &item);
    let child = request.push_preserving_parent_key(func_type.clone(), None);
    let factory = container.get_factory(&child)?;
    let func_expr = factory.get_expression(&child, container)?;

    let ctor = Ctor::of::<LazyValue, _>(
        vec![ParamSpec::new("factory", func_type)],
        |args| Ok(LazyValue::new(args.take::<FuncValue>()?)),
    );
    Ok(Some(Expr::New {
        ctor,
        args: vec![func_expr],
    }))
}

/// `Many<T>`: живой enumerable против слабой ссылки на контейнер из слота 0.
fn many_wrapper_expr(request: &Request, container: &Arc<Container>) -> Result<Option<Expr>> {
    let item = request
        .service_type
        .generic_args()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("many wrapper requires item type"))?;
    let unwrapped = container.get_wrapped_service_type_or_self(&item);
    // Composite-защита: родитель того же типа не попадает в перечисление
    let exclude = request
        .non_wrapper_parent()
        .filter(|parent| parent.service_type == unwrapped)
        .map(|parent| parent.factory_id);

    let ctor = Ctor::of::<ManyValue, _>(
        vec![ParamSpec::new(
            "registry",
            TypeToken::of::<RegistryWeakRef>(),
        )],
        move |args| {
            let registry = args.take::<RegistryWeakRef>()?;
            Ok(ManyValue {
                registry: (*registry).clone(),
                item_type: item.clone(),
                exclude_factory_id: exclude,
            })
        },
    );
    Ok(Some(Expr::New {
        ctor,
        args: vec![Expr::Constant {
            index: REGISTRY_CONSTANT_INDEX,
            service_type: TypeToken::of::<RegistryWeakRef>(),
        }],
    }))
}

/// `Meta<T, M>`: провайдер находит первую (или по ключу) фабрику с
/// метаданными типа M. Промах метаданных — не ошибка: враппер просто
/// неприменим, и lookup уходит в правила незарегистрированных сервисов.
fn meta_provide(request: &Request, container: &Arc<Container>) -> Result<Option<Factory>> {
    let args = request.service_type.generic_args();
    if args.len() != 2 {
        return Ok(None);
    }
    let item = args[0].clone();
    let metadata_type = args[1].clone();
    let unwrapped = container.get_wrapped_service_type_or_self(&item);

    let matched: Option<(ServiceKey, Object)> = match &request.service_key {
        ServiceKey::Default => container
            .get_keys(&unwrapped, None)
            .into_iter()
            .find_map(|(key, factory)| {
                factory
                    .setup
                    .metadata()
                    .filter(|(token, _)| *token == metadata_type)
                    .map(|(_, object)| (key, object.clone()))
            }),
        key => container
            .get_factory_or_default(&unwrapped, key)
            .and_then(|factory| {
                factory
                    .setup
                    .metadata()
                    .filter(|(token, _)| *token == metadata_type)
                    .map(|(_, object)| (key.clone(), object.clone()))
            }),
    };
    let (found_key, metadata_object) = match matched {
        Some(found) => found,
        None => return Ok(None),
    };

    let factory = Factory::delegate(
        move |req, c| {
            let child = req.push(item.clone(), found_key.clone(), None);
            let item_factory = c.get_factory(&child)?;
            let item_expr = item_factory.get_expression(&child, c)?;
            let metadata_const =
                c.get_constant_expression(metadata_object.clone(), metadata_type.clone())?;
            let ctor = Ctor::of::<MetaValue, _>(
                vec![
                    ParamSpec::new("value", item.clone()),
                    ParamSpec::new("metadata", metadata_type.clone()),
                ],
                |args| {
                    Ok(MetaValue {
                        value: args.take_object()?,
                        metadata: args.take_object()?,
                    })
                },
            );
            Ok(Some(Expr::New {
                ctor,
                args: vec![item_expr, metadata_const],
            }))
        },
        None,
        Setup::wrapper_at(0),
    );
    Ok(Some(factory))
}

/// `DebugExpr<T>`: константа с полностью построенным выражением сервиса.
fn debug_expr_wrapper_expr(
    request: &Request,
    container: &Arc<Container>,
) -> Result<Option<Expr>> {
    let item = request
        .service_type
        .generic_args()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("debug-expression wrapper requires item type"))?;
    let child = request.push_preserving_parent_key(item, None);
    let factory = container.get_factory(&child)?;
    let expr = factory.get_expression(&child, container)?;
    let view: Object = Arc::new(ExprView::new(Arc::new(expr)));
    let constant = container.get_constant_expression(view, request.service_type.clone())?;
    Ok(Some(constant))
}

// === ПРАВИЛО ENUMERABLE ===

/// Правило незарегистрированного сервиса для `Vec<T>`: снапшот ключей
/// элементов в момент построения выражения.
fn sequence_rule(request: &Request, _container: &Arc<Container>) -> Result<Option<Factory>> {
    if !is_sequence_token(&request.service_type) {
        return Ok(None);
    }
    Ok(Some(Factory::delegate(
        sequence_expr,
        None,
        Setup::service(),
    )))
}

fn sequence_expr(request: &Request, container: &Arc<Container>) -> Result<Option<Expr>> {
    let item = request
        .service_type
        .generic_args()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("sequence requires item type"))?;
    let unwrapped = container.get_wrapped_service_type_or_self(&item);
    let exclude = request
        .non_wrapper_parent()
        .filter(|parent| parent.service_type == unwrapped)
        .map(|parent| parent.factory_id);
    let filter = |factory: &Factory| Some(factory.id) != exclude;
    let keys = container.get_keys(&unwrapped, Some(&filter));
    if keys.is_empty() {
        return Err(ContainerError::UnableToFindRegisteredEnumerableItems {
            item_type: unwrapped.to_string(),
            request: request.to_string(),
        }
        .into());
    }

    let mut items = Vec::with_capacity(keys.len());
    for (key, _) in keys {
        let child = request.push(item.clone(), key, None);
        let item_factory = container.try_get_factory(&child)?.ok_or_else(|| {
            ContainerError::UnableToResolveEnumerableItems {
                item_type: item.to_string(),
                source_message: format!("no factory for {child}"),
            }
        })?;
        let expr = item_factory.get_expression(&child, container).map_err(|err| {
            anyhow::Error::from(ContainerError::UnableToResolveEnumerableItems {
                item_type: item.to_string(),
                source_message: err.to_string(),
            })
        })?;
        items.push(expr);
    }
    Ok(Some(Expr::Array {
        item_type: item,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_func_token_shape() {
        let token = func_of(&[TypeToken::of::<Alpha>()], &TypeToken::of::<Beta>());
        assert!(is_func_token(&token));
        assert_eq!(token.to_string(), "Func<Alpha, Beta>");
        assert!(!is_func_token(&TypeToken::of::<Alpha>()));
    }

    #[test]
    fn test_sequence_token_detection() {
        let token = vec_of(&TypeToken::of::<Alpha>());
        assert!(is_sequence_token(&token));
        assert!(!is_sequence_token(&many_of(&TypeToken::of::<Alpha>())));
    }

    #[test]
    fn test_wrapper_tokens_are_open_until_closed() {
        assert!(LAZY_DEF.open().is_open());
        assert!(!lazy_of(&TypeToken::of::<Alpha>()).is_open());
    }
}

//! Политики переиспользования экземпляров.
//!
//! Transient — это отсутствие reuse (`Option<Reuse>::None`): выражение не
//! оборачивается. Остальные политики оборачивают выражение scope-доступом
//! по id фабрики либо, для singleton вне function wrapper, жадно вычисляют
//! экземпляр и подставляют ссылку на константу.

use std::sync::Arc;

use anyhow::Result;

use crate::container::Container;
use crate::expression::{compile_factory, Expr, ScopeSource};
use crate::factory::Factory;
use crate::request::Request;
use crate::scope::ScopedItem;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reuse {
    /// Один экземпляр на контейнер (и все его scoped-потомки).
    Singleton,
    /// Один экземпляр на текущий scope контейнера.
    InCurrentScope,
    /// Один экземпляр в пределах одного top-level вызова resolve.
    InResolutionScope,
}

impl Reuse {
    pub(crate) fn apply(
        &self,
        expr: Expr,
        factory: &Factory,
        request: &Request,
        container: &Arc<Container>,
    ) -> Result<Expr> {
        let disposer = expr.find_disposer();
        match self {
            Reuse::Singleton => {
                if request.has_func_wrapper_ancestor() {
                    // Внутри function wrapper конструирование отложено до
                    // вызова функции: ленивый get на singleton scope.
                    return Ok(Expr::Scoped {
                        source: ScopeSource::Singleton,
                        factory_id: factory.id,
                        disposer,
                        body: Box::new(expr),
                    });
                }
                // Жадный захват: вычисляем сейчас и ссылаемся на константу
                let compiled = compile_factory(&expr);
                let constants = container.make_constants();
                let scope = constants.singleton_scope.clone();
                let mut create = || -> Result<ScopedItem> {
                    let mut resolution_scope = None;
                    let object = compiled.as_ref()(&constants, &mut resolution_scope)?;
                    let tracked = disposer.as_ref().and_then(|d| d.as_ref()(&object));
                    Ok((object, tracked))
                };
                let object = scope.get_or_add(factory.id, &mut create)?;
                container.get_constant_expression(object, request.service_type.clone())
            }
            Reuse::InCurrentScope => Ok(Expr::Scoped {
                source: ScopeSource::Current,
                factory_id: factory.id,
                disposer,
                body: Box::new(expr),
            }),
            Reuse::InResolutionScope => Ok(Expr::Scoped {
                source: ScopeSource::Resolution,
                factory_id: factory.id,
                disposer,
                body: Box::new(expr),
            }),
        }
    }
}

//! Цепочка фреймов текущего разрешения.
//!
//! Фреймы immutable: каждый push/resolve возвращает новый фрейм со ссылкой
//! на родителя. Цепочка используется для обнаружения рекурсии, наследования
//! ключей врапперами и pretty-printing в сообщениях об ошибках.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::errors::ContainerError;
use crate::factory::Factory;
use crate::type_token::{ServiceKey, TypeToken};
use crate::wrappers;
use crate::Object;

/// Роль фабрики в цепочке: обычный сервис, generic wrapper или декоратор.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FactoryType {
    Service,
    GenericWrapper,
    Decorator,
}

/// Описание зависимости, ради которой построен фрейм.
#[derive(Clone, Debug)]
pub enum DependencyInfo {
    Parameter { name: &'static str },
    Member { name: &'static str },
}

#[derive(Clone)]
pub struct Request {
    parent: Option<Arc<Request>>,
    pub service_type: TypeToken,
    pub service_key: ServiceKey,
    pub dependency: Option<DependencyInfo>,
    /// 0, пока фабрика не закреплена через `resolved_to`.
    pub factory_id: usize,
    pub factory_type: FactoryType,
    pub impl_type: Option<TypeToken>,
    pub metadata: Option<Object>,
    /// Штамп декорирования: id фабрики, которую нельзя декорировать повторно
    /// внутри ее собственной цепочки декораторов.
    pub decorated_factory_id: usize,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("parent", &self.parent)
            .field("service_type", &self.service_type)
            .field("service_key", &self.service_key)
            .field("dependency", &self.dependency)
            .field("factory_id", &self.factory_id)
            .field("factory_type", &self.factory_type)
            .field("impl_type", &self.impl_type)
            .field("decorated_factory_id", &self.decorated_factory_id)
            .finish()
    }
}

impl Request {
    pub fn root(service_type: TypeToken, service_key: ServiceKey) -> Request {
        Request {
            parent: None,
            service_type,
            service_key,
            dependency: None,
            factory_id: 0,
            factory_type: FactoryType::Service,
            impl_type: None,
            metadata: None,
            decorated_factory_id: 0,
        }
    }

    pub fn parent(&self) -> Option<&Arc<Request>> {
        self.parent.as_ref()
    }

    /// Дочерний фрейм со своим ключом.
    pub fn push(
        &self,
        service_type: TypeToken,
        service_key: ServiceKey,
        dependency: Option<DependencyInfo>,
    ) -> Request {
        Request {
            parent: Some(Arc::new(self.clone())),
            service_type,
            service_key,
            dependency,
            factory_id: 0,
            factory_type: FactoryType::Service,
            impl_type: None,
            metadata: None,
            decorated_factory_id: self.decorated_factory_id,
        }
    }

    /// Дочерний фрейм, наследующий ключ родителя — так врапперы пробрасывают
    /// ключ к обернутому сервису.
    pub fn push_preserving_parent_key(
        &self,
        service_type: TypeToken,
        dependency: Option<DependencyInfo>,
    ) -> Request {
        self.push(service_type, self.service_key.clone(), dependency)
    }

    /// Закрепить фабрику за фреймом. Обходит предков: повторная встреча той
    /// же сервисной фабрики означает цикл зависимостей.
    pub fn resolved_to(&self, factory: &Factory) -> Result<Request> {
        let factory_type = factory.factory_type();
        if factory_type == FactoryType::Service {
            let mut ancestor = self.parent.as_deref();
            while let Some(a) = ancestor {
                if a.factory_id == factory.id && a.factory_type == FactoryType::Service {
                    return Err(ContainerError::RecursiveDependencyDetected {
                        request: self.to_string(),
                    }
                    .into());
                }
                ancestor = a.parent.as_deref();
            }
        }
        let mut resolved = self.clone();
        resolved.factory_id = factory.id;
        resolved.factory_type = factory_type;
        resolved.impl_type = factory.implementation_type();
        resolved.metadata = factory.setup.metadata_object();
        Ok(resolved)
    }

    /// Штамп: сервис этого фрейма уже декорируется.
    pub fn make_decorated(&self) -> Request {
        let mut stamped = self.clone();
        stamped.decorated_factory_id = stamped.factory_id;
        stamped
    }

    /// Ближайший предок, не являющийся generic wrapper.
    pub fn non_wrapper_parent(&self) -> Option<&Request> {
        let mut ancestor = self.parent.as_deref();
        while let Some(a) = ancestor {
            if a.factory_type != FactoryType::GenericWrapper {
                return Some(a);
            }
            ancestor = a.parent.as_deref();
        }
        None
    }

    /// Есть ли в цепочке function wrapper — от этого зависит, можно ли
    /// захватывать singleton жадно.
    pub fn has_func_wrapper_ancestor(&self) -> bool {
        let mut frame = Some(self);
        while let Some(f) = frame {
            if f.factory_type == FactoryType::GenericWrapper
                && wrappers::is_func_token(&f.service_type)
            {
                return true;
            }
            frame = f.parent.as_deref();
        }
        false
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut frame = Some(self);
        let mut first = true;
        while let Some(r) = frame {
            if !first {
                write!(f, " <- ")?;
            }
            first = false;
            write!(f, "{}", r.service_type)?;
            if r.service_key != ServiceKey::Default {
                write!(f, " {}", r.service_key)?;
            }
            match &r.dependency {
                Some(DependencyInfo::Parameter { name }) => write!(f, " (parameter \"{name}\")")?,
                Some(DependencyInfo::Member { name }) => write!(f, " (member \"{name}\")")?,
                None => {}
            }
            if let Some(impl_type) = &r.impl_type {
                if impl_type != &r.service_type {
                    write!(f, " as {impl_type}")?;
                }
            }
            frame = r.parent.as_deref();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{ClosedImpl, Ctor, Factory, Setup};

    struct Outer;
    struct Inner;

    fn service_factory<T: std::any::Any + Send + Sync + Default>() -> Factory {
        Factory::reflection_closed(
            ClosedImpl::of::<T>(Ctor::of::<T, _>(vec![], |_| Ok(T::default()))),
            None,
            Setup::service(),
        )
    }

    impl Default for Outer {
        fn default() -> Self {
            Outer
        }
    }

    impl Default for Inner {
        fn default() -> Self {
            Inner
        }
    }

    #[test]
    fn test_push_links_parent() {
        let root = Request::root(TypeToken::of::<Outer>(), ServiceKey::Default);
        let child = root.push(
            TypeToken::of::<Inner>(),
            ServiceKey::named("named"),
            Some(DependencyInfo::Parameter { name: "inner" }),
        );
        assert_eq!(
            child.parent().map(|p| p.service_type.clone()),
            Some(TypeToken::of::<Outer>())
        );
        assert_eq!(child.service_key, ServiceKey::named("named"));
    }

    #[test]
    fn test_preserving_parent_key() {
        let root = Request::root(TypeToken::of::<Outer>(), ServiceKey::named("db"));
        let child = root.push_preserving_parent_key(TypeToken::of::<Inner>(), None);
        assert_eq!(child.service_key, ServiceKey::named("db"));
    }

    #[test]
    fn test_recursion_detected_for_same_service_factory() {
        let factory = service_factory::<Outer>();
        let root = Request::root(TypeToken::of::<Outer>(), ServiceKey::Default);
        let resolved = root.resolved_to(&factory).expect("first resolve");

        let child = resolved.push(TypeToken::of::<Outer>(), ServiceKey::Default, None);
        let err = child
            .resolved_to(&factory)
            .expect_err("cycle must be detected");
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::RecursiveDependencyDetected { .. })
        ));
    }

    #[test]
    fn test_display_prints_chain() {
        let root = Request::root(TypeToken::of::<Outer>(), ServiceKey::Default);
        let child = root.push(
            TypeToken::of::<Inner>(),
            ServiceKey::Default,
            Some(DependencyInfo::Parameter { name: "inner" }),
        );
        let text = child.to_string();
        assert!(text.contains("Inner"));
        assert!(text.contains("Outer"));
        assert!(text.contains("parameter \"inner\""));
    }
}

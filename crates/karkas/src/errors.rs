//! Ошибки контейнера.
//!
//! Все сбои сводятся к одному enum со стабильными идентификаторами видов;
//! текст сообщения встраивает участвующие типы и pretty-printed цепочку
//! запроса для диагностики. Конверсия в `anyhow::Error` автоматическая,
//! существующий код может продолжать использовать `anyhow::Result<T>`.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ContainerError {
    #[error("Unable to resolve {request}")]
    UnableToResolve { request: String },

    #[error("Expected single default registration of {service_type} but found {count}; \
             set a single-default selector rule or resolve by key")]
    ExpectedSingleDefaultFactory { service_type: String, count: usize },

    #[error("Service {service_type} is already registered with name {name}")]
    DuplicateServiceName { service_type: String, name: String },

    #[error("Implementation {impl_type} is not assignable to service {service_type}")]
    ExpectedImplAssignableToService {
        impl_type: String,
        service_type: String,
    },

    #[error("Unable to register open-generic implementation {impl_type} with \
             non-open-generic service {service_type}")]
    UnableToRegisterOpenGenericImplWithNonGenericService {
        impl_type: String,
        service_type: String,
    },

    #[error("Open-generic service {service_type} does not specify all type arguments \
             of implementation {impl_type}")]
    OpenGenericImplDoesNotSpecifyAllTypeArgs {
        impl_type: String,
        service_type: String,
    },

    #[error("Expected closed-generic service type but got {service_type}")]
    ExpectedClosedGenericServiceType { service_type: String },

    #[error("Expected non-abstract implementation type but {impl_type} declares no constructors")]
    ExpectedNonAbstractImplType { impl_type: String },

    #[error("No public constructor defined for {impl_type}")]
    NoPublicConstructorDefined { impl_type: String },

    #[error("Unable to select single constructor from {count} for {impl_type}; \
             provide a constructor selector rule")]
    UnableToSelectConstructor { impl_type: String, count: usize },

    #[error("Constructor of {impl_type} misses parameter {param} when resolving {request}")]
    ConstructorMissesSomeParameters {
        impl_type: String,
        param: String,
        request: String,
    },

    #[error("Expected function wrapper with multiple arguments but got {wrapper_type}")]
    ExpectedFuncWithMultipleArgs { wrapper_type: String },

    #[error("Unsupported function wrapper with arguments over non-constructor factory \
             when resolving {request}")]
    UnsupportedFuncWithArgs { request: String },

    #[error("Function wrapper parameters [{unused}] are unused when resolving {request}")]
    SomeFuncParamsAreUnused { unused: String, request: String },

    #[error("Recursive dependency detected in {request}")]
    RecursiveDependencyDetected { request: String },

    #[error("Scope is disposed")]
    ScopeIsDisposed,

    #[error("Container is garbage collected")]
    ContainerIsGarbageCollected,

    #[error("Unable to find registered items of {item_type} when resolving {request}")]
    UnableToFindRegisteredEnumerableItems { item_type: String, request: String },

    #[error("Unable to resolve enumerable item of {item_type}: {source_message}")]
    UnableToResolveEnumerableItems {
        item_type: String,
        source_message: String,
    },

    #[error("Delegate factory returned no expression when resolving {request}")]
    DelegateFactoryExpressionReturnedNull { request: String },

    #[error("Decorator {decorator_type} does not support function-wrapper resolution \
             over decorated service {service_type}")]
    DecoratorFactoryShouldSupportFuncResolution {
        decorator_type: String,
        service_type: String,
    },

    #[error("Generic wrapper {wrapper_type} expects single type argument by default; \
             specify the wrapped argument index")]
    GenericWrapperExpectsSingleTypeArgByDefault { wrapper_type: String },

    #[error("Unable to find open-generic implementation type argument of {impl_type} \
             for service {service_type}")]
    UnableToFindOpenGenericImplTypeArg {
        impl_type: String,
        service_type: String,
    },

    #[error("Retry exhausted: {operation}")]
    RetryExhausted { operation: String },

    #[error("Resolved object of {service_type} has unexpected concrete type")]
    WrongResolvedObjectType { service_type: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_embeds_types() {
        let err = ContainerError::ExpectedImplAssignableToService {
            impl_type: "Service".to_string(),
            service_type: "IService".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Service"));
        assert!(text.contains("IService"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        let err: anyhow::Error = ContainerError::ScopeIsDisposed.into();
        assert!(err.to_string().contains("disposed"));
        assert!(err.downcast_ref::<ContainerError>().is_some());
    }
}

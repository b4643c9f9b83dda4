//! karkas — inversion-of-control контейнер.
//!
//! Registry + resolver: по типу сервиса (и опциональному ключу) контейнер
//! конструирует полностью связанный экземпляр, рекурсивно разрешая
//! зависимости, применяя политики reuse, декораторы и встроенные generic
//! врапперы (func, lazy, many, metadata, debug-expression, enumerable).
//!
//! ## Архитектура модулей:
//!
//! ```text
//! src/
//! ├── hash_trie.rs   - персистентное AVL-дерево + atomic-swap ссылки кэшей
//! ├── type_token.rs  - токены типов, generic определения, ключи сервисов
//! ├── errors.rs      - единый enum ошибок контейнера
//! ├── scope.rs       - id -> instance кэш + disposal
//! ├── request.rs     - цепочка фреймов разрешения, обнаружение рекурсии
//! ├── expression.rs  - конструирующее IR и компиляция в фабрики
//! ├── factory.rs     - Reflection / Delegate / Provider фабрики, Setup
//! ├── reuse.rs       - singleton / current scope / resolution scope
//! ├── rules.rs       - подключаемые правила разрешения
//! ├── container.rs   - таблицы регистраций, resolve, декораторы, scopes
//! ├── wrappers.rs    - встроенные generic врапперы + enumerable правило
//! └── stats.rs       - счетчики контейнера
//! ```
//!
//! ## Пример:
//!
//! ```
//! use karkas::{Container, Ctor, Reuse};
//! use std::sync::Arc;
//!
//! struct Config { url: String }
//! struct Client { config: Arc<Config> }
//!
//! # fn main() -> anyhow::Result<()> {
//! let container = Container::new()?;
//! container.register_type::<Config>(
//!     Ctor::of::<Config, _>(vec![], |_| Ok(Config { url: "local".into() })),
//!     Some(Reuse::Singleton),
//! )?;
//! container.register_type::<Client>(
//!     Ctor::of::<Client, _>(
//!         vec![karkas::ParamSpec::of::<Config>("config")],
//!         |args| Ok(Client { config: args.take::<Config>()? }),
//!     ),
//!     None,
//! )?;
//!
//! let client = container.resolve::<Client>()?;
//! assert_eq!(client.config.url, "local");
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

pub mod container;
pub mod errors;
pub mod expression;
pub mod factory;
pub mod hash_trie;
pub mod request;
pub mod reuse;
pub mod rules;
pub mod scope;
pub mod stats;
pub mod type_token;
pub mod wrappers;

/// Универсальный type-erased экземпляр сервиса.
pub type Object = Arc<dyn Any + Send + Sync>;

// Основная поверхность API
pub use container::{Container, IfUnresolved};
pub use errors::ContainerError;
pub use expression::{
    compile_factory, CompiledFactory, Constants, DelegateValue, Expr, FuncValue, RegistryWeakRef,
    ResolutionScope, ScopeSource,
};
pub use factory::{
    next_factory_id, Args, ClosedImpl, Ctor, Factory, FactoryBody, ImplDesc, Member, OpenImpl,
    ParamSpec, Setup,
};
pub use request::{DependencyInfo, FactoryType, Request};
pub use reuse::Reuse;
pub use rules::ResolutionRules;
pub use scope::{Disposable, Scope};
pub use stats::ContainerStats;
pub use type_token::{GenericDef, ServiceKey, TypeToken};
pub use wrappers::{ExprView, LazyValue, ManyValue, MetaValue};

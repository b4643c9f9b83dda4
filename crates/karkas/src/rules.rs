//! Подключаемые правила разрешения.
//!
//! Правила расширяют контейнер без изменения его кода: фабрики для
//! незарегистрированных сервисов (так подключается enumerable и fallback на
//! другой контейнер), выбор ключей для параметров конструктора и членов,
//! разрешение неоднозначности нескольких default регистраций, выбор
//! конструктора.

use std::sync::Arc;

use anyhow::Result;

use crate::container::Container;
use crate::factory::{Ctor, Factory, Member, ParamSpec};
use crate::request::Request;
use crate::type_token::{ServiceKey, TypeToken};

/// Фабрика для незарегистрированного сервиса; первый не-None выигрывает.
pub type UnregisteredServiceRule =
    Arc<dyn Fn(&Request, &Arc<Container>) -> Result<Option<Factory>> + Send + Sync>;

/// Ключ для параметра конструктора; `None` — ключ по умолчанию.
pub type ParameterKeyRule = Arc<dyn Fn(&ParamSpec, &Request) -> Option<ServiceKey> + Send + Sync>;

/// Ключ для инжектируемого члена; `None` — член не инжектируется.
pub type MemberKeyRule = Arc<dyn Fn(&Member, &Request) -> Option<ServiceKey> + Send + Sync>;

/// Разрешение неоднозначности при нескольких default регистрациях.
pub type SingleDefaultRule =
    Arc<dyn Fn(&TypeToken, &[(usize, Factory)]) -> Option<Factory> + Send + Sync>;

/// Выбор конструктора из нескольких объявленных.
pub type ConstructorSelectorRule = Arc<dyn Fn(&[Ctor], &Request) -> Option<Ctor> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ResolutionRules {
    pub unregistered_services: Vec<UnregisteredServiceRule>,
    pub constructor_parameters: Vec<ParameterKeyRule>,
    pub members: Vec<MemberKeyRule>,
    pub single_default_factory: Option<SingleDefaultRule>,
    pub constructor_selector: Option<ConstructorSelectorRule>,
}

impl ResolutionRules {
    /// Первое сработавшее правило ключа параметра.
    pub(crate) fn parameter_key(&self, param: &ParamSpec, request: &Request) -> Option<ServiceKey> {
        self.constructor_parameters
            .iter()
            .find_map(|rule| rule.as_ref()(param, request))
    }

    /// Первое сработавшее правило ключа члена; `None` — член пропускается.
    pub(crate) fn member_key(&self, member: &Member, request: &Request) -> Option<ServiceKey> {
        self.members
            .iter()
            .find_map(|rule| rule.as_ref()(member, request))
    }
}

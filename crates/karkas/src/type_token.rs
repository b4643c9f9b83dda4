//! Типовые токены сервисов, generic определения и ключи регистрации.
//!
//! Rust не дает runtime reflection, поэтому generic сервисы моделируются
//! структурно: токен — это либо обычный тип (`TypeId` + имя), либо
//! применение заранее объявленного generic определения к списку аргументов.
//! Открытая (open-generic) форма — применение определения к переменным
//! унификации; закрытие происходит структурной унификацией view против
//! закрытого токена запроса.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::hash_trie::TrieKey;

static NEXT_DEF_ID: AtomicUsize = AtomicUsize::new(1);

/// Определение generic типа: конструктор типов с фиксированной арностью.
/// Дешево клонируемый handle; идентичность — по выданному при создании id,
/// не по имени.
#[derive(Debug, Clone)]
pub struct GenericDef(Arc<DefInner>);

#[derive(Debug)]
struct DefInner {
    id: usize,
    name: String,
    arity: usize,
}

impl GenericDef {
    pub fn new(name: &str, arity: usize) -> GenericDef {
        GenericDef(Arc::new(DefInner {
            id: NEXT_DEF_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            arity,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn arity(&self) -> usize {
        self.0.arity
    }

    /// Закрытый (или частично закрытый) токен этого определения.
    pub fn token(&self, args: Vec<TypeToken>) -> TypeToken {
        TypeToken::Generic {
            def: self.clone(),
            args,
        }
    }

    /// Открытая форма: все аргументы — переменные унификации.
    pub fn open(&self) -> TypeToken {
        TypeToken::Generic {
            def: self.clone(),
            args: (0..self.0.arity).map(TypeToken::Var).collect(),
        }
    }
}

impl PartialEq for GenericDef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for GenericDef {}

impl Hash for GenericDef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

/// Токен типа сервиса: номинальная идентичность запрашиваемого типа.
#[derive(Clone)]
pub enum TypeToken {
    /// Обычный Rust тип.
    Plain { id: TypeId, name: &'static str },
    /// Применение generic определения к аргументам.
    Generic {
        def: GenericDef,
        args: Vec<TypeToken>,
    },
    /// Переменная унификации (только внутри открытых форм и view).
    Var(usize),
}

impl TypeToken {
    pub fn of<T: Any>() -> TypeToken {
        TypeToken::Plain {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Токен открыт, если где-то внутри есть переменная унификации.
    pub fn is_open(&self) -> bool {
        match self {
            TypeToken::Plain { .. } => false,
            TypeToken::Var(_) => true,
            TypeToken::Generic { args, .. } => args.iter().any(|a| a.is_open()),
        }
    }

    /// Открытая форма закрытого generic токена; `None` для остальных.
    pub fn open_form(&self) -> Option<TypeToken> {
        match self {
            TypeToken::Generic { def, .. } => Some(def.open()),
            _ => None,
        }
    }

    pub fn generic_def(&self) -> Option<&GenericDef> {
        match self {
            TypeToken::Generic { def, .. } => Some(def),
            _ => None,
        }
    }

    pub fn generic_args(&self) -> &[TypeToken] {
        match self {
            TypeToken::Generic { args, .. } => args,
            _ => &[],
        }
    }

    /// Структурная унификация view (может содержать `Var`) против закрытого
    /// токена. Связывает переменные в `bound`; противоречие — `false`.
    pub fn unify(&self, closed: &TypeToken, bound: &mut [Option<TypeToken>]) -> bool {
        match (self, closed) {
            (TypeToken::Var(i), other) => match &bound[*i] {
                Some(existing) => existing == other,
                None => {
                    bound[*i] = Some(other.clone());
                    true
                }
            },
            (TypeToken::Plain { id: a, .. }, TypeToken::Plain { id: b, .. }) => a == b,
            (
                TypeToken::Generic { def: d1, args: a1 },
                TypeToken::Generic { def: d2, args: a2 },
            ) => {
                d1 == d2
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2).all(|(x, y)| x.unify(y, bound))
            }
            _ => false,
        }
    }

    /// Подстановка связанных переменных; `None` если осталась несвязанная.
    pub fn substitute(&self, bound: &[Option<TypeToken>]) -> Option<TypeToken> {
        match self {
            TypeToken::Plain { .. } => Some(self.clone()),
            TypeToken::Var(i) => bound.get(*i).and_then(|b| b.clone()),
            TypeToken::Generic { def, args } => {
                let mut closed_args = Vec::with_capacity(args.len());
                for a in args {
                    closed_args.push(a.substitute(bound)?);
                }
                Some(TypeToken::Generic {
                    def: def.clone(),
                    args: closed_args,
                })
            }
        }
    }

    /// Короткое имя для сообщений об ошибках и логов.
    pub fn short_name(&self) -> String {
        match self {
            TypeToken::Plain { name, .. } => shorten(name).to_string(),
            TypeToken::Generic { def, .. } => def.name().to_string(),
            TypeToken::Var(i) => format!("T{i}"),
        }
    }
}

fn shorten(type_name: &str) -> &str {
    // `a::b::Type<c::d::Arg>` — обрезаем пути модулей, но не внутри `<...>`
    match type_name.find('<') {
        None => type_name.rsplit("::").next().unwrap_or(type_name),
        Some(lt) => {
            let head = &type_name[..lt];
            head.rsplit("::").next().unwrap_or(head)
        }
    }
}

impl PartialEq for TypeToken {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeToken::Plain { id: a, .. }, TypeToken::Plain { id: b, .. }) => a == b,
            (
                TypeToken::Generic { def: d1, args: a1 },
                TypeToken::Generic { def: d2, args: a2 },
            ) => d1 == d2 && a1 == a2,
            (TypeToken::Var(a), TypeToken::Var(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TypeToken {}

impl Hash for TypeToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TypeToken::Plain { id, .. } => {
                0u8.hash(state);
                id.hash(state);
            }
            TypeToken::Generic { def, args } => {
                1u8.hash(state);
                def.hash(state);
                args.hash(state);
            }
            TypeToken::Var(i) => {
                2u8.hash(state);
                i.hash(state);
            }
        }
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeToken::Plain { .. } => write!(f, "{}", self.short_name()),
            TypeToken::Generic { def, args } => {
                write!(f, "{}<", def.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ">")
            }
            TypeToken::Var(i) => write!(f, "T{i}"),
        }
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl TrieKey for TypeToken {
    fn trie_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Ключ сервиса внутри одного типа: без ключа, по индексу регистрации
/// или по имени.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ServiceKey {
    Default,
    Index(usize),
    Name(String),
}

impl ServiceKey {
    pub fn named(name: &str) -> ServiceKey {
        ServiceKey::Name(name.to_string())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Default => write!(f, "default"),
            ServiceKey::Index(i) => write!(f, "#{i}"),
            ServiceKey::Name(n) => write!(f, "\"{n}\""),
        }
    }
}

impl TrieKey for (TypeToken, ServiceKey) {
    fn trie_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        self.1.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_plain_token_identity() {
        assert_eq!(TypeToken::of::<Alpha>(), TypeToken::of::<Alpha>());
        assert_ne!(TypeToken::of::<Alpha>(), TypeToken::of::<Beta>());
    }

    #[test]
    fn test_open_and_closed_forms() {
        let repo = GenericDef::new("IRepo", 1);
        let open = repo.open();
        let closed = repo.token(vec![TypeToken::of::<Alpha>()]);
        assert!(open.is_open());
        assert!(!closed.is_open());
        assert_eq!(closed.open_form(), Some(open));
    }

    #[test]
    fn test_unify_binds_variables() {
        let pair = GenericDef::new("Pair", 2);
        let view = pair.token(vec![TypeToken::Var(0), TypeToken::Var(1)]);
        let closed = pair.token(vec![TypeToken::of::<Alpha>(), TypeToken::of::<Beta>()]);

        let mut bound = vec![None, None];
        assert!(view.unify(&closed, &mut bound));
        assert_eq!(bound[0], Some(TypeToken::of::<Alpha>()));
        assert_eq!(bound[1], Some(TypeToken::of::<Beta>()));
    }

    #[test]
    fn test_unify_rejects_contradiction() {
        let pair = GenericDef::new("Pair", 2);
        // Одна переменная в обеих позициях требует одинаковых аргументов
        let view = pair.token(vec![TypeToken::Var(0), TypeToken::Var(0)]);
        let closed = pair.token(vec![TypeToken::of::<Alpha>(), TypeToken::of::<Beta>()]);

        let mut bound = vec![None];
        assert!(!view.unify(&closed, &mut bound));
    }

    #[test]
    fn test_substitute_requires_all_bindings() {
        let repo = GenericDef::new("IRepo", 1);
        let view = repo.token(vec![TypeToken::Var(0)]);
        assert_eq!(view.substitute(&[None]), None);
        let closed = view.substitute(&[Some(TypeToken::of::<Alpha>())]);
        assert_eq!(closed, Some(repo.token(vec![TypeToken::of::<Alpha>()])));
    }

    #[test]
    fn test_display_formats() {
        let repo = GenericDef::new("IRepo", 1);
        let token = repo.token(vec![TypeToken::of::<Alpha>()]);
        assert_eq!(token.to_string(), "IRepo<Alpha>");
        assert_eq!(ServiceKey::named("db").to_string(), "\"db\"");
    }
}

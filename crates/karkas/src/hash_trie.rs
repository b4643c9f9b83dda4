//! Персистентное immutable дерево для lock-free кэшей контейнера.
//!
//! АРХИТЕКТУРНЫЕ РЕШЕНИЯ:
//! - Чистое AVL дерево с ключом сравнения = hash(key); коллизии хэшей
//!   складываются в список конфликтов узла
//! - Все операции функциональные: `insert` возвращает новый корень, старые
//!   снапшоты остаются валидными для читателей без какой-либо синхронизации
//! - Публикация нового корня через `ArcSwap::compare_and_swap`; писатель
//!   перестраивает от свежего снапшота и повторяет, читатели не блокируются
//! - In-order обход отдает записи в порядке возрастания hash, поэтому для
//!   `usize` ключей с identity-hash обход совпадает с порядком вставки

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::errors::ContainerError;

/// Жесткая граница retry-цикла публикации нового корня.
const MAX_SWAP_RETRIES: usize = 50;

fn std_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Ключ дерева. Отдельный trait вместо `std::hash::Hash`, потому что
/// `usize` ключи (factory id, индексы регистраций) используют identity-hash:
/// это дает упорядоченный по ключу in-order обход.
pub trait TrieKey: Clone + Eq + Send + Sync {
    fn trie_hash(&self) -> u64;
}

impl TrieKey for usize {
    fn trie_hash(&self) -> u64 {
        *self as u64
    }
}

impl TrieKey for String {
    fn trie_hash(&self) -> u64 {
        std_hash(self.as_str())
    }
}

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    /// Записи с тем же hash, но другим ключом. Почти всегда пуст.
    conflicts: Vec<(K, V)>,
    left: Option<Arc<Node<K, V>>>,
    right: Option<Arc<Node<K, V>>>,
    height: u32,
}

/// Персистентная immutable map: каждая вставка возвращает новое дерево,
/// разделяющее неизмененные поддеревья со старым.
pub struct HashTrie<K, V> {
    root: Option<Arc<Node<K, V>>>,
}

impl<K, V> Clone for HashTrie<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<K, V> Default for HashTrie<K, V> {
    fn default() -> Self {
        Self { root: None }
    }
}

impl<K: TrieKey, V: Clone> HashTrie<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hash = key.trie_hash();
        let mut node = self.root.as_ref();
        while let Some(n) = node {
            if hash == n.hash {
                if &n.key == key {
                    return Some(n.value.clone());
                }
                return n
                    .conflicts
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone());
            }
            node = if hash < n.hash {
                n.left.as_ref()
            } else {
                n.right.as_ref()
            };
        }
        None
    }

    /// Вставка или замена значения. Возвращает новое дерево.
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = key.trie_hash();
        Self {
            root: Some(insert_node(&self.root, hash, key, value)),
        }
    }

    /// In-order обход: по возрастанию hash, конфликты следом за своим узлом.
    pub fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        fn walk<K, V>(node: &Option<Arc<Node<K, V>>>, f: &mut dyn FnMut(&K, &V)) {
            if let Some(n) = node {
                walk(&n.left, f);
                f(&n.key, &n.value);
                for (k, v) in &n.conflicts {
                    f(k, v);
                }
                walk(&n.right, f);
            }
        }
        walk(&self.root, f);
    }

    pub fn to_vec(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        self.for_each(&mut |k, v| out.push((k.clone(), v.clone())));
        out
    }

    pub fn len(&self) -> usize {
        let mut count = 0usize;
        self.for_each(&mut |_, _| count += 1);
        count
    }
}

fn height<K, V>(node: &Option<Arc<Node<K, V>>>) -> u32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn make_node<K: TrieKey, V: Clone>(
    hash: u64,
    key: K,
    value: V,
    conflicts: Vec<(K, V)>,
    left: Option<Arc<Node<K, V>>>,
    right: Option<Arc<Node<K, V>>>,
) -> Arc<Node<K, V>> {
    let height = 1 + height(&left).max(height(&right));
    Arc::new(Node {
        hash,
        key,
        value,
        conflicts,
        left,
        right,
        height,
    })
}

fn insert_node<K: TrieKey, V: Clone>(
    node: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: K,
    value: V,
) -> Arc<Node<K, V>> {
    let n = match node {
        None => return make_node(hash, key, value, Vec::new(), None, None),
        Some(n) => n,
    };

    if hash == n.hash {
        if n.key == key {
            return make_node(
                hash,
                key,
                value,
                n.conflicts.clone(),
                n.left.clone(),
                n.right.clone(),
            );
        }
        let mut conflicts = n.conflicts.clone();
        match conflicts.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => conflicts.push((key, value)),
        }
        return make_node(
            n.hash,
            n.key.clone(),
            n.value.clone(),
            conflicts,
            n.left.clone(),
            n.right.clone(),
        );
    }

    let (left, right) = if hash < n.hash {
        (
            Some(insert_node(&n.left, hash, key, value)),
            n.right.clone(),
        )
    } else {
        (
            n.left.clone(),
            Some(insert_node(&n.right, hash, key, value)),
        )
    };
    balance(make_node(
        n.hash,
        n.key.clone(),
        n.value.clone(),
        n.conflicts.clone(),
        left,
        right,
    ))
}

fn balance<K: TrieKey, V: Clone>(node: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let lh = height(&node.left);
    let rh = height(&node.right);
    if lh > rh + 1 {
        // unwrap-free: lh > 0 гарантирует наличие левого поддерева
        let left = match &node.left {
            Some(l) => l.clone(),
            None => return node,
        };
        if height(&left.right) > height(&left.left) {
            let lr = match &left.right {
                Some(lr) => lr.clone(),
                None => return node,
            };
            // double rotation: left-right
            let new_left = make_node(
                left.hash,
                left.key.clone(),
                left.value.clone(),
                left.conflicts.clone(),
                left.left.clone(),
                lr.left.clone(),
            );
            let new_right = make_node(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                lr.right.clone(),
                node.right.clone(),
            );
            return make_node(
                lr.hash,
                lr.key.clone(),
                lr.value.clone(),
                lr.conflicts.clone(),
                Some(new_left),
                Some(new_right),
            );
        }
        // single rotation: right
        let new_right = make_node(
            node.hash,
            node.key.clone(),
            node.value.clone(),
            node.conflicts.clone(),
            left.right.clone(),
            node.right.clone(),
        );
        return make_node(
            left.hash,
            left.key.clone(),
            left.value.clone(),
            left.conflicts.clone(),
            left.left.clone(),
            Some(new_right),
        );
    }
    if rh > lh + 1 {
        let right = match &node.right {
            Some(r) => r.clone(),
            None => return node,
        };
        if height(&right.left) > height(&right.right) {
            let rl = match &right.left {
                Some(rl) => rl.clone(),
                None => return node,
            };
            // double rotation: right-left
            let new_left = make_node(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                node.left.clone(),
                rl.left.clone(),
            );
            let new_right = make_node(
                right.hash,
                right.key.clone(),
                right.value.clone(),
                right.conflicts.clone(),
                rl.right.clone(),
                right.right.clone(),
            );
            return make_node(
                rl.hash,
                rl.key.clone(),
                rl.value.clone(),
                rl.conflicts.clone(),
                Some(new_left),
                Some(new_right),
            );
        }
        // single rotation: left
        let new_left = make_node(
            node.hash,
            node.key.clone(),
            node.value.clone(),
            node.conflicts.clone(),
            node.left.clone(),
            right.left.clone(),
        );
        return make_node(
            right.hash,
            right.key.clone(),
            right.value.clone(),
            right.conflicts.clone(),
            Some(new_left),
            right.right.clone(),
        );
    }
    node
}

/// Атомарно публикуемая ссылка на immutable снапшот (корень trie).
///
/// Читатели берут снапшот без блокировок; писатели перестраивают значение
/// от свежего снапшота и публикуют через compare-and-swap с ограниченным
/// числом повторов.
pub struct CacheRef<T> {
    cell: ArcSwap<T>,
}

impl<T> CacheRef<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: ArcSwap::from_pointee(value),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.cell.load_full()
    }

    /// CAS-цикл: `update` получает актуальный снапшот и строит новый.
    /// `update` может выполниться несколько раз — он обязан быть чистым.
    pub fn swap(&self, update: &dyn Fn(&T) -> T) -> Result<Arc<T>> {
        for _ in 0..MAX_SWAP_RETRIES {
            let current = self.cell.load_full();
            let next = Arc::new(update(&current));
            let previous = self.cell.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&previous, &current) {
                return Ok(next);
            }
        }
        Err(ContainerError::RetryExhausted {
            operation: "cache root swap".to_string(),
        }
        .into())
    }
}

impl<T: Default> Default for CacheRef<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

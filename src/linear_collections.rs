/// A Vec-backed multi-map from `K` to `V` with O(n) lookups. Each key can
/// correspond to 0 or more values, kept in insertion order.
pub struct LinMultiMap<K, V> {
    backing: Vec<(K, V)>,
}

impl<K: Eq + Copy, V: Copy> LinMultiMap<K, V> {
    pub fn new() -> LinMultiMap<K, V> {
        LinMultiMap::<K, V> {
            backing: Vec::new(),
        }
    }
    pub fn insert(&mut self, k: K, v: V) {
        self.backing.push((k, v));
    }
    pub fn get<'a>(&'a self, k: &K) -> impl Iterator<Item = &'a V> {
        let owned_k = *k;
        self.backing
            .iter()
            .filter(move |(k1, _)| k1 == &owned_k)
            .map(|(_, v)| v)
    }
    pub fn get_all<'a>(&'a self, k: &K) -> Vec<&'a V> {
        self.get(k).collect()
    }
    /// Removes every value stored under `k` and returns them in insertion
    /// order.
    pub fn remove_all(&mut self, k: &K) -> Vec<V> {
        let mut removed = Vec::new();
        self.backing.retain(|(k1, v)| {
            if k1 == k {
                removed.push(*v);
                false
            } else {
                true
            }
        });
        removed
    }
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.backing.iter().map(|(k, _)| k)
    }
    pub fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }
}

/// A Vec-backed map from `K` to `V` with O(n) lookups.
pub struct LinMap<K, V> {
    backing: Vec<(K, V)>,
}

impl<K: Eq + Copy, V: Copy> LinMap<K, V> {
    pub fn new() -> LinMap<K, V> {
        LinMap::<K, V> {
            backing: Vec::new(),
        }
    }
    /// Inserts `v` under `k`, returning the value it replaced.
    pub fn insert(&mut self, k: K, v: V) -> Option<V> {
        match self.backing.iter_mut().find(|(k1, _)| *k1 == k) {
            Some((_, old)) => Some(std::mem::replace(old, v)),
            None => {
                self.backing.push((k, v));
                None
            }
        }
    }
    pub fn get(&self, k: &K) -> Option<V> {
        self.backing
            .iter()
            .find(|(k1, _)| k1 == k)
            .map(|(_, v)| *v)
    }
}

impl<K: Eq + Copy, V: Copy> Default for LinMultiMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Copy, V: Copy> Default for LinMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

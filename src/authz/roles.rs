//! Role hierarchy: one graph per role definition, answering "does member M
//! hold role R (directly or transitively)".

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexSet;

/// Default bound on inheritance hops followed from a member.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// `member` inherits `role`, optionally only within `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleFact {
    pub member: String,
    pub role: String,
    pub domain: Option<String>,
}

impl RoleFact {
    pub fn new(member: &str, role: &str, domain: Option<&str>) -> Self {
        Self {
            member: member.to_string(),
            role: role.to_string(),
            domain: domain.map(str::to_string),
        }
    }

    /// Build from a record's values: `[member, role]` or `[member, role, domain]`.
    pub fn from_values(values: &[String]) -> Self {
        Self {
            member: values[0].clone(),
            role: values[1].clone(),
            domain: values.get(2).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoleOptions {
    pub max_depth: usize,
    /// Memoize each member's reachable roles.
    pub cache: bool,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            cache: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    role: u32,
    domain: Option<u32>,
}

/// Interned, index-based role graph for a single relation.
#[derive(Debug)]
pub struct RoleGraph {
    domain: bool,
    options: RoleOptions,
    facts: IndexSet<RoleFact>,
    /// Every member, role and domain name; a name's id is its index.
    names: IndexSet<String>,
    /// Outgoing member -> role edges, indexed by member id.
    edges: Vec<Vec<Edge>>,
    reachable: Option<DashMap<(u32, Option<u32>), Arc<HashSet<u32>>>>,
}

impl Clone for RoleGraph {
    fn clone(&self) -> Self {
        // a clone is about to diverge, so it starts with an empty cache
        Self {
            domain: self.domain,
            options: self.options,
            facts: self.facts.clone(),
            names: self.names.clone(),
            edges: self.edges.clone(),
            reachable: self.options.cache.then(DashMap::new),
        }
    }
}

impl RoleGraph {
    pub fn new(domain: bool, options: RoleOptions) -> Self {
        Self {
            domain,
            options,
            facts: IndexSet::new(),
            names: IndexSet::new(),
            edges: Vec::new(),
            reachable: options.cache.then(DashMap::new),
        }
    }

    pub fn is_domain_scoped(&self) -> bool {
        self.domain
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Facts in insertion order.
    pub fn facts(&self) -> impl Iterator<Item = &RoleFact> {
        self.facts.iter()
    }

    /// Returns `false` if the fact was already present.
    pub fn add(&mut self, fact: RoleFact) -> bool {
        if self.facts.contains(&fact) {
            return false;
        }
        let member = self.intern(&fact.member);
        let role = self.intern(&fact.role);
        let domain = fact.domain.as_deref().map(|d| self.intern(d));
        self.edges[member as usize].push(Edge { role, domain });
        self.facts.insert(fact);
        self.invalidate();
        true
    }

    /// Returns `false` if the fact was not present.
    pub fn remove(&mut self, fact: &RoleFact) -> bool {
        if !self.facts.shift_remove(fact) {
            return false;
        }
        self.rebuild();
        true
    }

    /// Reflexive, transitive membership test. Terminates on cyclic facts.
    pub fn has_role(&self, member: &str, role: &str, domain: Option<&str>) -> bool {
        if member == role {
            return true;
        }
        let (Some(start), Some(target)) = (self.id(member), self.id(role)) else {
            return false;
        };
        let Some(domain) = self.domain_id(domain) else {
            return false;
        };

        if let Some(cache) = &self.reachable {
            let set = cache
                .entry((start, domain))
                .or_insert_with(|| Arc::new(self.walk(start, domain).into_iter().collect()))
                .value()
                .clone();
            return set.contains(&target);
        }

        let mut found = false;
        self.traverse(start, domain, |id| {
            found = id == target;
            found
        });
        found
    }

    /// Roles `member` holds directly.
    pub fn roles_for(&self, member: &str, domain: Option<&str>) -> Vec<String> {
        let (Some(start), Some(domain)) = (self.id(member), self.domain_id(domain)) else {
            return Vec::new();
        };
        self.edges[start as usize]
            .iter()
            .filter(|e| e.domain == domain)
            .map(|e| self.names[e.role as usize].clone())
            .collect()
    }

    /// Every role reachable from `member`, nearest first, without `member`.
    pub fn implicit_roles_for(&self, member: &str, domain: Option<&str>) -> Vec<String> {
        let (Some(start), Some(domain)) = (self.id(member), self.domain_id(domain)) else {
            return Vec::new();
        };
        self.walk(start, domain)
            .into_iter()
            .map(|id| self.names[id as usize].clone())
            .collect()
    }

    /// Identifiers that hold `role` directly.
    pub fn members_of(&self, role: &str, domain: Option<&str>) -> Vec<String> {
        self.facts
            .iter()
            .filter(|f| f.role == role && f.domain.as_deref() == domain)
            .map(|f| f.member.clone())
            .collect()
    }

    fn id(&self, name: &str) -> Option<u32> {
        self.names.get_index_of(name).map(|i| i as u32)
    }

    /// `Some(None)` for an unscoped query, `None` for an unknown domain.
    fn domain_id(&self, domain: Option<&str>) -> Option<Option<u32>> {
        match domain {
            None => Some(None),
            Some(d) => self.id(d).map(Some),
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        let (idx, inserted) = self.names.insert_full(name.to_string());
        if inserted {
            self.edges.push(Vec::new());
        }
        idx as u32
    }

    fn invalidate(&mut self) {
        if let Some(cache) = &self.reachable {
            cache.clear();
        }
    }

    fn rebuild(&mut self) {
        let facts = std::mem::take(&mut self.facts);
        self.names.clear();
        self.edges.clear();
        for fact in facts {
            self.add(fact);
        }
        self.invalidate();
    }

    fn walk(&self, start: u32, domain: Option<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        self.traverse(start, domain, |id| {
            out.push(id);
            false
        });
        out
    }

    /// Breadth-first over member -> role edges of `domain`, at most
    /// `max_depth` hops from `start`. `visit` sees each reachable role once
    /// (never `start`) and stops the walk by returning `true`.
    fn traverse(&self, start: u32, domain: Option<u32>, mut visit: impl FnMut(u32) -> bool) {
        let mut visited = BitSet::with_capacity(self.names.len());
        visited.insert(start);
        let mut queue = VecDeque::from([(start, 0usize)]);

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= self.options.max_depth {
                continue;
            }
            for edge in &self.edges[node as usize] {
                if edge.domain != domain || !visited.insert(edge.role) {
                    continue;
                }
                if visit(edge.role) {
                    return;
                }
                queue.push_back((edge.role, depth + 1));
            }
        }
    }
}

/// Fixed-size visited set keyed by interned id.
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    /// Returns `true` if the bit was not already set.
    fn insert(&mut self, bit: u32) -> bool {
        let (word, mask) = (bit as usize / 64, 1u64 << (bit % 64));
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }
}

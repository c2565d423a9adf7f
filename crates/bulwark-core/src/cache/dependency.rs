//! Dependency graph between cache keys.
//!
//! Design:
//! - Forward edges: key -> keys it depends on
//! - Reverse edges: key -> keys that depend on it (invalidated with it)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! Cycles are allowed. Every walk keeps a visited set.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, HashSet<String>>,
    reverse_edges: HashMap<String, HashSet<String>>,
}

/// Result of a cascade walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cascade {
    /// Root first, then dependents in breadth-first order, each once.
    pub keys: Vec<String>,
    /// A node was reached twice (diamond or cycle).
    pub revisited: bool,
}

fn unlink(map: &mut HashMap<String, HashSet<String>>, from: &str, to: &str) {
    if let Entry::Occupied(mut e) = map.entry(from.to_string()) {
        e.get_mut().remove(to);
        if e.get().is_empty() {
            e.remove_entry();
        }
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `key` depends on `depends_on`: invalidating `depends_on` invalidates `key`.
    pub fn add_dependency(&mut self, key: &str, depends_on: &str) {
        self.edges
            .entry(key.to_string())
            .or_default()
            .insert(depends_on.to_string());
        self.reverse_edges
            .entry(depends_on.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn remove_dependency(&mut self, key: &str, depends_on: &str) {
        unlink(&mut self.edges, key, depends_on);
        unlink(&mut self.reverse_edges, depends_on, key);
    }

    /// Drop every forward edge of `key`. Keys depending on `key` keep their
    /// edges, so a later invalidation of a re-inserted `key` still reaches them.
    pub fn remove_key(&mut self, key: &str) {
        for dep in self.dependencies(key) {
            self.remove_dependency(key, &dep);
        }
    }

    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.reverse_edges
            .get(key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependencies(&self, key: &str) -> Vec<String> {
        self.edges
            .get(key)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, key: &str) -> bool {
        self.edges.get(key).is_some_and(|d| !d.is_empty())
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.reverse_edges.clear();
    }

    /// `root` plus everything that transitively depends on it.
    pub fn cascade(&self, root: &str) -> Cascade {
        let mut visited: HashSet<String> = HashSet::new();
        let mut keys = Vec::new();
        let mut queue = VecDeque::from([root.to_string()]);
        let mut revisited = false;

        visited.insert(root.to_string());
        while let Some(key) = queue.pop_front() {
            if let Some(dependents) = self.reverse_edges.get(&key) {
                for dependent in dependents {
                    if visited.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    } else {
                        revisited = true;
                    }
                }
            }
            keys.push(key);
        }
        Cascade { keys, revisited }
    }

    /// First cycle found (as a key path that starts and ends on the same key),
    /// or `None` if the graph is acyclic.
    ///
    /// Iterative three-colour DFS over the forward edges: O(V + E).
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> = HashMap::new();
        let mut starts: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        starts.sort_unstable();

        for start in starts {
            if color.contains_key(start) {
                continue;
            }
            // (node, its dependencies, next index)
            let mut stack: Vec<(&str, Vec<&str>, usize)> = Vec::new();
            color.insert(start, Color::Gray);
            stack.push((start, self.sorted_deps(start), 0));

            while let Some((node, deps, idx)) = stack.last_mut() {
                if *idx >= deps.len() {
                    color.insert(*node, Color::Black);
                    stack.pop();
                    continue;
                }
                let dep = deps[*idx];
                *idx += 1;
                match color.get(dep) {
                    Some(Color::Gray) => {
                        let mut path: Vec<String> = stack
                            .iter()
                            .map(|(n, _, _)| n.to_string())
                            .skip_while(|n| n != dep)
                            .collect();
                        path.push(dep.to_string());
                        return Some(path);
                    }
                    Some(Color::Black) => {}
                    None => {
                        color.insert(dep, Color::Gray);
                        let next = self.sorted_deps(dep);
                        stack.push((dep, next, 0));
                    }
                }
            }
        }
        None
    }

    fn sorted_deps(&self, key: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .edges
            .get(key)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default();
        deps.sort_unstable();
        deps
    }
}

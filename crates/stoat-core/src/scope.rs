use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

// Scope — A chain of variable namespaces
//
// A scope maps variable names to variables; a lookup that misses locally
// falls through to the parent. The recurrence engine gives every sequence
// position its own child scope, so a step program can use fixed local names
// (its inputs, its state, its intermediates) without colliding across
// steps, while still seeing the enclosing scope's parameters through the
// parent chain.
//
// OWNERSHIP:
//
//   The owning direction is enclosing scope → scope-list variable → child
//   scopes. `new_child` returns a scope owned by the caller; the parent
//   back-reference is a Weak used only for lookup fallthrough, never for
//   destruction. Dropping the variable that holds a step-scope list drops
//   every per-step variable created inside those scopes.
//
//   Scope itself is a cheap Arc handle (like Tensor): cloning one aliases
//   the same namespace. The canonical owner of per-step scopes is the list
//   stored in the enclosing scope; the sequencer works on handle copies.

/// A value bound to a name in a scope: either a tensor, or the list of
/// per-step child scopes a forward recurrence leaves behind for its
/// backward pass.
#[derive(Debug, Clone)]
pub enum Variable<B: Backend> {
    Tensor(Tensor<B>),
    ScopeList(Vec<Scope<B>>),
}

struct ScopeInner<B: Backend> {
    vars: HashMap<String, Variable<B>>,
    /// Non-owning back-reference for lookup fallthrough.
    parent: Option<Weak<RwLock<ScopeInner<B>>>>,
    /// Counter for generated temporary names.
    temp_counter: usize,
}

/// A variable namespace with parent fallthrough.
pub struct Scope<B: Backend> {
    inner: Arc<RwLock<ScopeInner<B>>>,
}

impl<B: Backend> Clone for Scope<B> {
    fn clone(&self) -> Self {
        Scope {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Scope<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.read() {
            Ok(guard) => write!(f, "Scope({} vars)", guard.vars.len()),
            Err(_) => write!(f, "Scope(<poisoned>)"),
        }
    }
}

impl<B: Backend> Default for Scope<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Scope<B> {
    /// Create a new root scope with no parent.
    pub fn new() -> Self {
        Scope {
            inner: Arc::new(RwLock::new(ScopeInner {
                vars: HashMap::new(),
                parent: None,
                temp_counter: 0,
            })),
        }
    }

    /// Create a child scope. The child is owned by the caller; this scope
    /// keeps no reference to it. Lookups in the child fall through to this
    /// scope on miss.
    pub fn new_child(&self) -> Scope<B> {
        Scope {
            inner: Arc::new(RwLock::new(ScopeInner {
                vars: HashMap::new(),
                parent: Some(Arc::downgrade(&self.inner)),
                temp_counter: 0,
            })),
        }
    }

    /// Whether two handles refer to the physically same scope.
    pub fn same_as(&self, other: &Scope<B>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Look up a variable, locally first, then up the parent chain.
    pub fn find(&self, name: &str) -> Option<Variable<B>> {
        let mut cur = Arc::clone(&self.inner);
        loop {
            let parent = {
                let guard = cur.read().ok()?;
                if let Some(var) = guard.vars.get(name) {
                    return Some(var.clone());
                }
                guard.parent.as_ref().and_then(|w| w.upgrade())
            };
            match parent {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    /// Look up a tensor variable, failing if it is missing or holds a
    /// scope list.
    pub fn find_tensor(&self, name: &str) -> Result<Tensor<B>> {
        match self.find(name) {
            Some(Variable::Tensor(t)) => Ok(t),
            Some(Variable::ScopeList(_)) => Err(Error::VarWrongKind {
                name: name.to_string(),
                expected: "tensor",
            }),
            None => Err(Error::VarNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Look up a step-scope list variable.
    pub fn find_scope_list(&self, name: &str) -> Result<Vec<Scope<B>>> {
        match self.find(name) {
            Some(Variable::ScopeList(list)) => Ok(list),
            Some(Variable::Tensor(_)) => Err(Error::VarWrongKind {
                name: name.to_string(),
                expected: "scope list",
            }),
            None => Err(Error::VarNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Bind a variable locally, creating or overwriting it. Never touches
    /// the parent chain.
    pub fn set_var(&self, name: impl Into<String>, var: Variable<B>) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| Error::msg("scope lock poisoned"))?;
        guard.vars.insert(name.into(), var);
        Ok(())
    }

    /// Bind a tensor locally. Binding a clone of another scope's tensor is
    /// the zero-copy share-data link the recurrence drivers are built on.
    pub fn set_tensor(&self, name: impl Into<String>, tensor: Tensor<B>) -> Result<()> {
        self.set_var(name, Variable::Tensor(tensor))
    }

    /// Bind a step-scope list locally.
    pub fn set_scope_list(&self, name: impl Into<String>, list: Vec<Scope<B>>) -> Result<()> {
        self.set_var(name, Variable::ScopeList(list))
    }

    /// The names bound locally in this scope, ignoring the parent chain.
    pub fn local_names(&self) -> HashSet<String> {
        match self.inner.read() {
            Ok(guard) => guard.vars.keys().cloned().collect(),
            Err(_) => HashSet::new(),
        }
    }

    /// All visible names: local ones, plus — when `recursive` — everything
    /// reachable up the parent chain.
    pub fn all_names(&self, recursive: bool) -> HashSet<String> {
        let mut names = self.local_names();
        if recursive {
            let mut cur = {
                let guard = match self.inner.read() {
                    Ok(g) => g,
                    Err(_) => return names,
                };
                guard.parent.as_ref().and_then(|w| w.upgrade())
            };
            while let Some(p) = cur {
                let next = match p.read() {
                    Ok(guard) => {
                        names.extend(guard.vars.keys().cloned());
                        guard.parent.as_ref().and_then(|w| w.upgrade())
                    }
                    Err(_) => None,
                };
                cur = next;
            }
        }
        names
    }

    /// Generate a fresh local name for an unnamed temporary (the gradient
    /// merge binds short-lived aliases under these).
    pub fn temp_name(&self) -> String {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let n = guard.temp_counter;
        guard.temp_counter += 1;
        format!("@tmp_{}", n)
    }
}

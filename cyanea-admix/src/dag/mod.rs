//! Dependency graph of model variables.
//!
//! Variables live in an arena and are addressed by [`VariableId`]. Edges run
//! from parents to children and the graph is acyclic by construction: a
//! variable can only name parents that already exist.
//!
//! A proposal mutates variables, then [`ModelGraph::touch`]es them. Touching
//! marks the variable and everything downstream dirty, and snapshots the
//! committed log density (stochastic) or value (deterministic) the first time
//! a variable is touched. Deterministic values and log densities are then
//! recomputed lazily when read. [`ModelGraph::keep`] commits the new state,
//! [`ModelGraph::restore`] brings the snapshots back.

pub mod density;
pub mod value;

use std::collections::BTreeSet;
use std::fmt;

use cyanea_core::{CyaneaError, Result, Summarizable};

use crate::network::AdmixtureNetwork;

pub use density::{
    Density, ExponentialPrior, Flat, Function, GammaPrior, Param, PoissonPrior, UniformPrior,
};
pub use value::{SquareMatrix, Value};

/// Index of a variable in its [`ModelGraph`].
pub type VariableId = usize;

/// How a variable obtains its value.
pub enum Kind {
    Constant,
    Stochastic(Box<dyn Density>),
    Deterministic(Box<dyn Function>),
}

impl Kind {
    fn label(&self) -> &'static str {
        match self {
            Kind::Constant => "constant",
            Kind::Stochastic(_) => "stochastic",
            Kind::Deterministic(_) => "deterministic",
        }
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// New definition for [`ModelGraph::replace`].
pub enum Replacement {
    Constant(Value),
    Stochastic {
        value: Value,
        density: Box<dyn Density>,
        parents: Vec<VariableId>,
    },
    Deterministic {
        function: Box<dyn Function>,
        parents: Vec<VariableId>,
    },
}

#[derive(Debug)]
struct Variable {
    name: String,
    kind: Kind,
    value: Value,
    /// Value before the first touch since the last keep/restore.
    stored_value: Option<Value>,
    /// Cached log density; meaningful for stochastic variables only.
    ln_density: f64,
    stored_ln_density: Option<f64>,
    parents: Vec<VariableId>,
    children: Vec<VariableId>,
    dirty: bool,
    touched: bool,
    /// Value of the graph clock at the last touch.
    generation: u64,
}

/// Arena of model variables with touch/restore/keep bookkeeping.
#[derive(Debug, Default)]
pub struct ModelGraph {
    variables: Vec<Variable>,
    clock: u64,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    // ── Construction ────────────────────────────────────────────────────

    pub fn add_constant(&mut self, name: impl Into<String>, value: Value) -> VariableId {
        let id = self.variables.len();
        self.variables.push(Variable {
            name: name.into(),
            kind: Kind::Constant,
            value,
            stored_value: None,
            ln_density: 0.0,
            stored_ln_density: None,
            parents: Vec::new(),
            children: Vec::new(),
            dirty: false,
            touched: false,
            generation: 0,
        });
        id
    }

    /// Add a stochastic variable with an initial value and a density over
    /// `parents`. Its log density is evaluated immediately.
    pub fn add_stochastic(
        &mut self,
        name: impl Into<String>,
        value: Value,
        density: impl Density + 'static,
        parents: &[VariableId],
    ) -> Result<VariableId> {
        self.check_parents(parents)?;
        let id = self.add_constant(name, value);
        self.variables[id].kind = Kind::Stochastic(Box::new(density));
        self.link(id, parents);
        self.variables[id].dirty = true;
        self.refresh(id);
        Ok(id)
    }

    /// Add a deterministic variable computed by `function` from `parents`.
    pub fn add_deterministic(
        &mut self,
        name: impl Into<String>,
        function: impl Function + 'static,
        parents: &[VariableId],
    ) -> Result<VariableId> {
        self.check_parents(parents)?;
        let value = {
            let args: Vec<&Value> = parents.iter().map(|&p| &self.variables[p].value).collect();
            function.evaluate(&args)
        };
        let id = self.add_constant(name, value);
        self.variables[id].kind = Kind::Deterministic(Box::new(function));
        self.link(id, parents);
        Ok(id)
    }

    fn check_parents(&self, parents: &[VariableId]) -> Result<()> {
        match parents.iter().find(|&&p| p >= self.variables.len()) {
            Some(p) => Err(CyaneaError::InvalidInput(format!(
                "parent variable {p} does not exist"
            ))),
            None => Ok(()),
        }
    }

    fn link(&mut self, id: VariableId, parents: &[VariableId]) {
        self.variables[id].parents = parents.to_vec();
        for &p in parents {
            if !self.variables[p].children.contains(&id) {
                self.variables[p].children.push(id);
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self, id: VariableId) -> &str {
        &self.variables[id].name
    }

    /// Look a variable up by name.
    pub fn find(&self, name: &str) -> Option<VariableId> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub fn parents(&self, id: VariableId) -> &[VariableId] {
        &self.variables[id].parents
    }

    pub fn children(&self, id: VariableId) -> &[VariableId] {
        &self.variables[id].children
    }

    pub fn kind(&self, id: VariableId) -> &Kind {
        &self.variables[id].kind
    }

    pub fn is_stochastic(&self, id: VariableId) -> bool {
        matches!(self.variables[id].kind, Kind::Stochastic(_))
    }

    pub fn is_dirty(&self, id: VariableId) -> bool {
        self.variables[id].dirty
    }

    pub fn is_touched(&self, id: VariableId) -> bool {
        self.variables[id].touched
    }

    /// Clock value at the variable's last touch (0 if never touched).
    pub fn generation(&self, id: VariableId) -> u64 {
        self.variables[id].generation
    }

    /// Current value, recomputing a dirty deterministic variable first.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a variable of this graph.
    pub fn value(&mut self, id: VariableId) -> &Value {
        self.refresh(id);
        &self.variables[id].value
    }

    /// Cached value without recomputation; may be stale for a dirty
    /// deterministic variable.
    pub fn peek(&self, id: VariableId) -> &Value {
        &self.variables[id].value
    }

    pub fn real(&mut self, id: VariableId) -> Result<f64> {
        self.value(id).as_real()
    }

    /// Assign a new value to a stochastic variable and touch it.
    pub fn set_value(&mut self, id: VariableId, value: Value) -> Result<()> {
        let var = &mut self.variables[id];
        if !matches!(var.kind, Kind::Stochastic(_)) {
            return Err(CyaneaError::InvalidInput(format!(
                "cannot assign to {} variable '{}'",
                var.kind.label(),
                var.name
            )));
        }
        if !var.value.same_type(&value) {
            return Err(CyaneaError::TypeMismatch {
                expected: var.value.type_name(),
                found: value.type_name(),
            });
        }
        let old = std::mem::replace(&mut var.value, value);
        if var.stored_value.is_none() {
            var.stored_value = Some(old);
        }
        self.touch(id);
        Ok(())
    }

    /// The admixture network held by a variable.
    pub fn network(&self, id: VariableId) -> Result<&AdmixtureNetwork> {
        self.variables[id].value.as_network()
    }

    /// Mutable access to a network variable. The caller is responsible for
    /// touching the variable after editing it.
    pub fn network_mut(&mut self, id: VariableId) -> Result<&mut AdmixtureNetwork> {
        self.variables[id].value.as_network_mut()
    }

    // ── Touch / restore / keep ──────────────────────────────────────────

    /// Mark `id` and everything downstream of it dirty.
    pub fn touch(&mut self, id: VariableId) {
        self.clock += 1;
        let mut affected = BTreeSet::new();
        self.affected_nodes(id, &mut affected);
        self.touch_one(id);
        for a in affected {
            self.touch_one(a);
        }
    }

    fn touch_one(&mut self, id: VariableId) {
        let clock = self.clock;
        let var = &mut self.variables[id];
        match var.kind {
            Kind::Stochastic(_) => {
                if var.stored_ln_density.is_none() {
                    var.stored_ln_density = Some(var.ln_density);
                }
            }
            Kind::Deterministic(_) => {
                if var.stored_value.is_none() && !var.dirty {
                    var.stored_value = Some(var.value.clone());
                }
            }
            Kind::Constant => {}
        }
        var.dirty = true;
        var.touched = true;
        var.generation = clock;
    }

    /// Insert every variable reachable from `id` through child edges into
    /// `affected` (excluding `id` itself unless it lies on a cycle, which
    /// construction rules out).
    pub fn affected_nodes(&self, id: VariableId, affected: &mut BTreeSet<VariableId>) {
        let mut stack: Vec<VariableId> = self.variables[id].children.clone();
        while let Some(c) = stack.pop() {
            if affected.insert(c) {
                stack.extend_from_slice(&self.variables[c].children);
            }
        }
    }

    /// Log density of a stochastic variable (0 for the other kinds).
    pub fn ln_probability(&mut self, id: VariableId) -> f64 {
        self.refresh(id);
        match self.variables[id].kind {
            Kind::Stochastic(_) => self.variables[id].ln_density,
            _ => 0.0,
        }
    }

    /// New minus stored log density of a touched stochastic variable.
    pub fn ln_probability_ratio(&mut self, id: VariableId) -> f64 {
        let Some(stored) = self.variables[id].stored_ln_density else {
            return 0.0;
        };
        let current = self.ln_probability(id);
        if current == stored {
            0.0
        } else {
            current - stored
        }
    }

    /// Sum of log densities over all stochastic variables.
    pub fn total_ln_probability(&mut self) -> f64 {
        let ids: Vec<VariableId> = (0..self.variables.len())
            .filter(|&id| self.is_stochastic(id))
            .collect();
        ids.into_iter().map(|id| self.ln_probability(id)).sum()
    }

    /// Reset `id` and its affected set to the state before the first touch.
    pub fn restore(&mut self, id: VariableId) {
        let mut affected = BTreeSet::new();
        self.affected_nodes(id, &mut affected);
        self.restore_one(id);
        for a in affected {
            self.restore_one(a);
        }
    }

    fn restore_one(&mut self, id: VariableId) {
        let var = &mut self.variables[id];
        if !var.touched {
            return;
        }
        let had_value = match var.stored_value.take() {
            Some(v) => {
                var.value = v;
                true
            }
            None => false,
        };
        match var.kind {
            Kind::Stochastic(_) => {
                if let Some(ln) = var.stored_ln_density.take() {
                    var.ln_density = ln;
                }
                var.dirty = false;
            }
            // Without a snapshot the old value was never computed; recompute
            // on the next read.
            Kind::Deterministic(_) => var.dirty = !had_value,
            Kind::Constant => var.dirty = false,
        }
        var.touched = false;
    }

    /// Commit the current state of `id` and its affected set.
    pub fn keep(&mut self, id: VariableId) {
        let mut affected = BTreeSet::new();
        self.affected_nodes(id, &mut affected);
        self.keep_one(id);
        for a in affected {
            self.keep_one(a);
        }
    }

    fn keep_one(&mut self, id: VariableId) {
        if !self.variables[id].touched {
            return;
        }
        if self.is_stochastic(id) {
            self.refresh(id);
        }
        let var = &mut self.variables[id];
        var.stored_value = None;
        var.stored_ln_density = None;
        var.touched = false;
    }

    /// Recompute a dirty variable after refreshing its parents.
    fn refresh(&mut self, id: VariableId) {
        if !self.variables[id].dirty {
            return;
        }
        let parents = self.variables[id].parents.clone();
        for &p in &parents {
            self.refresh(p);
        }
        let args: Vec<&Value> = parents.iter().map(|&p| &self.variables[p].value).collect();
        let var = &self.variables[id];
        let (value, ln) = match &var.kind {
            Kind::Constant => (None, None),
            Kind::Stochastic(d) => (None, Some(d.ln_density(&var.value, &args))),
            Kind::Deterministic(f) => (Some(f.evaluate(&args)), None),
        };
        let var = &mut self.variables[id];
        if let Some(v) = value {
            var.value = v;
        }
        if let Some(ln) = ln {
            var.ln_density = ln;
        }
        var.dirty = false;
    }

    // ── Replacement ─────────────────────────────────────────────────────

    /// Swap the definition of `id` for a new one of the same kind and value
    /// type. Handles held elsewhere stay valid; the variable and everything
    /// downstream are re-evaluated and any pending touch state is dropped.
    pub fn replace(&mut self, id: VariableId, replacement: Replacement) -> Result<()> {
        if id >= self.variables.len() {
            return Err(CyaneaError::InvalidInput(format!("variable {id} does not exist")));
        }
        let expected = self.variables[id].kind.label();
        let found = match &replacement {
            Replacement::Constant(_) => "constant",
            Replacement::Stochastic { .. } => "stochastic",
            Replacement::Deterministic { .. } => "deterministic",
        };
        if expected != found {
            return Err(CyaneaError::InvalidInput(format!(
                "cannot replace {expected} variable '{}' with a {found} one",
                self.variables[id].name
            )));
        }
        let parents: &[VariableId] = match &replacement {
            Replacement::Constant(_) => &[],
            Replacement::Stochastic { parents, .. } => parents,
            Replacement::Deterministic { parents, .. } => parents,
        };
        self.check_parents(parents)?;
        let mut downstream = BTreeSet::new();
        self.affected_nodes(id, &mut downstream);
        if parents.iter().any(|p| *p == id || downstream.contains(p)) {
            return Err(CyaneaError::InvalidInput(format!(
                "replacement of '{}' would create a cycle",
                self.variables[id].name
            )));
        }
        let parents = parents.to_vec();

        let new_value = match &replacement {
            Replacement::Constant(v) | Replacement::Stochastic { value: v, .. } => Some(v),
            Replacement::Deterministic { .. } => None,
        };
        if let Some(v) = new_value {
            if !v.same_type(&self.variables[id].value) {
                return Err(CyaneaError::TypeMismatch {
                    expected: self.variables[id].value.type_name(),
                    found: v.type_name(),
                });
            }
        }

        for &p in &self.variables[id].parents.clone() {
            self.variables[p].children.retain(|&c| c != id);
        }
        let var = &mut self.variables[id];
        match replacement {
            Replacement::Constant(value) => var.value = value,
            Replacement::Stochastic { value, density, .. } => {
                var.value = value;
                var.kind = Kind::Stochastic(density);
            }
            Replacement::Deterministic { function, .. } => var.kind = Kind::Deterministic(function),
        }
        self.link(id, &parents);

        for v in std::iter::once(id).chain(downstream) {
            let var = &mut self.variables[v];
            var.stored_value = None;
            var.stored_ln_density = None;
            var.touched = false;
            var.dirty = !matches!(var.kind, Kind::Constant);
        }
        self.refresh_all();
        Ok(())
    }

    fn refresh_all(&mut self) {
        for id in 0..self.variables.len() {
            self.refresh(id);
        }
    }
}

impl Summarizable for ModelGraph {
    fn summary(&self) -> String {
        let count = |label: &str| {
            self.variables
                .iter()
                .filter(|v| v.kind.label() == label)
                .count()
        };
        format!(
            "ModelGraph: {} variables ({} stochastic, {} deterministic, {} constant)",
            self.variables.len(),
            count("stochastic"),
            count("deterministic"),
            count("constant"),
        )
    }
}

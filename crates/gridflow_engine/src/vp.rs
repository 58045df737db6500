//! Virtual-point engine.
//!
//! Derived points are kept in an arena (`Vec` of nodes, integer indices);
//! edges between virtual points are rebuilt on every registration change and
//! cycles are rejected there, so evaluation can walk a precomputed
//! dependency-first order without re-checking. Batch evaluation overlays the
//! batch's values on the current-value store, so a VP feeding another VP
//! resolves within a single pass.

use crate::current::CurrentValueStore;
use crate::error::{EngineError, Result};
use crate::metrics::METRICS;
use chrono::{DateTime, Utc};
use gridflow_script::CompiledScript;
use gridflow_protocol::{
    BadReason, InputBinding, PointRef, Quality, TimestampedValue, TriggerMode, Value,
    VirtualPoint, VirtualPointId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

#[derive(Default)]
struct VpState {
    cached: Option<(Value, DateTime<Utc>)>,
    last_error: Option<String>,
    execution_count: u64,
    error_count: u64,
}

struct Node {
    vp: VirtualPoint,
    script: CompiledScript,
    state: Mutex<VpState>,
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Node>,
    by_id: HashMap<VirtualPointId, usize>,
    /// input point -> indices of nodes reading it.
    dependents: HashMap<PointRef, Vec<usize>>,
    /// Node indices in dependency-first order.
    order: Vec<usize>,
}

impl Graph {
    /// Rebuild index maps and the evaluation order. Returns the pair
    /// `(vp, via)` of a cycle if one exists.
    fn rebuild(&mut self) -> Option<(VirtualPointId, VirtualPointId)> {
        self.by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.vp.id, i))
            .collect();

        self.dependents.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in node.vp.dependencies() {
                self.dependents.entry(dep).or_default().push(i);
            }
        }

        // Kahn over vp -> vp edges only.
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in node.vp.dependencies() {
                if let PointRef::VirtualPoint(dep_id) = dep {
                    if let Some(&j) = self.by_id.get(&dep_id) {
                        edges[j].push(i);
                        in_degree[i] += 1;
                    }
                }
            }
        }

        let mut ready: VecDeque<usize> =
            (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &j in &edges[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push_back(j);
                }
            }
        }

        if order.len() < n {
            // Something is cyclic; name two participants for the error.
            let mut cyclic = (0..n).filter(|&i| in_degree[i] > 0);
            let first = cyclic.next().map(|i| self.nodes[i].vp.id);
            let second = cyclic.next().map(|i| self.nodes[i].vp.id).or(first);
            return first.zip(second);
        }
        self.order = order;
        None
    }
}

#[derive(Default)]
pub struct VirtualPointEngine {
    graph: RwLock<Graph>,
}

/// Execution statistics for one virtual point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VpStats {
    pub id: VirtualPointId,
    pub name: String,
    pub execution_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl VirtualPointEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a virtual point. Rejects unparsable formulas,
    /// formulas referencing unbound variables, and dependency cycles.
    pub fn register(&self, vp: VirtualPoint) -> Result<()> {
        let script = CompiledScript::compile(&vp.formula).map_err(|e| {
            EngineError::InvalidVirtualPoint { vp: vp.id, reason: e.to_string() }
        })?;
        for var in script.variables() {
            if !vp.inputs.iter().any(|input| &input.name == var) {
                return Err(EngineError::InvalidVirtualPoint {
                    vp: vp.id,
                    reason: format!("formula variable '{var}' has no input binding"),
                });
            }
        }

        let mut graph = self.graph.write();
        let replaced = graph.by_id.get(&vp.id).copied();
        let node = Node { vp, script, state: Mutex::new(VpState::default()) };
        let (index, previous) = match replaced {
            Some(i) => {
                let old = std::mem::replace(&mut graph.nodes[i], node);
                (i, Some(old))
            }
            None => {
                graph.nodes.push(node);
                (graph.nodes.len() - 1, None)
            }
        };

        if let Some((vp_id, via)) = graph.rebuild() {
            // Roll back so the graph stays acyclic.
            match previous {
                Some(old) => graph.nodes[index] = old,
                None => {
                    graph.nodes.pop();
                }
            }
            graph.rebuild();
            return Err(EngineError::DependencyCycle { vp: vp_id, via });
        }
        Ok(())
    }

    pub fn unregister(&self, id: VirtualPointId) {
        let mut graph = self.graph.write();
        if let Some(index) = graph.by_id.get(&id).copied() {
            graph.nodes.swap_remove(index);
            graph.rebuild();
        }
    }

    pub fn len(&self) -> usize {
        self.graph.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.read().nodes.is_empty()
    }

    pub fn stats(&self) -> Vec<VpStats> {
        let graph = self.graph.read();
        graph
            .nodes
            .iter()
            .map(|node| {
                let state = node.state.lock();
                VpStats {
                    id: node.vp.id,
                    name: node.vp.name.clone(),
                    execution_count: state.execution_count,
                    error_count: state.error_count,
                    last_error: state.last_error.clone(),
                }
            })
            .collect()
    }

    /// Compute every on-change virtual point whose dependency set intersects
    /// the batch, in dependency-first order. Values from the batch (and VPs
    /// computed earlier in the pass) take precedence over the store.
    pub fn compute_for_batch(
        &self,
        batch: &[TimestampedValue],
        current: &CurrentValueStore,
    ) -> Vec<TimestampedValue> {
        let graph = self.graph.read();
        if graph.nodes.is_empty() {
            return Vec::new();
        }

        // Batch overlay: last write per point wins.
        let mut overlay: HashMap<PointRef, Value> = HashMap::with_capacity(batch.len());
        for tv in batch {
            overlay.insert(tv.point, tv.value.clone());
        }

        // Transitive closure over dependents.
        let mut affected: HashSet<usize> = HashSet::new();
        let mut frontier: VecDeque<PointRef> = overlay.keys().copied().collect();
        while let Some(point) = frontier.pop_front() {
            if let Some(indices) = graph.dependents.get(&point) {
                for &i in indices {
                    if affected.insert(i) {
                        frontier.push_back(PointRef::VirtualPoint(graph.nodes[i].vp.id));
                    }
                }
            }
        }
        if affected.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(affected.len());
        for &i in &graph.order {
            if !affected.contains(&i) {
                continue;
            }
            let node = &graph.nodes[i];
            if !node.vp.enabled || node.vp.trigger != TriggerMode::OnChange {
                continue;
            }
            if let Some(tv) = Self::evaluate_node(node, &overlay, current) {
                overlay.insert(tv.point, tv.value.clone());
                out.push(tv);
            }
        }
        out
    }

    /// Evaluate periodic virtual points whose cache has outlived its TTL.
    pub fn compute_periodic(&self, current: &CurrentValueStore) -> Vec<TimestampedValue> {
        let graph = self.graph.read();
        let overlay = HashMap::new();
        let now = Utc::now();
        let mut out = Vec::new();
        for &i in &graph.order {
            let node = &graph.nodes[i];
            if !node.vp.enabled || node.vp.trigger != TriggerMode::Periodic {
                continue;
            }
            let fresh = {
                let state = node.state.lock();
                state.cached.as_ref().is_some_and(|(_, at)| {
                    (now - *at).num_milliseconds() < node.vp.cache_ttl_ms as i64
                })
            };
            if fresh {
                METRICS.vp_cache_hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(tv) = Self::evaluate_node(node, &overlay, current) {
                out.push(tv);
            }
        }
        out
    }

    /// Evaluate one virtual point on demand (manual trigger), bypassing the
    /// TTL cache.
    pub fn compute_manual(
        &self,
        id: VirtualPointId,
        current: &CurrentValueStore,
    ) -> Result<TimestampedValue> {
        let graph = self.graph.read();
        let &index = graph
            .by_id
            .get(&id)
            .ok_or(EngineError::InvalidVirtualPoint { vp: id, reason: "not registered".into() })?;
        let node = &graph.nodes[index];
        Self::evaluate_node(node, &HashMap::new(), current).ok_or_else(|| {
            EngineError::InvalidVirtualPoint {
                vp: id,
                reason: node
                    .state
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "inputs unavailable".into()),
            }
        })
    }

    fn evaluate_node(
        node: &Node,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
    ) -> Option<TimestampedValue> {
        let vp = &node.vp;
        let mut bindings: Vec<(&str, Value)> = Vec::with_capacity(vp.inputs.len());
        for input in &vp.inputs {
            let value = match &input.binding {
                InputBinding::Constant { value } => Some(value.clone()),
                InputBinding::DataPoint { id } => {
                    let point = PointRef::DataPoint(*id);
                    overlay.get(&point).cloned().or_else(|| current.value(vp.tenant_id, point))
                }
                InputBinding::VirtualPoint { id } => {
                    let point = PointRef::VirtualPoint(*id);
                    overlay.get(&point).cloned().or_else(|| current.value(vp.tenant_id, point))
                }
            };
            match value {
                Some(v) => bindings.push((input.name.as_str(), v)),
                None => {
                    // Input never seen: nothing meaningful to compute yet.
                    debug!("vp {} waiting for input '{}'", vp.id, input.name);
                    return None;
                }
            }
        }

        METRICS.vp_evaluations.fetch_add(1, Ordering::Relaxed);
        let mut state = node.state.lock();
        state.execution_count += 1;
        match node.script.eval_value(&bindings, vp.value_type) {
            Ok(value) => {
                let now = Utc::now();
                state.cached = Some((value.clone(), now));
                state.last_error = None;
                Some(TimestampedValue::new(
                    PointRef::VirtualPoint(vp.id),
                    vp.tenant_id,
                    value,
                    Quality::Good,
                ))
            }
            Err(e) => {
                METRICS.vp_errors.fetch_add(1, Ordering::Relaxed);
                warn!("vp {} formula failed: {e}", vp.id);
                state.error_count += 1;
                state.last_error = Some(e.to_string());
                let fallback = state
                    .cached
                    .take()
                    .map(|(value, _)| value)
                    .unwrap_or(Value::Int(0));
                Some(TimestampedValue::new(
                    PointRef::VirtualPoint(vp.id),
                    vp.tenant_id,
                    fallback,
                    Quality::Bad(BadReason::ScriptError),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_protocol::{PointId, TenantId, ValueType, VirtualInput, VirtualScope};

    fn vp(id: i64, formula: &str, inputs: Vec<VirtualInput>) -> VirtualPoint {
        VirtualPoint {
            id: VirtualPointId::new(id),
            tenant_id: TenantId::new(1),
            scope: VirtualScope::Global,
            name: format!("vp{id}"),
            formula: formula.into(),
            value_type: ValueType::Float,
            unit: None,
            inputs,
            trigger: TriggerMode::OnChange,
            cache_ttl_ms: 5_000,
            enabled: true,
        }
    }

    fn dp_input(name: &str, id: i64) -> VirtualInput {
        VirtualInput { name: name.into(), binding: InputBinding::DataPoint { id: PointId::new(id) } }
    }

    fn vp_input(name: &str, id: i64) -> VirtualInput {
        VirtualInput {
            name: name.into(),
            binding: InputBinding::VirtualPoint { id: VirtualPointId::new(id) },
        }
    }

    fn reading(point: i64, value: f64) -> TimestampedValue {
        TimestampedValue::new(
            PointRef::DataPoint(PointId::new(point)),
            TenantId::new(1),
            Value::Float(value),
            Quality::Good,
        )
    }

    #[test]
    fn sum_of_two_points() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "a + b", vec![dp_input("a", 1), dp_input("b", 2)]))
            .unwrap();
        let current = CurrentValueStore::new();
        let out = engine.compute_for_batch(&[reading(1, 60.0), reading(2, 45.0)], &current);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].point, PointRef::VirtualPoint(VirtualPointId::new(10)));
        assert_eq!(out[0].value, Value::Float(105.0));
        assert_eq!(out[0].quality, Quality::Good);
    }

    #[test]
    fn missing_input_read_from_current_store() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "a + b", vec![dp_input("a", 1), dp_input("b", 2)]))
            .unwrap();
        let current = CurrentValueStore::new();
        current.apply(&reading(2, 40.0));
        let out = engine.compute_for_batch(&[reading(1, 2.5)], &current);
        assert_eq!(out[0].value, Value::Float(42.5));
    }

    #[test]
    fn input_never_seen_skips_emission() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "a + b", vec![dp_input("a", 1), dp_input("b", 2)]))
            .unwrap();
        let current = CurrentValueStore::new();
        let out = engine.compute_for_batch(&[reading(1, 2.5)], &current);
        assert!(out.is_empty());
    }

    #[test]
    fn cascading_vp_resolves_in_one_pass() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "a * 2", vec![dp_input("a", 1)]))
            .unwrap();
        engine
            .register(vp(11, "x + 1", vec![vp_input("x", 10)]))
            .unwrap();
        let current = CurrentValueStore::new();
        let out = engine.compute_for_batch(&[reading(1, 5.0)], &current);
        assert_eq!(out.len(), 2);
        // Dependency-first order: vp10 before vp11.
        assert_eq!(out[0].value, Value::Float(10.0));
        assert_eq!(out[1].value, Value::Float(11.0));
    }

    #[test]
    fn cycles_rejected_at_registration() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "x + 1", vec![vp_input("x", 11)]))
            .unwrap();
        let err = engine
            .register(vp(11, "y + 1", vec![vp_input("y", 10)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
        // Graph stays usable with only the first point.
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn self_cycle_rejected() {
        let engine = VirtualPointEngine::new();
        let err = engine
            .register(vp(10, "x + 1", vec![vp_input("x", 10)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
        assert!(engine.is_empty());
    }

    #[test]
    fn unbound_formula_variable_rejected() {
        let engine = VirtualPointEngine::new();
        let err = engine.register(vp(10, "a + b", vec![dp_input("a", 1)])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidVirtualPoint { .. }));
    }

    #[test]
    fn script_error_emits_bad_quality_and_records() {
        let engine = VirtualPointEngine::new();
        // String minus number fails at evaluation time.
        engine
            .register(vp(10, "a - 1", vec![dp_input("a", 1)]))
            .unwrap();
        let current = CurrentValueStore::new();
        let bad = TimestampedValue::new(
            PointRef::DataPoint(PointId::new(1)),
            TenantId::new(1),
            Value::Text("not-a-number".into()),
            Quality::Good,
        );
        let out = engine.compute_for_batch(&[bad], &current);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quality, Quality::Bad(BadReason::ScriptError));
        let stats = engine.stats();
        assert_eq!(stats[0].error_count, 1);
        assert!(stats[0].last_error.is_some());
    }

    #[test]
    fn same_snapshot_is_deterministic() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(10, "a * b", vec![dp_input("a", 1), dp_input("b", 2)]))
            .unwrap();
        let current = CurrentValueStore::new();
        let batch = [reading(1, 3.0), reading(2, 4.0)];
        let first = engine.compute_for_batch(&batch, &current);
        let second = engine.compute_for_batch(&batch, &current);
        assert_eq!(first[0].value, second[0].value);
    }

    #[test]
    fn periodic_points_respect_the_ttl_cache() {
        let engine = VirtualPointEngine::new();
        let mut periodic = vp(10, "a * 2", vec![dp_input("a", 1)]);
        periodic.trigger = TriggerMode::Periodic;
        periodic.cache_ttl_ms = 60_000;
        engine.register(periodic).unwrap();
        let current = CurrentValueStore::new();
        current.apply(&reading(1, 5.0));

        let first = engine.compute_periodic(&current);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, Value::Float(10.0));
        // Within the TTL the cache short-circuits.
        let second = engine.compute_periodic(&current);
        assert!(second.is_empty());
        // Periodic points are driven by their timer, not by batch changes.
        assert!(engine.compute_for_batch(&[reading(1, 6.0)], &current).is_empty());
    }

    #[test]
    fn manual_points_compute_on_demand_only() {
        let engine = VirtualPointEngine::new();
        let mut manual = vp(10, "a + 1", vec![dp_input("a", 1)]);
        manual.trigger = TriggerMode::Manual;
        engine.register(manual).unwrap();
        let current = CurrentValueStore::new();
        current.apply(&reading(1, 9.0));

        // Neither the batch path nor the periodic path touches it.
        assert!(engine.compute_for_batch(&[reading(1, 9.0)], &current).is_empty());
        assert!(engine.compute_periodic(&current).is_empty());

        let tv = engine.compute_manual(VirtualPointId::new(10), &current).unwrap();
        assert_eq!(tv.value, Value::Float(10.0));
        assert!(engine
            .compute_manual(VirtualPointId::new(99), &current)
            .is_err());
    }

    #[test]
    fn constants_bind_without_store() {
        let engine = VirtualPointEngine::new();
        engine
            .register(vp(
                10,
                "a * k",
                vec![
                    dp_input("a", 1),
                    VirtualInput {
                        name: "k".into(),
                        binding: InputBinding::Constant { value: Value::Float(1.5) },
                    },
                ],
            ))
            .unwrap();
        let current = CurrentValueStore::new();
        let out = engine.compute_for_batch(&[reading(1, 10.0)], &current);
        assert_eq!(out[0].value, Value::Float(15.0));
    }
}

//! Shape-checked graphs bound to a parameter store.
//!
//! `CompiledGraph` snapshots the part of the context's graph reachable from
//! a set of outputs, runs shape inference once, and remembers which inputs, parameters and
//! state tensors the outputs depend on. Each `run` feeds those values,
//! executes the graph on a backend and writes state updates back to the
//! store.

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, DType, NodeId, NodeType, Shape, Value};
use crate::error::{GanError, Result};
use crate::params::ParameterStore;
use crate::runtime::backend::{Backend, Memo, RuntimeError};
use crate::tensor::{GraphContext, StateUpdate, Tensor};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, trace};

/// Graph leaf bound to a named value at run time.
#[derive(Debug, Clone)]
struct Binding {
    name: String,
    node_id: NodeId,
    shape: Shape,
}

#[derive(Debug, Clone)]
pub struct CompiledGraph {
    graph: Asg,
    num_outputs: usize,
    state_updates: Vec<StateUpdate>,
    inputs: Vec<Binding>,
    parameters: Vec<Binding>,
    states: Vec<Binding>,
}

impl CompiledGraph {
    /// Compiles the part of the context's graph reachable from `outputs`
    /// and from the nodes of `state_updates`.
    ///
    /// `input_shapes` must list every input the outputs depend on.
    /// Parameter and state shapes come from the registry.
    pub fn compile(
        context: &Rc<RefCell<GraphContext>>,
        outputs: &[&Tensor],
        state_updates: Vec<StateUpdate>,
        input_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<Self> {
        let ctx = context.borrow();
        let mut graph = ctx.main_graph().clone();

        let mut output_ids: Vec<NodeId> = outputs.iter().map(|t| t.node_id).collect();
        output_ids.extend(state_updates.iter().map(|u| u.node_id));
        graph.set_outputs(output_ids);

        let reachable = ShapeInference::topological_sort(&graph)?;
        let keep: HashSet<NodeId> = reachable.iter().copied().collect();
        graph.nodes.retain(|id, _| keep.contains(id));
        graph.inputs.retain(|id| keep.contains(id));

        let mut initial_shapes = input_shapes.clone();
        for spec in ctx.registry().parameters() {
            initial_shapes.insert(spec.name.clone(), (spec.shape.clone(), DType::F32));
        }
        for spec in ctx.registry().states() {
            initial_shapes.insert(spec.name.clone(), (spec.shape.clone(), DType::F32));
        }

        ShapeInference::run(&mut graph, &initial_shapes)?;

        let (mut inputs, mut parameters, mut states) = (Vec::new(), Vec::new(), Vec::new());
        for node_id in &reachable {
            let node = graph.get_node(*node_id)?;
            let shape = node.shape.clone().unwrap_or_default();
            match &node.node_type {
                NodeType::Input { name } => inputs.push(Binding { name: name.clone(), node_id: *node_id, shape }),
                NodeType::Parameter { name } => {
                    parameters.push(Binding { name: name.clone(), node_id: *node_id, shape })
                }
                NodeType::State { name } => states.push(Binding { name: name.clone(), node_id: *node_id, shape }),
                _ => {}
            }
        }

        debug!(
            nodes = reachable.len(),
            inputs = inputs.len(),
            parameters = parameters.len(),
            states = states.len(),
            state_updates = state_updates.len(),
            "compiled graph"
        );

        Ok(Self { graph, num_outputs: outputs.len(), state_updates, inputs, parameters, states })
    }

    /// Inferred shape of any node in the compiled graph.
    pub fn shape_of(&self, tensor: &Tensor) -> Option<&Shape> {
        self.graph.nodes.get(&tensor.node_id).and_then(|n| n.shape.as_ref())
    }

    /// Inferred shapes of the requested outputs, in order.
    pub fn output_shapes(&self) -> Vec<Shape> {
        self.graph.outputs[..self.num_outputs]
            .iter()
            .map(|id| self.graph.nodes.get(id).and_then(|n| n.shape.clone()).unwrap_or_default())
            .collect()
    }

    /// Names of the inputs that must be fed.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|b| b.name.as_str()).collect()
    }

    /// Executes the graph.
    ///
    /// Returns the requested outputs. State updates are written to `store`
    /// only when the whole run succeeded.
    pub fn run<B>(
        &self,
        backend: &B,
        feeds: &HashMap<String, ArrayD<f32>>,
        store: &mut ParameterStore,
    ) -> Result<Vec<ArrayD<f32>>>
    where
        B: Backend<DeviceData = Value>,
    {
        let mut named: HashMap<String, Value> = HashMap::new();
        for binding in &self.inputs {
            let value = feeds.get(&binding.name).ok_or_else(|| {
                RuntimeError::MissingInput(binding.name.clone(), binding.node_id)
            })?;
            check_shape(&binding.name, &binding.shape, value)?;
            named.insert(binding.name.clone(), Value::Tensor(value.clone()));
        }
        for binding in &self.parameters {
            let value = store.parameter(&binding.name).ok_or_else(|| GanError::MissingValue(binding.name.clone()))?;
            check_shape(&binding.name, &binding.shape, value)?;
            named.insert(binding.name.clone(), Value::Tensor(value.clone()));
        }
        for binding in &self.states {
            let value = store.state(&binding.name).ok_or_else(|| GanError::MissingValue(binding.name.clone()))?;
            check_shape(&binding.name, &binding.shape, value)?;
            named.insert(binding.name.clone(), Value::Tensor(value.clone()));
        }

        let device_data = backend.load_data(&named)?;
        let mut memo: Memo<Value> = HashMap::new();
        for binding in self.inputs.iter().chain(&self.parameters).chain(&self.states) {
            if let Some(value) = device_data.get(&binding.name) {
                memo.insert((self.graph.id, binding.node_id), value.clone());
            }
        }

        debug!(outputs = self.graph.outputs.len(), "running graph");
        let (results, _) = backend.run(&self.graph, memo)?;
        let mut values = backend.retrieve_data(&results)?.into_iter().map(Value::into_tensor);

        let outputs: Vec<ArrayD<f32>> = values.by_ref().take(self.num_outputs).collect();
        for (update, value) in self.state_updates.iter().zip(values) {
            trace!(state = %update.name, "writing back state");
            store.set_state(&update.name, value);
        }

        Ok(outputs)
    }
}

fn check_shape(name: &str, expected: &Shape, value: &ArrayD<f32>) -> Result<()> {
    if value.shape() != expected.as_slice() {
        return Err(GanError::InputShape {
            name: name.to_string(),
            expected: expected.clone(),
            actual: value.shape().to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamKind, StateInit};
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::nn::{Embedding, Mode, Module};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_run_binds_parameters_and_writes_state() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", vec![2, 2], ParamKind::LinearWeight);
        let acc = Tensor::new_state(&ctx, "acc", vec![1, 2], StateInit::Zeros);
        let y = x.dot(&w);
        let next = &acc + &y.sum_axes(&[0], true);
        ctx.borrow_mut().record_state_update("acc", next.node_id);
        let updates = ctx.borrow_mut().drain_state_updates();

        let shapes = HashMap::from([("x".to_string(), (vec![1, 2], DType::F32))]);
        let compiled = CompiledGraph::compile(&ctx, &[&y], updates, &shapes).unwrap();
        assert_eq!(compiled.output_shapes(), vec![vec![1, 2]]);
        assert_eq!(compiled.input_names(), vec!["x"]);

        let mut store = ParameterStore::new();
        store.set_parameter("w", array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        store.set_state("acc", array![[0.0, 0.0]].into_dyn());
        let feeds = HashMap::from([("x".to_string(), array![[1.0, 1.0]].into_dyn())]);

        let backend = CpuBackend::new();
        let out = compiled.run(&backend, &feeds, &mut store).unwrap();
        assert_eq!(out[0], array![[4.0, 6.0]].into_dyn());
        compiled.run(&backend, &feeds, &mut store).unwrap();
        assert_eq!(store.state("acc").unwrap(), &array![[8.0, 12.0]].into_dyn());
    }

    #[test]
    fn test_shape_mismatch_fails_compile() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", vec![3, 2], ParamKind::LinearWeight);
        let y = x.dot(&w);

        let shapes = HashMap::from([("x".to_string(), (vec![1, 2], DType::F32))]);
        let err = CompiledGraph::compile(&ctx, &[&y], vec![], &shapes).unwrap_err();
        assert!(matches!(err, GanError::Shape(_)));
    }

    #[test]
    fn test_wrong_feed_shape_and_missing_parameter() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", vec![2, 2], ParamKind::LinearWeight);
        let y = x.dot(&w);
        let shapes = HashMap::from([("x".to_string(), (vec![1, 2], DType::F32))]);
        let compiled = CompiledGraph::compile(&ctx, &[&y], vec![], &shapes).unwrap();
        let backend = CpuBackend::new();

        let mut store = ParameterStore::new();
        let feeds = HashMap::from([("x".to_string(), array![[1.0, 1.0]].into_dyn())]);
        assert!(matches!(
            compiled.run(&backend, &feeds, &mut store),
            Err(GanError::MissingValue(name)) if name == "w"
        ));

        store.set_parameter("w", ArrayD::zeros(vec![2, 2]));
        let bad = HashMap::from([("x".to_string(), ArrayD::zeros(vec![2, 2]))]);
        assert!(matches!(compiled.run(&backend, &bad, &mut store), Err(GanError::InputShape { .. })));
    }

    #[test]
    fn test_compiled_graph_keeps_only_reachable_nodes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let unused = Tensor::new_input(&ctx, "unused").relu().tanh();
        let y = x.relu();

        let shapes = HashMap::from([("x".to_string(), (vec![2], DType::F32))]);
        let compiled = CompiledGraph::compile(&ctx, &[&y], vec![], &shapes).unwrap();
        assert_eq!(compiled.graph.nodes.len(), 2);
        assert!(compiled.shape_of(&unused).is_none());
        assert_eq!(compiled.shape_of(&y), Some(&vec![2]));
        assert!(ctx.borrow().main_graph().nodes.len() > 2);
    }

    #[test]
    fn test_failed_train_run_leaves_state_untouched() {
        let ctx = GraphContext::shared();
        let embedding = Embedding::spectral(&ctx, "emb", 3, 4, 1e-12);
        let labels = Tensor::new_input(&ctx, "labels");
        let out = embedding.forward(&labels, Mode::Train);
        let updates = ctx.borrow_mut().drain_state_updates();
        assert_eq!(updates.len(), 1);

        let shapes = HashMap::from([("labels".to_string(), (vec![2], DType::I32))]);
        let compiled = CompiledGraph::compile(&ctx, &[&out], updates, &shapes).unwrap();
        let mut store = crate::init::initialize(ctx.borrow().registry(), &mut StdRng::seed_from_u64(4));
        let before = store.state("emb.weight.u").unwrap().clone();

        let backend = CpuBackend::new();
        let feeds = HashMap::from([("labels".to_string(), array![0.0, 7.0].into_dyn())]);
        let err = compiled.run(&backend, &feeds, &mut store).unwrap_err();
        assert!(matches!(err, GanError::Runtime(RuntimeError::IndexOutOfRange { index: 7, .. })));
        assert_eq!(store.state("emb.weight.u").unwrap(), &before);

        let feeds = HashMap::from([("labels".to_string(), array![0.0, 2.0].into_dyn())]);
        compiled.run(&backend, &feeds, &mut store).unwrap();
        assert_ne!(store.state("emb.weight.u").unwrap(), &before);
    }
}

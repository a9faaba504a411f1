//! `BigGan`: both networks, their parameters and a CPU backend.
//!
//! Forward calls take and return concrete arrays. Each distinct
//! (operation, mode, batch size) combination is built and shape-checked
//! once, then reused.

use crate::asg::{DType, Shape};
use crate::config::BigGanConfig;
use crate::error::{GanError, Result};
use crate::gan::discriminator::Discriminator;
use crate::gan::generator::Generator;
use crate::init;
use crate::nn::Mode;
use crate::params::ParameterStore;
use crate::regularization;
use crate::runtime::compiled::CompiledGraph;
use crate::runtime::cpu_backend::CpuBackend;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{Array1, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};

const LABELS: &str = "labels";
const NOISE: &str = "noise";
const CLASS_EMBEDDING: &str = "class_embedding";
const IMAGE: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Operation {
    Embed,
    Generate,
    Score { conditional: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GraphKey {
    operation: Operation,
    mode: Mode,
    batch: usize,
}

/// Output shapes of both networks for a batch size, found by shape
/// inference alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeReport {
    pub image: Shape,
    pub score: Shape,
    pub generator_parameters: usize,
    pub discriminator_parameters: usize,
}

/// Builds both networks in a scratch context and checks their graphs for
/// `batch` without allocating any parameter values.
pub fn infer_shapes(config: &BigGanConfig, batch: usize) -> Result<ShapeReport> {
    config.validate()?;
    let context = GraphContext::shared();
    let generator = Generator::new(&context, config);
    let discriminator = Discriminator::new(&context, config);

    let noise = Tensor::new_input(&context, NOISE);
    let labels = Tensor::new_input(&context, LABELS);
    let image = generator.generate(&noise, &generator.embed(&labels, Mode::Eval), Mode::Eval);
    let score = discriminator.score(&image, Some(&labels), Mode::Eval);

    let shapes = HashMap::from([
        (NOISE.to_string(), (vec![batch, config.z_dim], DType::F32)),
        (LABELS.to_string(), (vec![batch], DType::I32)),
    ]);
    let compiled = CompiledGraph::compile(&context, &[&image, &score], vec![], &shapes)?;
    let mut outputs = compiled.output_shapes().into_iter();

    let ctx = context.borrow();
    Ok(ShapeReport {
        image: outputs.next().unwrap_or_default(),
        score: outputs.next().unwrap_or_default(),
        generator_parameters: ctx.registry().num_elements("g."),
        discriminator_parameters: ctx.registry().num_elements("d."),
    })
}

pub struct BigGan {
    context: Rc<RefCell<GraphContext>>,
    config: BigGanConfig,
    generator: Generator,
    discriminator: Discriminator,
    store: ParameterStore,
    backend: CpuBackend,
    graphs: HashMap<GraphKey, CompiledGraph>,
}

impl BigGan {
    /// Builds both networks and initializes every parameter and state
    /// tensor from `seed`.
    pub fn new(config: BigGanConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let context = GraphContext::shared();
        let generator = Generator::new(&context, &config);
        let discriminator = Discriminator::new(&context, &config);
        let store = init::initialize(context.borrow().registry(), &mut StdRng::seed_from_u64(seed));

        {
            let ctx = context.borrow();
            info!(
                resolution = config.resolution(),
                stages = config.n_stages(),
                generator_parameters = ctx.registry().num_elements("g."),
                discriminator_parameters = ctx.registry().num_elements("d."),
                state_tensors = ctx.registry().states().len(),
                "built BigGAN"
            );
        }

        Ok(Self {
            context,
            config,
            generator,
            discriminator,
            store,
            backend: CpuBackend::new(),
            graphs: HashMap::new(),
        })
    }

    pub fn config(&self) -> &BigGanConfig {
        &self.config
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Parameter values for an external optimizer.
    pub fn store_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    /// Number of graphs built so far.
    pub fn cached_graphs(&self) -> usize {
        self.graphs.len()
    }

    /// Class embeddings `[B, shared_dim]` for `labels`.
    pub fn embed(&mut self, labels: &[usize]) -> Result<ArrayD<f32>> {
        let batch = self.check_labels(labels)?;
        let feeds = HashMap::from([(LABELS.to_string(), label_array(labels))]);
        self.execute(GraphKey { operation: Operation::Embed, mode: Mode::Eval, batch }, &feeds)
    }

    /// Images `[B, 3, R, R]` from noise `[B, z_dim]` and class embeddings
    /// `[B, shared_dim]`.
    pub fn generate(&mut self, noise: &ArrayD<f32>, class_embedding: &ArrayD<f32>, mode: Mode) -> Result<ArrayD<f32>> {
        let batch = batch_of(NOISE, noise, &[self.config.z_dim])?;
        let embedding_batch = batch_of(CLASS_EMBEDDING, class_embedding, &[self.config.shared_dim])?;
        if batch != embedding_batch {
            return Err(GanError::BatchMismatch(format!(
                "noise has {} rows, class embedding has {}",
                batch, embedding_batch
            )));
        }

        let feeds = HashMap::from([
            (NOISE.to_string(), noise.clone()),
            (CLASS_EMBEDDING.to_string(), class_embedding.clone()),
        ]);
        self.execute(GraphKey { operation: Operation::Generate, mode, batch }, &feeds)
    }

    /// Scores `[B, 1]` of images `[B, 3, R, R]`, projected onto `labels`
    /// when given.
    pub fn score(&mut self, image: &ArrayD<f32>, labels: Option<&[usize]>, mode: Mode) -> Result<ArrayD<f32>> {
        let resolution = self.config.resolution();
        let batch = batch_of(IMAGE, image, &[3, resolution, resolution])?;
        let mut feeds = HashMap::from([(IMAGE.to_string(), image.clone())]);

        if let Some(labels) = labels {
            if self.check_labels(labels)? != batch {
                return Err(GanError::BatchMismatch(format!(
                    "image has {} rows, labels have {}",
                    batch,
                    labels.len()
                )));
            }
            feeds.insert(LABELS.to_string(), label_array(labels));
        }

        let operation = Operation::Score { conditional: labels.is_some() };
        self.execute(GraphKey { operation, mode, batch }, &feeds)
    }

    /// Orthogonal regularization of the current weights, scaled by `ortho_beta`.
    pub fn orthogonal_penalty(&self) -> Result<f32> {
        regularization::orthogonal_penalty(self.context.borrow().registry(), &self.store, self.config.ortho_beta)
    }

    fn check_labels(&self, labels: &[usize]) -> Result<usize> {
        if labels.is_empty() {
            return Err(GanError::BatchMismatch("empty label batch".to_string()));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= self.config.n_classes) {
            return Err(GanError::LabelOutOfRange { label, num_classes: self.config.n_classes });
        }
        Ok(labels.len())
    }

    fn execute(&mut self, key: GraphKey, feeds: &HashMap<String, ArrayD<f32>>) -> Result<ArrayD<f32>> {
        if !self.graphs.contains_key(&key) {
            debug!(?key, "building graph");
            let graph = self.build(key)?;
            self.graphs.insert(key, graph);
        }
        let graph = &self.graphs[&key];
        let mut outputs = graph.run(&self.backend, feeds, &mut self.store)?;
        outputs.pop().ok_or_else(|| GanError::MissingValue(format!("{:?} output", key.operation)))
    }

    fn build(&self, key: GraphKey) -> Result<CompiledGraph> {
        let context = &self.context;
        let batch = key.batch;
        let resolution = self.config.resolution();
        let mut shapes: HashMap<String, (Shape, DType)> = HashMap::new();

        let output = match key.operation {
            Operation::Embed => {
                let labels = Tensor::new_input(context, LABELS);
                shapes.insert(LABELS.to_string(), (vec![batch], DType::I32));
                self.generator.embed(&labels, key.mode)
            }
            Operation::Generate => {
                let noise = Tensor::new_input(context, NOISE);
                let class_embedding = Tensor::new_input(context, CLASS_EMBEDDING);
                shapes.insert(NOISE.to_string(), (vec![batch, self.config.z_dim], DType::F32));
                shapes.insert(CLASS_EMBEDDING.to_string(), (vec![batch, self.config.shared_dim], DType::F32));
                self.generator.generate(&noise, &class_embedding, key.mode)
            }
            Operation::Score { conditional } => {
                let image = Tensor::new_input(context, IMAGE);
                shapes.insert(IMAGE.to_string(), (vec![batch, 3, resolution, resolution], DType::F32));
                let labels = conditional.then(|| {
                    shapes.insert(LABELS.to_string(), (vec![batch], DType::I32));
                    Tensor::new_input(context, LABELS)
                });
                self.discriminator.score(&image, labels.as_ref(), key.mode)
            }
        };

        let updates = context.borrow_mut().drain_state_updates();
        CompiledGraph::compile(context, &[&output], updates, &shapes)
    }
}

fn label_array(labels: &[usize]) -> ArrayD<f32> {
    Array1::from_iter(labels.iter().map(|&l| l as f32)).into_dyn()
}

/// Checks that `array` is `[B, *trailing]` and returns `B`.
fn batch_of(name: &str, array: &ArrayD<f32>, trailing: &[usize]) -> Result<usize> {
    let shape = array.shape();
    let batch = shape.first().copied().unwrap_or(0);
    if shape.len() != trailing.len() + 1 || &shape[1..] != trailing || batch == 0 {
        let mut expected = vec![batch.max(1)];
        expected.extend_from_slice(trailing);
        return Err(GanError::InputShape { name: name.to_string(), expected, actual: shape.to_vec() });
    }
    Ok(batch)
}

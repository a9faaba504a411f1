//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime.
//!
//! ## How It Works
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! Every contract between blocks (conditioning widths, residual sums,
//! attention reshapes) is checked here, so a misconfigured network fails
//! before any value is computed.
//!
//! ## Example
//!
//! ```ignore
//! use rustygan::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! graph.set_output(image.node_id);
//!
//! let shapes = HashMap::from([
//!     ("noise".to_string(), (vec![4, 120], DType::F32)),
//! ]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;

use std::mem;

use itertools::Itertools;

use super::{Binding, BlobRef, GraphError, graph::Topology};
use crate::{
    layers::{Layer, LayerError},
    loom::{layout::Shape, tensor::Tensor},
};

/// A validated graph, ready to run.
///
/// Holds exactly one blob per layer output. Outputs are allocated on the first run and
/// again whenever the input shape changes; later runs write into the same tensors.
#[derive(Debug)]
pub struct Net {
    input_name: String,
    layers: Vec<Box<dyn Layer>>,
    topology: Topology,
    input: Option<Tensor>,
    blobs: Vec<Vec<Tensor>>,
    /// Input shape the layers are allocated for.
    allocated: Option<Shape>,
    computed: bool,
}

impl Net {
    /// Validates the layers and bindings into a runnable net.
    ///
    /// Fails if a binding refers to an unknown layer, names are not unique, a slot is bound
    /// twice, a layer's inputs are not bound densely from slot 0, or the graph has a cycle.
    pub fn build(
        input_name: impl ToString,
        layers: Vec<Box<dyn Layer>>,
        bindings: Vec<Binding>,
    ) -> Result<Self, GraphError> {
        let input_name = input_name.to_string();
        let topology = Topology::new(&input_name, &layers, &bindings)?;
        log::info!(
            "built net of {} layers: {}",
            layers.len(),
            topology
                .order
                .iter()
                .map(|&index| layers[index].name())
                .format(" -> ")
        );

        let blobs = vec![vec![]; layers.len()];
        Ok(Self {
            input_name,
            layers,
            topology,
            input: None,
            blobs,
            allocated: None,
            computed: false,
        })
    }

    #[inline]
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    /// Number of layers.
    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in execution order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.topology
            .order
            .iter()
            .map(|&index| self.layers[index].name())
    }

    pub fn layer(&self, name: &str) -> Option<&dyn Layer> {
        let &index = self.topology.names.get(name)?;
        Some(self.layers[index].as_ref())
    }

    fn layer_error(&self, index: usize, source: LayerError) -> GraphError {
        let name = self.layers[index].name().to_string();
        log::error!("layer `{name}` failed: {source}");
        GraphError::Layer { name, source }
    }

    fn gather(&self, index: usize) -> Result<Vec<Tensor>, GraphError> {
        self.topology.inputs[index]
            .iter()
            .map(|&from| self.blob(from))
            .collect()
    }

    fn blob(&self, from: BlobRef) -> Result<Tensor, GraphError> {
        match from {
            BlobRef::Input => self
                .input
                .clone()
                .ok_or_else(|| GraphError::NotComputed(self.input_name.clone())),
            BlobRef::Output(id, index) => {
                let outputs = &self.blobs[id.0];
                outputs
                    .get(index)
                    .cloned()
                    .ok_or_else(|| GraphError::MissingOutput {
                        layer: self.layers[id.0].name().to_string(),
                        index,
                        count: outputs.len(),
                    })
            }
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn allocate(&mut self) -> Result<(), GraphError> {
        self.blobs = vec![vec![]; self.layers.len()];
        for index in self.topology.order.clone() {
            let inputs = self.gather(index)?;
            let outputs = self.layers[index]
                .allocate(&inputs)
                .map_err(|source| self.layer_error(index, source))?;
            log::debug!(
                "allocated `{}`: [{}] -> [{}]",
                self.layers[index].name(),
                inputs.iter().map(|x| x.shape()).format(", "),
                outputs.iter().map(|x| x.shape()).format(", ")
            );
            self.blobs[index] = outputs;
        }
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn forward(&mut self) -> Result<(), GraphError> {
        for index in self.topology.order.clone() {
            let inputs = self.gather(index)?;
            let mut outputs = mem::take(&mut self.blobs[index]);
            let result = self.layers[index].forward(&inputs, &mut outputs);
            self.blobs[index] = outputs;
            result.map_err(|source| self.layer_error(index, source))?;
            log::trace!("forward `{}`", self.layers[index].name());
        }
        Ok(())
    }

    /// Runs every layer once over `input`, in topological order.
    ///
    /// Layers are (re)allocated first if `input` has a different shape than the last run.
    /// An `input` sharing its buffer with a blob of this net is copied first.
    /// On failure, no blob is valid until the next successful run.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn run(&mut self, input: Tensor) -> Result<(), GraphError> {
        self.computed = false;
        let shape = input.shape();

        // layers write their outputs while reading their inputs
        let shared = self.blobs.iter().flatten().any(|blob| blob.shares_buffer(&input));
        let input = match shared {
            true => {
                log::debug!("copying input that shares a buffer with the net");
                input.deep_clone().map_err(GraphError::Input)?
            }
            false => input,
        };
        self.input = Some(input);

        if self.allocated.as_ref() != Some(&shape) {
            self.allocated = None;
            log::debug!("allocating net for input {shape}");
            self.allocate()?;
            self.allocated = Some(shape);
        }

        self.forward()?;
        self.computed = true;
        Ok(())
    }

    /// Resolves a blob name: the input name, `"<layer>"` (output 0) or `"<layer>.<k>"`.
    fn resolve(&self, name: &str) -> Result<BlobRef, GraphError> {
        if name == self.input_name {
            return Ok(BlobRef::Input);
        }
        if let Some(&index) = self.topology.names.get(name) {
            return Ok(BlobRef::Output(super::LayerId(index), 0));
        }
        name.rsplit_once('.')
            .and_then(|(layer, output)| {
                let &index = self.topology.names.get(layer)?;
                let output = output.parse().ok()?;
                Some(BlobRef::Output(super::LayerId(index), output))
            })
            .ok_or_else(|| GraphError::UnknownBlob(name.to_string()))
    }

    /// The blob `name` as computed by the last run.
    ///
    /// The returned tensor shares its buffer with the net; the next run overwrites it.
    pub fn output(&self, name: &str) -> Result<Tensor, GraphError> {
        let from = self.resolve(name)?;
        match self.computed {
            true => self.blob(from),
            false => Err(GraphError::NotComputed(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use itertools::Itertools;

    use crate::{
        layers::{
            Layer, LayerError, LayerParams,
            eltwise::{Eltwise, EltwiseOp},
            registry::LayerRegistry,
        },
        loom::tensor::Tensor,
        net::{BlobRef, Graph, GraphError},
    };

    /// Adds `delta` to its single input, and counts its calls.
    #[derive(Debug)]
    struct Shift {
        name: String,
        delta: f32,
        allocations: Arc<AtomicUsize>,
        forwards: Arc<AtomicUsize>,
    }

    impl Shift {
        fn new(name: &str, delta: f32) -> Self {
            Self {
                name: name.to_string(),
                delta,
                allocations: Default::default(),
                forwards: Default::default(),
            }
        }
    }

    impl Layer for Shift {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &'static str {
            "Shift"
        }

        fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            Ok(vec![inputs[0].zeros_like()?])
        }

        fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
            self.forwards.fetch_add(1, Ordering::SeqCst);
            if self.delta.is_nan() {
                return Err(LayerError::config(&self.name, "refusing to shift by NaN"));
            }
            let values = inputs[0].to_vec().into_iter().map(|x| x + self.delta).collect_vec();
            outputs[0].write()?.copy_from_slice(&values);
            Ok(())
        }
    }

    #[test]
    fn test_chain() -> Result<(), Box<dyn Error>> {
        let first = Shift::new("first", 1.0);
        let second = Shift::new("second", 10.0);
        let forwards = [first.forwards.clone(), second.forwards.clone()];

        let mut graph = Graph::new("data");
        let second = graph.add_layer(second);
        let first = graph.add_layer(first);
        graph.connect(first, second, 0);
        graph.connect(BlobRef::Input, first, 0);
        let mut net = graph.build()?;

        net.run(Tensor::from_data([1, 3], vec![0.0, 1.0, 2.0])?)?;
        assert_eq!(net.output("first")?.to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(net.output("second")?.to_vec(), vec![11.0, 12.0, 13.0]);
        assert_eq!(net.output("second.0")?.to_vec(), vec![11.0, 12.0, 13.0]);
        assert_eq!(net.output("data")?.to_vec(), vec![0.0, 1.0, 2.0]);
        for counter in &forwards {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        Ok(())
    }

    #[test]
    fn test_diamond() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new("data");
        let left = graph.add_layer(Shift::new("left", 1.0));
        let right = graph.add_layer(Shift::new("right", 2.0));
        let join = graph.add_layer(Eltwise::new("join", EltwiseOp::Prod, vec![])?);
        graph.connect(left, join, 0);
        graph.connect(right, join, 1);
        graph.connect(BlobRef::Input, left, 0);
        graph.connect(BlobRef::Input, right, 0);
        let mut net = graph.build()?;
        assert_eq!(net.order().collect_vec(), vec!["left", "right", "join"]);

        net.run(Tensor::from_data([2], vec![1.0, 2.0])?)?;
        assert_eq!(net.output("join")?.to_vec(), vec![6.0, 12.0]);
        Ok(())
    }

    #[test]
    fn test_repeated_runs() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);

        let layer = Shift::new("shift", 0.5);
        let allocations = layer.allocations.clone();
        let forwards = layer.forwards.clone();

        let mut graph = Graph::new("data");
        let shift = graph.add_layer(layer);
        let sum = graph.add_layer(Eltwise::new("sum", EltwiseOp::Sum, vec![0.5, 2.0])?);
        graph.connect(BlobRef::Input, shift, 0);
        graph.connect(BlobRef::Input, sum, 0);
        graph.connect(shift, sum, 1);
        let mut net = graph.build()?;

        let data = (0..24).map(|_| fastrand::f32()).collect_vec();
        let input = Tensor::from_data([2, 3, 4], data)?;
        net.run(input.clone())?;
        let first = net.output("sum")?.to_vec();
        net.run(input)?;
        let second = net.output("sum")?.to_vec();
        assert_eq!(first, second);
        assert_eq!(allocations.load(Ordering::SeqCst), 1);
        assert_eq!(forwards.load(Ordering::SeqCst), 2);

        // same shape, new data: no re-allocation
        net.run(Tensor::zeros([2, 3, 4])?)?;
        assert_eq!(allocations.load(Ordering::SeqCst), 1);
        assert_eq!(net.output("sum")?.to_vec(), vec![1.0; 24]);

        // new shape: re-allocation
        net.run(Tensor::zeros([4, 6])?)?;
        assert_eq!(allocations.load(Ordering::SeqCst), 2);
        assert_eq!(&net.output("sum")?.shape()[..], &[4, 6]);
        Ok(())
    }

    #[test]
    fn test_failure_invalidates_outputs() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new("data");
        let ok = graph.add_layer(Shift::new("ok", 1.0));
        let bad = graph.add_layer(Shift::new("bad", f32::NAN));
        graph.connect(BlobRef::Input, ok, 0);
        graph.connect(ok, bad, 0);
        let mut net = graph.build()?;

        match net.run(Tensor::zeros([3])?) {
            Err(GraphError::Layer { name, source }) => {
                assert_eq!(name, "bad");
                assert!(matches!(source, LayerError::Config { .. }));
            }
            other => panic!("expected a layer failure, got {other:?}"),
        }
        assert!(matches!(
            net.output("ok"),
            Err(GraphError::NotComputed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_blob_names() -> Result<(), Box<dyn Error>> {
        let registry = LayerRegistry::new().add_default_layers();
        let mut graph = Graph::new("data");
        let pool = graph.add_boxed(registry.create(
            LayerParams::new("MaxPool", "pool")
                .with("kernel_size", 2usize)
                .with("stride", 2usize),
        )?);
        let unpool = graph.add_boxed(registry.create(
            LayerParams::new("MaxUnpool", "unpool")
                .with("pool_k", 2usize)
                .with("pool_pad", 0usize)
                .with("pool_stride", 2usize),
        )?);
        graph.connect(BlobRef::Input, pool, 0);
        graph.connect(pool.output(0), unpool, 0);
        graph.connect(pool.output(1), unpool, 1);
        let mut net = graph.build()?;

        assert!(matches!(
            net.output("pool"),
            Err(GraphError::NotComputed(_))
        ));

        let data = vec![1.0, 4.0, 2.0, 3.0];
        net.run(Tensor::from_data([1, 1, 2, 2], data)?)?;
        assert_eq!(net.output("pool")?.to_vec(), vec![4.0]);
        assert_eq!(net.output("pool.1")?.to_vec(), vec![1.0]);
        assert_eq!(
            net.output("unpool")?.to_vec(),
            vec![0.0, 4.0, 0.0, 0.0]
        );

        assert!(matches!(
            net.output("pool.2"),
            Err(GraphError::MissingOutput {
                index: 2,
                count: 2,
                ..
            })
        ));
        assert!(matches!(
            net.output("conv"),
            Err(GraphError::UnknownBlob(_))
        ));
        assert!(matches!(
            net.output("pool.x"),
            Err(GraphError::UnknownBlob(_))
        ));
        Ok(())
    }

    #[test]
    fn test_output_fed_back() -> Result<(), Box<dyn Error>> {
        let registry = LayerRegistry::new().add_default_layers();
        let mut graph = Graph::new("data");
        let bn = graph.add_boxed(registry.create(
            LayerParams::new("BatchNorm", "bn")
                .with("eps", 0.0f32)
                .with_blob(Tensor::full([2], 1.0)?)
                .with_blob(Tensor::full([2], 4.0)?),
        )?);
        let double = graph.add_layer(Eltwise::new("double", EltwiseOp::Sum, vec![1.0, 1.0])?);
        graph.connect(BlobRef::Input, bn, 0);
        graph.connect(bn, double, 0);
        graph.connect(bn, double, 1);
        let mut net = graph.build()?;

        // (x - 1) / 2, then doubled
        net.run(Tensor::from_data([1, 2, 1, 2], vec![1.0, 3.0, 5.0, 7.0])?)?;
        assert_eq!(net.output("bn")?.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);

        let fed = net.output("bn")?;
        net.run(fed.clone())?;
        assert_eq!(net.output("bn")?.to_vec(), vec![-0.5, 0.0, 0.5, 1.0]);
        assert_eq!(net.output("double")?.to_vec(), vec![-1.0, 0.0, 1.0, 2.0]);
        assert!(!net.output("data")?.shares_buffer(&fed));

        let fed = net.output("double")?;
        net.run(fed)?;
        assert_eq!(net.output("data")?.to_vec(), vec![-1.0, 0.0, 1.0, 2.0]);
        assert_eq!(net.output("bn")?.to_vec(), vec![-1.0, -0.5, 0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_missing_output_binding() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new("data");
        let first = graph.add_layer(Shift::new("first", 1.0));
        let second = graph.add_layer(Shift::new("second", 1.0));
        graph.connect(BlobRef::Input, first, 0);
        graph.connect(first.output(3), second, 0);
        let mut net = graph.build()?;

        assert!(matches!(
            net.run(Tensor::zeros([2])?),
            Err(GraphError::MissingOutput { index: 3, .. })
        ));
        Ok(())
    }
}

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    Layer, LayerError, LayerFactory, LayerParams, batch_norm::BatchNorm, concat::Concat,
    convolution::{Convolution, Deconvolution},
    eltwise::Eltwise,
    max_unpool::MaxUnpool,
    pooling::MaxPool,
};

type LayerCtor = fn(LayerParams) -> Result<Box<dyn Layer>, LayerError>;

/// Maps layer type tags to constructors.
///
/// ```
/// use blobnet::layers::{LayerParams, registry::LayerRegistry};
///
/// let registry = LayerRegistry::new().add_default_layers();
/// let params = LayerParams::new("Eltwise", "sum").with("operation", "max");
/// let layer = registry.create(params).unwrap();
/// assert_eq!(layer.kind(), "Eltwise");
/// ```
#[derive(Debug, Default, Clone)]
pub struct LayerRegistry {
    factories: HashMap<&'static str, LayerCtor>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `L` under [`LayerFactory::KIND`], replacing any previous registration.
    pub fn add_layer<L: LayerFactory>(mut self) -> Self {
        fn create<L: LayerFactory>(params: LayerParams) -> Result<Box<dyn Layer>, LayerError> {
            Ok(Box::new(L::create(params)?))
        }
        self.factories.insert(L::KIND, create::<L>);
        self
    }

    /// Registers every layer kind this crate provides.
    pub fn add_default_layers(self) -> Self {
        self.add_layer::<Concat>()
            .add_layer::<Eltwise>()
            .add_layer::<BatchNorm>()
            .add_layer::<MaxUnpool>()
            .add_layer::<MaxPool>()
            .add_layer::<Convolution>()
            .add_layer::<Deconvolution>()
    }

    #[inline]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type tags, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().sorted().collect()
    }

    /// Creates a layer of type `params.kind`.
    pub fn create(&self, params: LayerParams) -> Result<Box<dyn Layer>, LayerError> {
        match self.factories.get(params.kind.as_str()) {
            Some(create) => create(params),
            None => Err(LayerError::config(
                &params.name,
                format!("unknown layer type `{}`", params.kind),
            )),
        }
    }
}

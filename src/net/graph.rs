use std::collections::BTreeSet;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{Binding, BlobRef, GraphError, LayerId, Net};
use crate::layers::Layer;

/// Builder of a [`Net`].
#[derive(Debug)]
pub struct Graph {
    input_name: String,
    layers: Vec<Box<dyn Layer>>,
    bindings: Vec<Binding>,
}

impl Graph {
    /// An empty graph whose input blob is called `input_name`.
    pub fn new(input_name: impl ToString) -> Self {
        Self {
            input_name: input_name.to_string(),
            layers: vec![],
            bindings: vec![],
        }
    }

    pub fn add_layer(&mut self, layer: impl Layer + 'static) -> LayerId {
        self.add_boxed(Box::new(layer))
    }

    pub fn add_boxed(&mut self, layer: Box<dyn Layer>) -> LayerId {
        self.layers.push(layer);
        LayerId(self.layers.len() - 1)
    }

    /// Binds `from` to input `slot` of layer `to`.
    pub fn connect(&mut self, from: impl Into<BlobRef>, to: LayerId, slot: usize) -> &mut Self {
        let from = from.into();
        self.bindings.push(Binding { from, to, slot });
        self
    }

    pub fn build(self) -> Result<Net, GraphError> {
        Net::build(self.input_name, self.layers, self.bindings)
    }
}

/// Validated structure of a graph.
#[derive(Debug, Clone)]
pub(super) struct Topology {
    /// Producers of the inputs of every layer, by slot.
    pub inputs: Vec<Vec<BlobRef>>,
    /// Layer indices in execution order.
    pub order: Vec<usize>,
    /// Layer indices by name.
    pub names: HashMap<String, usize>,
}

impl Topology {
    pub fn new(
        input_name: &str,
        layers: &[Box<dyn Layer>],
        bindings: &[Binding],
    ) -> Result<Self, GraphError> {
        let mut names = HashMap::default();
        for (index, layer) in layers.iter().enumerate() {
            let name = layer.name();
            if name == input_name || names.insert(name.to_string(), index).is_some() {
                return Err(GraphError::DuplicateName(name.to_string()));
            }
        }

        let check = |id: LayerId| match id.0 < layers.len() {
            true => Ok(id.0),
            false => Err(GraphError::UnknownLayer(id)),
        };

        let mut slots: Vec<Vec<Option<BlobRef>>> = vec![vec![]; layers.len()];
        for binding in bindings {
            let to = check(binding.to)?;
            if let BlobRef::Output(from, _) = binding.from {
                check(from)?;
            }

            let slots = &mut slots[to];
            if slots.len() <= binding.slot {
                slots.resize(binding.slot + 1, None);
            }
            match slots[binding.slot] {
                Some(_) => {
                    return Err(GraphError::DoublyBound {
                        layer: layers[to].name().to_string(),
                        slot: binding.slot,
                    });
                }
                None => slots[binding.slot] = Some(binding.from),
            }
        }

        let inputs = slots
            .into_iter()
            .enumerate()
            .map(|(index, slots)| {
                let unbound = |slot| GraphError::Unbound {
                    layer: layers[index].name().to_string(),
                    slot,
                };
                if slots.is_empty() {
                    return Err(unbound(0));
                }
                slots
                    .into_iter()
                    .enumerate()
                    .map(|(slot, from)| from.ok_or_else(|| unbound(slot)))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<Vec<_>>, _>>()?;

        let order = Self::sort(layers, &inputs)?;
        Ok(Self {
            inputs,
            order,
            names,
        })
    }

    /// Kahn's algorithm; among ready layers, the earliest added runs first.
    fn sort(
        layers: &[Box<dyn Layer>],
        inputs: &[Vec<BlobRef>],
    ) -> Result<Vec<usize>, GraphError> {
        let mut degrees = vec![0usize; layers.len()];
        let mut consumers = vec![vec![]; layers.len()];
        for (consumer, inputs) in inputs.iter().enumerate() {
            for from in inputs {
                if let &BlobRef::Output(producer, _) = from {
                    degrees[consumer] += 1;
                    consumers[producer.0].push(consumer);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..layers.len()).filter(|&i| degrees[i] == 0).collect();
        let mut order = Vec::with_capacity(layers.len());
        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &consumer in &consumers[index] {
                degrees[consumer] -= 1;
                if degrees[consumer] == 0 {
                    ready.insert(consumer);
                }
            }
        }

        match order.len() == layers.len() {
            true => Ok(order),
            false => {
                let cycle = (0..layers.len())
                    .filter(|&index| degrees[index] > 0)
                    .map(|index| layers[index].name().to_string())
                    .collect_vec();
                Err(GraphError::Cycle(cycle))
            }
        }
    }
}

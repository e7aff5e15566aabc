use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::OnceLock;

use super::descriptors::LayerBindingId;
use super::layer::{InputSlotId, Layer, LayerId, LayerOrigin, LayerParams, LayerType, OutputSlotId};
use super::subgraph::SubgraphView;
use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::tensor::TensorInfo;

/// Directed acyclic graph of layers stored in an id-indexed arena.
///
/// Slot connections are kept on both ends: an input slot knows its producer and an
/// output slot lists its consumers. The topological order is cached until the next
/// structural mutation.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    layers: Vec<Option<Layer>>,
    order: Vec<LayerId>,
    topo: OnceLock<Vec<LayerId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, params: LayerParams, name: impl Into<String>) -> LayerId {
        self.add_layer_with_origin(params, name.into(), LayerOrigin::User)
    }

    pub(crate) fn add_synthetic_layer(
        &mut self,
        params: LayerParams,
        name: impl Into<String>,
    ) -> LayerId {
        self.add_layer_with_origin(params, name.into(), LayerOrigin::Synthetic)
    }

    fn add_layer_with_origin(
        &mut self,
        params: LayerParams,
        name: String,
        origin: LayerOrigin,
    ) -> LayerId {
        let id = LayerId(self.layers.len() as u32);
        self.layers.push(Some(Layer::new(id, name, params, origin)));
        self.order.push(id);
        self.invalidate();
        id
    }

    fn invalidate(&mut self) {
        self.topo.take();
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn require(&self, id: LayerId) -> Result<&Layer> {
        self.layer(id)
            .ok_or_else(|| Error::invalid_graph(format!("layer {id} does not exist")))
    }

    pub(crate) fn require_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.layer_mut(id)
            .ok_or_else(|| Error::invalid_graph(format!("layer {id} does not exist")))
    }

    /// Layers in insertion order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> + '_ {
        self.order.iter().filter_map(move |id| self.layer(*id))
    }

    pub fn num_layers(&self) -> usize {
        self.order.len()
    }

    pub fn connect(&mut self, from: OutputSlotId, to: InputSlotId) -> Result<()> {
        let producer = self.require(from.layer)?;
        if from.index as usize >= producer.outputs.len() {
            return Err(Error::invalid_graph(format!(
                "layer '{}' has no output slot {}",
                producer.name, from.index
            )));
        }
        let consumer = self.require(to.layer)?;
        let Some(input) = consumer.inputs.get(to.index as usize) else {
            return Err(Error::invalid_graph(format!(
                "layer '{}' has no input slot {}",
                consumer.name, to.index
            )));
        };
        if let Some(existing) = input.connection {
            return Err(Error::invalid_graph(format!(
                "input slot {to} of '{}' is already connected to {existing}",
                consumer.name
            )));
        }
        if from.layer == to.layer || self.reaches(to.layer, from.layer) {
            return Err(Error::invalid_graph(format!(
                "connecting {from} to {to} would create a cycle"
            )));
        }
        self.require_mut(from.layer)?.outputs[from.index as usize]
            .connections
            .push(to);
        self.require_mut(to.layer)?.inputs[to.index as usize].connection = Some(from);
        self.invalidate();
        Ok(())
    }

    /// Detaches an input slot from its producer, returning the former producer.
    pub fn disconnect(&mut self, to: InputSlotId) -> Result<Option<OutputSlotId>> {
        let consumer = self.require_mut(to.layer)?;
        let Some(input) = consumer.inputs.get_mut(to.index as usize) else {
            return Err(Error::invalid_graph(format!("input slot {to} does not exist")));
        };
        let previous = input.connection.take();
        if let Some(from) = previous {
            if let Some(producer) = self.layer_mut(from.layer) {
                producer.outputs[from.index as usize]
                    .connections
                    .retain(|slot| *slot != to);
            }
        }
        self.invalidate();
        Ok(previous)
    }

    pub fn set_tensor_info(&mut self, slot: OutputSlotId, info: TensorInfo) -> Result<()> {
        info.validate()
            .map_err(|err| Error::invalid_argument(format!("{slot}: {err}")))?;
        let layer = self.require_mut(slot.layer)?;
        let Some(output) = layer.outputs.get_mut(slot.index as usize) else {
            return Err(Error::invalid_graph(format!("output slot {slot} does not exist")));
        };
        output.info = Some(info);
        Ok(())
    }

    pub fn tensor_info(&self, slot: OutputSlotId) -> Option<&TensorInfo> {
        self.layer(slot.layer)
            .and_then(|layer| layer.outputs.get(slot.index as usize))
            .and_then(|output| output.info.as_ref())
    }

    pub fn producer(&self, input: InputSlotId) -> Option<OutputSlotId> {
        self.layer(input.layer)
            .and_then(|layer| layer.inputs.get(input.index as usize))
            .and_then(|slot| slot.connection)
    }

    pub fn consumers(&self, output: OutputSlotId) -> &[InputSlotId] {
        self.layer(output.layer)
            .and_then(|layer| layer.outputs.get(output.index as usize))
            .map(|slot| slot.connections.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_connected(&self, from: OutputSlotId, to: InputSlotId) -> bool {
        self.producer(to) == Some(from)
    }

    /// Tensor infos flowing into every input slot of `id`.
    pub fn input_infos(&self, id: LayerId) -> Result<Vec<TensorInfo>> {
        let layer = self.require(id)?;
        layer
            .inputs
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let from = slot.connection.ok_or_else(|| {
                    Error::invalid_graph(format!(
                        "input slot {index} of '{}' is not connected",
                        layer.name
                    ))
                })?;
                self.tensor_info(from).cloned().ok_or_else(|| {
                    Error::invalid_graph(format!(
                        "input slot {index} of '{}' has no tensor info",
                        layer.name
                    ))
                })
            })
            .collect()
    }

    pub fn output_infos(&self, id: LayerId) -> Result<Vec<TensorInfo>> {
        let layer = self.require(id)?;
        layer
            .outputs
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.info.clone().ok_or_else(|| {
                    Error::invalid_graph(format!(
                        "output slot {index} of '{}' has no tensor info",
                        layer.name
                    ))
                })
            })
            .collect()
    }

    pub fn set_backend(&mut self, id: LayerId, backend: BackendId) -> Result<()> {
        self.require_mut(id)?.backend = Some(backend);
        Ok(())
    }

    pub(crate) fn set_params(&mut self, id: LayerId, params: LayerParams) -> Result<()> {
        let layer = self.require_mut(id)?;
        if params.num_inputs() != layer.inputs.len() || params.num_outputs() != layer.outputs.len()
        {
            return Err(Error::invalid_graph(format!(
                "replacement parameters change the slot count of '{}'",
                layer.name
            )));
        }
        layer.params = params;
        Ok(())
    }

    /// Splices a new single-input layer between `input` and its producer.
    pub fn insert_layer_before(
        &mut self,
        input: InputSlotId,
        params: LayerParams,
        name: impl Into<String>,
    ) -> Result<LayerId> {
        let from = self.producer(input).ok_or_else(|| {
            Error::invalid_graph(format!("cannot insert before unconnected slot {input}"))
        })?;
        if params.num_inputs() == 0 || params.num_outputs() == 0 {
            return Err(Error::invalid_graph(
                "inserted layer needs at least one input and one output",
            ));
        }
        let id = self.add_synthetic_layer(params, name);
        self.disconnect(input)?;
        self.connect(from, InputSlotId::new(id, 0))?;
        self.connect(OutputSlotId::new(id, 0), input)?;
        Ok(id)
    }

    /// Splices a new single-input layer after `output`; all former consumers move to it.
    pub fn insert_layer_after(
        &mut self,
        output: OutputSlotId,
        params: LayerParams,
        name: impl Into<String>,
    ) -> Result<LayerId> {
        self.require(output.layer)?;
        if params.num_inputs() == 0 || params.num_outputs() == 0 {
            return Err(Error::invalid_graph(
                "inserted layer needs at least one input and one output",
            ));
        }
        let id = self.add_synthetic_layer(params, name);
        let consumers = self.consumers(output).to_vec();
        for consumer in &consumers {
            self.disconnect(*consumer)?;
        }
        self.connect(output, InputSlotId::new(id, 0))?;
        for consumer in consumers {
            self.connect(OutputSlotId::new(id, 0), consumer)?;
        }
        Ok(id)
    }

    /// Removes a pass-through layer, wiring its consumers to its producer.
    pub fn bypass_layer(&mut self, id: LayerId) -> Result<()> {
        let layer = self.require(id)?;
        let name = layer.name.clone();
        let from = layer
            .inputs
            .first()
            .and_then(|slot| slot.connection)
            .ok_or_else(|| {
                Error::invalid_graph(format!("cannot bypass '{name}' without a connected input"))
            })?;
        if layer.outputs.iter().skip(1).any(|slot| !slot.connections.is_empty()) {
            return Err(Error::invalid_graph(format!(
                "cannot bypass '{name}': secondary outputs are in use"
            )));
        }
        let consumers = self.consumers(OutputSlotId::new(id, 0)).to_vec();
        for consumer in &consumers {
            self.disconnect(*consumer)?;
        }
        self.erase_layer(id)?;
        for consumer in consumers {
            self.connect(from, consumer)?;
        }
        Ok(())
    }

    /// Deletes a layer whose outputs have no consumers.
    pub fn erase_layer(&mut self, id: LayerId) -> Result<()> {
        let layer = self.require(id)?;
        if layer.outputs.iter().any(|slot| !slot.connections.is_empty()) {
            return Err(Error::invalid_graph(format!(
                "cannot erase '{}' while its outputs are consumed",
                layer.name
            )));
        }
        for index in 0..layer.inputs.len() {
            self.disconnect(InputSlotId::new(id, index as u32))?;
        }
        self.layers[id.index()] = None;
        self.order.retain(|existing| *existing != id);
        self.invalidate();
        Ok(())
    }

    /// Replaces the layers of `view` with a single layer built from `params`.
    ///
    /// The new layer's inputs follow `view.inputs` and its outputs follow `view.outputs`;
    /// output tensor infos are carried over.
    pub fn substitute_subgraph(
        &mut self,
        view: &SubgraphView,
        params: LayerParams,
        name: impl Into<String>,
    ) -> Result<LayerId> {
        if params.num_inputs() != view.inputs.len() || params.num_outputs() != view.outputs.len() {
            return Err(Error::invalid_graph(format!(
                "substitute layer has {}/{} slots, subgraph needs {}/{}",
                params.num_inputs(),
                params.num_outputs(),
                view.inputs.len(),
                view.outputs.len()
            )));
        }
        let members: HashSet<LayerId> = view.layers.iter().copied().collect();
        let mut producers = Vec::with_capacity(view.inputs.len());
        for input in &view.inputs {
            let from = self.producer(*input).ok_or_else(|| {
                Error::invalid_graph(format!("subgraph input {input} is not connected"))
            })?;
            producers.push(from);
        }
        let mut outputs = Vec::with_capacity(view.outputs.len());
        for output in &view.outputs {
            let info = self.tensor_info(*output).cloned();
            let external: Vec<InputSlotId> = self
                .consumers(*output)
                .iter()
                .copied()
                .filter(|slot| !members.contains(&slot.layer))
                .collect();
            outputs.push((info, external));
        }

        let id = self.add_synthetic_layer(params, name);
        for (index, input) in view.inputs.iter().enumerate() {
            self.disconnect(*input)?;
            self.connect(producers[index], InputSlotId::new(id, index as u32))?;
        }
        for (index, (info, external)) in outputs.into_iter().enumerate() {
            let slot = OutputSlotId::new(id, index as u32);
            if let Some(info) = info {
                self.set_tensor_info(slot, info)?;
            }
            for consumer in external {
                self.disconnect(consumer)?;
                self.connect(slot, consumer)?;
            }
        }
        for member in view.layers.iter().rev() {
            let layer = self.require(*member)?;
            let inputs = layer.inputs.len();
            for index in 0..inputs {
                self.disconnect(InputSlotId::new(*member, index as u32))?;
            }
        }
        for member in &view.layers {
            self.erase_layer(*member)?;
        }
        Ok(id)
    }

    /// True when a path of connections leads from `from` to `to`.
    pub fn reaches(&self, from: LayerId, to: LayerId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(layer) = self.layer(id) {
                for slot in &layer.outputs {
                    stack.extend(slot.connections.iter().map(|input| input.layer));
                }
            }
        }
        false
    }

    /// Producers-before-consumers order; ties keep insertion order.
    pub fn topological_order(&self) -> Result<&[LayerId]> {
        if let Some(order) = self.topo.get() {
            return Ok(order);
        }
        let order = self.compute_topological_order()?;
        Ok(self.topo.get_or_init(|| order))
    }

    fn compute_topological_order(&self) -> Result<Vec<LayerId>> {
        let mut rank = vec![usize::MAX; self.layers.len()];
        for (position, id) in self.order.iter().enumerate() {
            rank[id.index()] = position;
        }
        let mut pending = vec![0usize; self.layers.len()];
        let mut ready = BinaryHeap::new();
        for layer in self.layers() {
            let connected = layer.inputs.iter().filter(|slot| slot.connection.is_some()).count();
            pending[layer.id.index()] = connected;
            if connected == 0 {
                ready.push(Reverse((rank[layer.id.index()], layer.id)));
            }
        }
        let mut order = Vec::with_capacity(self.order.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            let Some(layer) = self.layer(id) else { continue };
            for slot in &layer.outputs {
                for consumer in &slot.connections {
                    let count = &mut pending[consumer.layer.index()];
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((rank[consumer.layer.index()], consumer.layer)));
                    }
                }
            }
        }
        if order.len() != self.order.len() {
            return Err(Error::invalid_graph("graph contains a cycle"));
        }
        Ok(order)
    }

    pub fn first_layer_with_name(&self, name: &str) -> Option<&Layer> {
        self.layers().find(|layer| layer.name == name)
    }

    pub fn layers_of_type(&self, layer_type: LayerType) -> impl Iterator<Item = &Layer> + '_ {
        self.layers()
            .filter(move |layer| layer.layer_type() == layer_type)
    }

    pub fn input_layer(&self, binding: LayerBindingId) -> Option<&Layer> {
        self.layers_of_type(LayerType::Input)
            .find(|layer| layer.params.binding_id() == Some(binding))
    }

    pub fn output_layer(&self, binding: LayerBindingId) -> Option<&Layer> {
        self.layers_of_type(LayerType::Output)
            .find(|layer| layer.params.binding_id() == Some(binding))
    }

    pub fn num_inputs(&self) -> usize {
        self.layers_of_type(LayerType::Input).count()
    }

    pub fn num_outputs(&self) -> usize {
        self.layers_of_type(LayerType::Output).count()
    }

    /// Structural checks: every input connected, unique bindings, at least one output, acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.num_outputs() == 0 {
            return Err(Error::invalid_graph("graph has no output layers"));
        }
        for layer in self.layers() {
            if let Some(index) = layer.inputs.iter().position(|slot| slot.connection.is_none()) {
                return Err(Error::invalid_graph(format!(
                    "input slot {index} of '{}' is not connected",
                    layer.name
                )));
            }
        }
        for layer_type in [LayerType::Input, LayerType::Output] {
            let mut seen = HashSet::new();
            for layer in self.layers_of_type(layer_type) {
                if let Some(binding) = layer.params.binding_id() {
                    if !seen.insert(binding) {
                        return Err(Error::invalid_graph(format!(
                            "duplicate {layer_type} binding id {binding}"
                        )));
                    }
                }
            }
        }
        self.topological_order()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::descriptors::{ActivationDescriptor, ActivationFunction};
    use crate::tensor::DataType;

    fn relu() -> LayerParams {
        LayerParams::Activation(ActivationDescriptor::new(ActivationFunction::ReLu))
    }

    fn chain() -> (Graph, LayerId, LayerId, LayerId) {
        let mut graph = Graph::new();
        let input = graph.add_layer(LayerParams::Input(0), "input");
        let act = graph.add_layer(relu(), "relu");
        let output = graph.add_layer(LayerParams::Output(0), "output");
        graph
            .connect(OutputSlotId::new(input, 0), InputSlotId::new(act, 0))
            .unwrap();
        graph
            .connect(OutputSlotId::new(act, 0), InputSlotId::new(output, 0))
            .unwrap();
        (graph, input, act, output)
    }

    #[test]
    fn topological_order_follows_connections() {
        let mut graph = Graph::new();
        let output = graph.add_layer(LayerParams::Output(0), "output");
        let act = graph.add_layer(relu(), "relu");
        let input = graph.add_layer(LayerParams::Input(0), "input");
        graph
            .connect(OutputSlotId::new(input, 0), InputSlotId::new(act, 0))
            .unwrap();
        graph
            .connect(OutputSlotId::new(act, 0), InputSlotId::new(output, 0))
            .unwrap();
        assert_eq!(graph.topological_order().unwrap(), &[input, act, output]);
    }

    #[test]
    fn insert_before_invalidates_cached_order() {
        let (mut graph, input, act, output) = chain();
        assert_eq!(graph.topological_order().unwrap().len(), 3);
        let copy = graph
            .insert_layer_before(InputSlotId::new(act, 0), LayerParams::MemCopy, "copy")
            .unwrap();
        assert_eq!(graph.topological_order().unwrap(), &[input, copy, act, output]);
        assert!(graph.layer(copy).unwrap().is_synthetic());
    }

    #[test]
    fn bypass_rewires_consumers() {
        let (mut graph, input, act, output) = chain();
        graph.bypass_layer(act).unwrap();
        assert!(graph.is_connected(
            OutputSlotId::new(input, 0),
            InputSlotId::new(output, 0)
        ));
        assert!(graph.layer(act).is_none());
        graph.validate().unwrap();
    }

    #[test]
    fn set_tensor_info_rejects_unquantized_q_types() {
        let (mut graph, input, _, _) = chain();
        let err = graph
            .set_tensor_info(
                OutputSlotId::new(input, 0),
                TensorInfo::new([1, 2], DataType::QAsymmU8),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}

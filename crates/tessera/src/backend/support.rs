use std::collections::HashMap;

use crate::graph::{LayerParams, LayerType};
use crate::tensor::{DataType, TensorInfo};

/// Everything a backend needs to decide whether it can run one layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerQuery<'a> {
    pub params: &'a LayerParams,
    pub inputs: &'a [TensorInfo],
    pub outputs: &'a [TensorInfo],
}

impl LayerQuery<'_> {
    pub fn layer_type(&self) -> LayerType {
        self.params.layer_type()
    }
}

type Constraint = Box<dyn Fn(&LayerQuery<'_>) -> Result<(), String> + Send + Sync>;

/// Flat table of supported layer types, their element types and optional extra constraints.
///
/// Queries are pure: the answer depends only on the query.
#[derive(Default)]
pub struct CapabilityTable {
    entries: HashMap<LayerType, Vec<DataType>>,
    constraints: HashMap<LayerType, Vec<Constraint>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn support(mut self, layer_type: LayerType, dtypes: &[DataType]) -> Self {
        self.entries
            .entry(layer_type)
            .or_default()
            .extend_from_slice(dtypes);
        self
    }

    pub fn support_all(self, layer_types: &[LayerType], dtypes: &[DataType]) -> Self {
        layer_types
            .iter()
            .fold(self, |table, layer_type| table.support(*layer_type, dtypes))
    }

    pub fn constrain<F>(mut self, layer_type: LayerType, check: F) -> Self
    where
        F: Fn(&LayerQuery<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.constraints
            .entry(layer_type)
            .or_default()
            .push(Box::new(check));
        self
    }

    pub fn supports_type(&self, layer_type: LayerType) -> bool {
        self.entries.contains_key(&layer_type)
    }

    pub fn check(&self, query: &LayerQuery<'_>) -> Result<(), String> {
        let layer_type = query.layer_type();
        let Some(dtypes) = self.entries.get(&layer_type) else {
            return Err(format!("{layer_type} layers are not supported"));
        };
        for info in query.inputs.iter().chain(query.outputs) {
            if !dtypes.contains(&info.data_type) {
                return Err(format!(
                    "{layer_type} does not support {} tensors",
                    info.data_type
                ));
            }
        }
        if let Some(constraints) = self.constraints.get(&layer_type) {
            for check in constraints {
                check(query)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

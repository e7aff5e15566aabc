//! Backend-neutral end-to-end checks: build a graph, optimize it for one backend,
//! load it and compare the outputs with hand-computed values.

use std::sync::Arc;

use tessera::backend::{BackendId, BackendRegistry};
use tessera::graph::{
    ActivationDescriptor, ActivationFunction, BinaryOperation, Convolution2dDescriptor,
    FullyConnectedDescriptor, Graph, LayerType, SplitDescriptor,
};
use tessera::layout::{DataLayout, NCHW_TO_NHWC, NHWC_TO_NCHW};
use tessera::optimizer::{optimize, OptimizedNetwork, OptimizerOptions};
use tessera::runtime::{InputTensors, NetworkProperties, OutputTensors, Runtime};
use tessera::tensor::{ConstTensor, DataType, Tensor, TensorInfo};
use tessera::Status;

use crate::graphs;

const TOLERANCE: f32 = 1e-4;

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= TOLERANCE * e.abs().max(1.0),
            "element {index}: got {a}, expected {e}"
        );
    }
}

pub fn f32_input(shape: &[u32], values: &[f32]) -> ConstTensor {
    ConstTensor::from_elements(TensorInfo::new(shape, DataType::Float32), values)
        .expect("input tensor matches its shape")
}

pub fn optimize_for(
    graph: &Graph,
    registry: &BackendRegistry,
    backend: &BackendId,
) -> OptimizedNetwork {
    optimize(
        graph,
        std::slice::from_ref(backend),
        registry,
        &OptimizerOptions::default(),
    )
    .expect("graph optimizes")
}

/// Optimizes, loads and runs `graph` once, returning the filled outputs.
pub fn run_once(
    registry: &Arc<BackendRegistry>,
    backend: &BackendId,
    graph: &Graph,
    inputs: InputTensors,
    mut outputs: OutputTensors,
) -> OutputTensors {
    let network = optimize_for(graph, registry, backend);
    let runtime = Runtime::new(Arc::clone(registry));
    let id = runtime
        .load_network(&network, NetworkProperties::default())
        .expect("network loads");
    let status = runtime
        .enqueue_workload(id, &inputs, &mut outputs)
        .expect("enqueue succeeds");
    assert_eq!(status, Status::Success);
    runtime.unload_network(id).expect("network unloads");
    outputs
}

fn f32_output(shape: &[u32]) -> Tensor {
    Tensor::zeroed(TensorInfo::new(shape, DataType::Float32))
}

fn relu_graph(shape: &[u32]) -> Graph {
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let relu = graph.add_activation_layer(ActivationDescriptor::new(ActivationFunction::ReLu), "relu");
    let output = graph.add_output_layer(0, "output");
    graph
        .set_output_info(input, 0, TensorInfo::new(shape, DataType::Float32))
        .expect("valid info");
    graph.connect_layers(input, 0, relu, 0).expect("connect");
    graph.connect_layers(relu, 0, output, 0).expect("connect");
    graph
}

pub fn activation_relu_matches_expected(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let graph = relu_graph(&[2, 3]);
    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[2, 3], &[-1.0, 2.0, -3.0, 4.0, -5.0, 6.0]))],
        vec![(0, f32_output(&[2, 3]))],
    );
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 2.0, 0.0, 4.0, 0.0, 6.0]);
}

pub fn concat_of_computed_inputs_matches_expected(
    registry: &Arc<BackendRegistry>,
    backend: &BackendId,
) {
    let graph = graphs::relu_concat_graph().expect("graph builds");
    let network = optimize_for(&graph, registry, backend);
    let sub_tensors = registry
        .get(backend)
        .expect("backend registered")
        .capabilities()
        .supports_sub_tensors;
    let concat = network
        .graph()
        .first_layer_with_name("concat")
        .expect("concat survives optimization")
        .id();
    if sub_tensors {
        assert!(network.memory_plan().is_elided(concat));
        assert_eq!(network.memory_plan().views().count(), 2);
    } else {
        assert!(network.memory_plan().is_empty());
    }

    let in0: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let in1: Vec<f32> = (0..6).map(|v| 100.0 + v as f32).collect();
    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[1, 6, 2], &in0)), (1, f32_input(&[1, 6, 1], &in1))],
        vec![(0, f32_output(&[1, 6, 3]))],
    );
    let expected: Vec<f32> = (0..6)
        .flat_map(|r| [2.0 * r as f32, 2.0 * r as f32 + 1.0, 100.0 + r as f32])
        .collect();
    assert_close(&outputs[0].1.to_elements::<f32>(), &expected);
}

pub fn quantized_concat_requantizes_inputs(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let graph = graphs::quantized_concat_graph().expect("graph builds");
    let network = optimize_for(&graph, registry, backend);
    assert!(network.memory_plan().is_empty(), "mismatched quantization must copy");

    let (in0, in1, expected) = graphs::quantized_concat_data();
    let q = |shape: [u32; 3], scale, offset, data: Vec<u8>| {
        ConstTensor::new(TensorInfo::quantized(shape, DataType::QAsymmU8, scale, offset), data)
            .expect("quantized input")
    };
    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, q([1, 6, 2], 0.5, 5, in0)), (1, q([1, 6, 1], 0.2, 10, in1))],
        vec![(
            0,
            Tensor::zeroed(TensorInfo::quantized([1, 6, 3], DataType::QAsymmU8, 0.1, 20)),
        )],
    );
    assert_eq!(outputs[0].1.data, expected);
}

pub fn split_then_add_matches_expected(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let split = graph.add_split_layer(
        SplitDescriptor {
            axis: 1,
            sizes: vec![2, 2],
        },
        "split",
    );
    let add = graph.add_elementwise_binary_layer(BinaryOperation::Add, "add");
    let output = graph.add_output_layer(0, "output");
    graph
        .set_output_info(input, 0, TensorInfo::new([1, 4], DataType::Float32))
        .expect("valid info");
    graph.connect_layers(input, 0, split, 0).expect("connect");
    graph.connect_layers(split, 0, add, 0).expect("connect");
    graph.connect_layers(split, 1, add, 1).expect("connect");
    graph.connect_layers(add, 0, output, 0).expect("connect");

    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[1, 4], &[1.0, 2.0, 3.0, 4.0]))],
        vec![(0, f32_output(&[1, 2]))],
    );
    assert_close(&outputs[0].1.to_elements::<f32>(), &[4.0, 6.0]);
}

pub fn inverse_permutes_are_transparent(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let to_nchw = graph.add_permute_layer(NHWC_TO_NCHW.to_vec(), "to_nchw");
    let to_nhwc = graph.add_permute_layer(NCHW_TO_NHWC.to_vec(), "to_nhwc");
    let relu = graph.add_activation_layer(ActivationDescriptor::new(ActivationFunction::ReLu), "relu");
    let output = graph.add_output_layer(0, "output");
    graph
        .set_output_info(input, 0, TensorInfo::new([1, 2, 3, 4], DataType::Float32))
        .expect("valid info");
    graph.connect_layers(input, 0, to_nchw, 0).expect("connect");
    graph.connect_layers(to_nchw, 0, to_nhwc, 0).expect("connect");
    graph.connect_layers(to_nhwc, 0, relu, 0).expect("connect");
    graph.connect_layers(relu, 0, output, 0).expect("connect");

    let network = optimize_for(&graph, registry, backend);
    assert_eq!(network.graph().layers_of_type(LayerType::Permute).count(), 0);

    let values = graphs::random_values(24, 0.0, 1.0, 11);
    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[1, 2, 3, 4], &values))],
        vec![(0, f32_output(&[1, 2, 3, 4]))],
    );
    assert_close(&outputs[0].1.to_elements::<f32>(), &values);
}

pub fn nhwc_convolution_matches_expected(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let weights = ConstTensor::from_elements(
        TensorInfo::new([1, 1, 1, 2], DataType::Float32),
        &[1.0f32, 10.0],
    )
    .expect("weights");
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let conv = graph.add_convolution2d_layer(
        Convolution2dDescriptor::new(weights, DataLayout::NHWC),
        "conv",
    );
    let output = graph.add_output_layer(0, "output");
    graph
        .set_output_info(input, 0, TensorInfo::new([1, 1, 2, 2], DataType::Float32))
        .expect("valid info");
    graph.connect_layers(input, 0, conv, 0).expect("connect");
    graph.connect_layers(conv, 0, output, 0).expect("connect");

    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[1, 1, 2, 2], &[1.0, 3.0, 2.0, 4.0]))],
        vec![(0, f32_output(&[1, 1, 2, 1]))],
    );
    assert_close(&outputs[0].1.to_elements::<f32>(), &[31.0, 42.0]);
}

pub fn fully_connected_matches_expected(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let weights = ConstTensor::from_elements(TensorInfo::new([2, 1], DataType::Float32), &[2.0f32, 3.0])
        .expect("weights");
    let bias = ConstTensor::from_elements(TensorInfo::new([1], DataType::Float32), &[0.5f32])
        .expect("bias");
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let fc = graph.add_fully_connected_layer(
        FullyConnectedDescriptor {
            transpose_weight_matrix: false,
            weights,
            bias: Some(bias),
        },
        "fc",
    );
    let output = graph.add_output_layer(0, "output");
    graph
        .set_output_info(input, 0, TensorInfo::new([2, 2], DataType::Float32))
        .expect("valid info");
    graph.connect_layers(input, 0, fc, 0).expect("connect");
    graph.connect_layers(fc, 0, output, 0).expect("connect");

    let outputs = run_once(
        registry,
        backend,
        &graph,
        vec![(0, f32_input(&[2, 2], &[1.0, 1.0, 2.0, 0.0]))],
        vec![(0, f32_output(&[2, 1]))],
    );
    assert_close(&outputs[0].1.to_elements::<f32>(), &[5.5, 4.5]);
}

pub fn repeated_enqueues_are_independent(registry: &Arc<BackendRegistry>, backend: &BackendId) {
    let graph = relu_graph(&[4]);
    let network = optimize_for(&graph, registry, backend);
    let runtime = Runtime::new(Arc::clone(registry));
    let id = runtime
        .load_network(&network, NetworkProperties::default())
        .expect("network loads");
    for seed in 0..3u64 {
        let values = graphs::random_values(4, -1.0, 1.0, seed);
        let mut outputs = vec![(0, f32_output(&[4]))];
        let status = runtime
            .enqueue_workload(id, &[(0, f32_input(&[4], &values))], &mut outputs)
            .expect("enqueue succeeds");
        assert_eq!(status, Status::Success);
        let expected: Vec<f32> = values.iter().map(|v| v.max(0.0)).collect();
        assert_close(&outputs[0].1.to_elements::<f32>(), &expected);
    }
    runtime.unload_network(id).expect("network unloads");
}

use std::sync::Arc;

use anyhow::Result;
use tessera::backend::{BackendId, BackendRegistry};
use tessera::graph::{
    ActivationDescriptor, ActivationFunction, Convolution2dDescriptor, Graph, InputSlotId,
    LayerParams, LayerType, OutputSlotId,
};
use tessera::layout::{DataLayout, NCHW_TO_NHWC, NHWC_TO_NCHW};
use tessera::optimizer::{optimize, OptimizedNetwork, OptimizerOptions};
use tessera::runtime::{NetworkProperties, Runtime};
use tessera::tensor::{ConstTensor, DataType, Tensor, TensorInfo};
use tessera::{Error, Status};
use tessera_backend_ref_cpu::{register_ref_cpu_backend, REF_CPU_BACKEND_ID};
use tessera_backend_tests::graphs::{detection_post_process_graph, DETECTION_LAYER_NAME};
use tessera_backend_tests::smoke::{assert_close, f32_input};
use tessera_backend_tests::{
    init_test_logging, ExecutionRecorder, MockBackend, MockBackendBuilder, MockCompiledSubgraph,
};

fn cpu_ref() -> BackendId {
    BackendId::new(REF_CPU_BACKEND_ID)
}

fn registry_with(
    mocks: Vec<MockBackendBuilder>,
    with_ref_cpu: bool,
) -> (Arc<BackendRegistry>, Vec<ExecutionRecorder>) {
    let mut registry = BackendRegistry::new();
    if with_ref_cpu {
        register_ref_cpu_backend(&mut registry);
    }
    let mut recorders = Vec::with_capacity(mocks.len());
    for builder in mocks {
        let mock = builder.build();
        recorders.push(mock.recorder());
        registry.register(Arc::new(mock));
    }
    (Arc::new(registry), recorders)
}

fn relu() -> ActivationDescriptor {
    ActivationDescriptor::new(ActivationFunction::ReLu)
}

/// `input -> relu ... relu -> output` with `depth` activations.
fn relu_chain(shape: &[u32], depth: usize) -> Result<Graph> {
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    graph.set_output_info(input, 0, TensorInfo::new(shape, DataType::Float32))?;
    let mut previous = input;
    for index in 0..depth {
        let act = graph.add_activation_layer(relu(), &format!("relu{index}"));
        graph.connect_layers(previous, 0, act, 0)?;
        previous = act;
    }
    let output = graph.add_output_layer(0, "output");
    graph.connect_layers(previous, 0, output, 0)?;
    Ok(graph)
}

fn backend_of(network: &OptimizedNetwork, name: &str) -> BackendId {
    network
        .graph()
        .first_layer_with_name(name)
        .and_then(|layer| layer.backend().cloned())
        .unwrap_or_else(|| panic!("layer '{name}' is missing or unassigned"))
}

fn count(network: &OptimizedNetwork, layer_type: LayerType) -> usize {
    network.graph().layers_of_type(layer_type).count()
}

fn run(
    registry: &Arc<BackendRegistry>,
    network: &OptimizedNetwork,
    inputs: Vec<(i32, ConstTensor)>,
    mut outputs: Vec<(i32, Tensor)>,
) -> Result<Vec<(i32, Tensor)>> {
    let runtime = Runtime::new(Arc::clone(registry));
    let id = runtime.load_network(network, NetworkProperties::default())?;
    let status = runtime.enqueue_workload(id, &inputs, &mut outputs)?;
    assert_eq!(status, Status::Success);
    runtime.unload_network(id)?;
    Ok(outputs)
}

#[test]
fn layers_fall_back_to_the_next_preferred_backend() -> Result<()> {
    init_test_logging();
    let (registry, _recorders) = registry_with(
        vec![MockBackend::builder("Accel").rejects(&[LayerType::Activation])],
        true,
    );
    let graph = relu_chain(&[4], 1)?;
    let network = optimize(
        &graph,
        &[BackendId::new("Accel"), cpu_ref()],
        &registry,
        &OptimizerOptions::default(),
    )?;

    assert_eq!(backend_of(&network, "input"), BackendId::new("Accel"));
    assert_eq!(backend_of(&network, "relu0"), cpu_ref());
    assert_eq!(backend_of(&network, "output"), BackendId::new("Accel"));
    assert_eq!(count(&network, LayerType::MemCopy), 0, "no backend asked for host copies");
    Ok(())
}

#[test]
fn unsupported_layer_reports_every_candidate() -> Result<()> {
    init_test_logging();
    let (registry, _recorders) = registry_with(
        vec![
            MockBackend::builder("A").rejects(&[LayerType::Activation]),
            MockBackend::builder("B").rejects(&[LayerType::Activation]),
        ],
        false,
    );
    let graph = relu_chain(&[4], 1)?;
    let err = optimize(
        &graph,
        &[BackendId::new("A"), BackendId::new("Missing"), BackendId::new("B")],
        &registry,
        &OptimizerOptions::default(),
    )
    .expect_err("no backend runs activations");
    match err {
        Error::LayerNotSupported {
            layer,
            backends,
            reasons,
        } => {
            assert_eq!(layer, "relu0");
            assert_eq!(backends, vec![BackendId::new("A"), BackendId::new("B")]);
            assert_eq!(reasons.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn unregistered_preferences_are_rejected() -> Result<()> {
    let registry = BackendRegistry::new();
    let graph = relu_chain(&[4], 1)?;
    let err = optimize(
        &graph,
        &[BackendId::new("Nowhere")],
        &registry,
        &OptimizerOptions::default(),
    )
    .expect_err("nothing registered");
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");
    Ok(())
}

#[test]
fn optimize_leaves_the_callers_graph_untouched() -> Result<()> {
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let graph = relu_chain(&[4], 2)?;
    let options = OptimizerOptions {
        debug: true,
        ..OptimizerOptions::default()
    };
    let network = optimize(&graph, &[cpu_ref()], &registry, &options)?;

    assert!(network.graph().num_layers() > graph.num_layers());
    assert_eq!(graph.num_layers(), 4);
    assert!(graph.layers().all(|layer| layer.backend().is_none()));
    Ok(())
}

fn nhwc_conv_graph(convs: usize) -> Result<Graph> {
    let weights = ConstTensor::from_elements(
        TensorInfo::new([2, 1, 1, 2], DataType::Float32),
        &[1.0f32, 0.0, 0.0, 1.0],
    )
    .map_err(anyhow::Error::msg)?;
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    graph.set_output_info(input, 0, TensorInfo::new([1, 2, 3, 2], DataType::Float32))?;
    let mut previous = input;
    for index in 0..convs {
        let conv = graph.add_convolution2d_layer(
            Convolution2dDescriptor::new(weights.clone(), DataLayout::NHWC),
            &format!("conv{index}"),
        );
        graph.connect_layers(previous, 0, conv, 0)?;
        previous = conv;
    }
    let output = graph.add_output_layer(0, "output");
    graph.connect_layers(previous, 0, output, 0)?;
    Ok(graph)
}

#[test]
fn required_layout_wraps_the_layer_in_permutes() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let graph = nhwc_conv_graph(1)?;
    let network = optimize(&graph, &[cpu_ref()], &registry, &OptimizerOptions::default())?;

    let permutes: Vec<Vec<u32>> = network
        .graph()
        .layers_of_type(LayerType::Permute)
        .map(|layer| match layer.params() {
            LayerParams::Permute(desc) => desc.mappings.clone(),
            other => panic!("permute layer carries {other:?}"),
        })
        .collect();
    assert_eq!(permutes, vec![NHWC_TO_NCHW.to_vec(), NCHW_TO_NHWC.to_vec()]);

    let conv = network
        .graph()
        .first_layer_with_name("conv0")
        .expect("conv survives");
    match conv.params() {
        LayerParams::Convolution2d(desc) => {
            assert_eq!(desc.data_layout, DataLayout::NCHW);
            assert_eq!(desc.weights.info.shape.dims(), &[2, 2, 1, 1]);
        }
        other => panic!("conv layer carries {other:?}"),
    }
    let conv_out = network
        .graph()
        .tensor_info(OutputSlotId::new(conv.id(), 0))
        .expect("conv output info");
    assert_eq!(conv_out.shape.dims(), &[1, 2, 2, 3]);
    assert!(network
        .graph()
        .layers_of_type(LayerType::Permute)
        .all(|layer| layer.is_synthetic() && layer.backend() == Some(&cpu_ref())));
    Ok(())
}

#[test]
fn adjacent_layout_permutes_cancel_out() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let registry = Arc::new(registry);
    let graph = nhwc_conv_graph(2)?;
    let network = optimize(&graph, &[cpu_ref()], &registry, &OptimizerOptions::default())?;

    assert_eq!(
        count(&network, LayerType::Permute),
        2,
        "only the outermost layout switches remain"
    );

    // Identity weights: two channel-preserving 1x1 convolutions.
    let values: Vec<f32> = (0..12).map(|v| v as f32 - 5.0).collect();
    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[1, 2, 3, 2], &values))],
        vec![(0, Tensor::zeroed(TensorInfo::new([1, 2, 3, 2], DataType::Float32)))],
    )?;
    assert_close(&outputs[0].1.to_elements::<f32>(), &values);
    Ok(())
}

#[test]
fn fp16_reduction_keeps_one_conversion_per_boundary() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let registry = Arc::new(registry);
    let graph = relu_chain(&[6], 2)?;
    let options = OptimizerOptions {
        reduce_fp32_to_fp16: true,
        ..OptimizerOptions::default()
    };
    let network = optimize(&graph, &[cpu_ref()], &registry, &options)?;

    assert_eq!(count(&network, LayerType::ConvertFp32ToFp16), 1);
    assert_eq!(count(&network, LayerType::ConvertFp16ToFp32), 1);
    for name in ["relu0", "relu1"] {
        let layer = network.graph().first_layer_with_name(name).expect("relu survives");
        assert_eq!(
            layer.output_info(0).map(|info| info.data_type),
            Some(DataType::Float16),
            "{name} runs in half precision"
        );
    }

    let values = [-2.0f32, -0.5, 0.0, 0.25, 1.5, 3.0];
    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[6], &values))],
        vec![(0, Tensor::zeroed(TensorInfo::new([6], DataType::Float32)))],
    )?;
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 0.0, 0.0, 0.25, 1.5, 3.0]);
    Ok(())
}

#[test]
fn debug_layers_follow_every_consumed_output() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let registry = Arc::new(registry);
    let graph = relu_chain(&[3], 1)?;
    let options = OptimizerOptions {
        debug: true,
        ..OptimizerOptions::default()
    };
    let network = optimize(&graph, &[cpu_ref()], &registry, &options)?;

    let mut names: Vec<&str> = network
        .graph()
        .layers_of_type(LayerType::Debug)
        .map(|layer| layer.name())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["DebugLayerAfterinput_0", "DebugLayerAfterrelu0_0"]);

    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[3], &[-1.0, 0.5, 2.0]))],
        vec![(0, Tensor::zeroed(TensorInfo::new([3], DataType::Float32)))],
    )?;
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 0.5, 2.0]);
    Ok(())
}

#[test]
fn debug_layers_tap_synthesized_permutes() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    let registry = Arc::new(registry);
    let graph = nhwc_conv_graph(2)?;
    let options = OptimizerOptions {
        debug: true,
        ..OptimizerOptions::default()
    };
    let network = optimize(&graph, &[cpu_ref()], &registry, &options)?;

    // Canonicalization runs first, so the taps see the surviving permutes only.
    assert_eq!(count(&network, LayerType::Permute), 2);
    let permutes: Vec<_> = network.graph().layers_of_type(LayerType::Permute).collect();
    for permute in &permutes {
        let consumers = network.graph().consumers(OutputSlotId::new(permute.id(), 0));
        assert_eq!(consumers.len(), 1);
        let tap = network
            .graph()
            .layer(consumers[0].layer)
            .expect("consumer exists");
        assert_eq!(tap.layer_type(), LayerType::Debug, "{} is tapped", permute.name());
    }
    assert!(network
        .graph()
        .first_layer_with_name("DebugLayerAfterpermute_NHWC_to_NCHW_before_conv0_0")
        .is_some());

    for tap in network.graph().layers_of_type(LayerType::Debug) {
        let producer = network
            .graph()
            .producer(InputSlotId::new(tap.id(), 0))
            .and_then(|slot| network.graph().layer(slot.layer))
            .expect("tap has a producer");
        assert_eq!(tap.backend(), producer.backend(), "{} runs beside its producer", tap.name());
    }

    let values: Vec<f32> = (0..12).map(|v| v as f32 - 5.0).collect();
    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[1, 2, 3, 2], &values))],
        vec![(0, Tensor::zeroed(TensorInfo::new([1, 2, 3, 2], DataType::Float32)))],
    )?;
    assert_close(&outputs[0].1.to_elements::<f32>(), &values);
    Ok(())
}

#[test]
fn host_copy_backends_get_mem_copies_at_their_boundaries() -> Result<()> {
    init_test_logging();
    let (registry, recorders) = registry_with(
        vec![MockBackend::builder("Accel")
            .supports(&[LayerType::Activation, LayerType::MemCopy])
            .host_copies(true)],
        true,
    );
    let recorder = recorders[0].clone();
    let graph = relu_chain(&[4], 1)?;
    let network = optimize(
        &graph,
        &[BackendId::new("Accel"), cpu_ref()],
        &registry,
        &OptimizerOptions::default(),
    )?;

    assert_eq!(backend_of(&network, "relu0"), BackendId::new("Accel"));
    assert_eq!(backend_of(&network, "[ input (MemCopy) ]"), BackendId::new("Accel"));
    assert_eq!(backend_of(&network, "[ relu0 (MemCopy) ]"), cpu_ref());
    assert_eq!(count(&network, LayerType::MemCopy), 2);

    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[4], &[-1.0, 1.0, -2.0, 2.0]))],
        vec![(0, Tensor::zeroed(TensorInfo::new([4], DataType::Float32)))],
    )?;
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 1.0, 0.0, 2.0]);
    assert_eq!(recorder.executed(), vec!["[ input (MemCopy) ]", "relu0"]);
    Ok(())
}

#[test]
fn compiling_backends_replace_runs_with_precompiled_layers() -> Result<()> {
    init_test_logging();
    let (registry, recorders) =
        registry_with(vec![MockBackend::builder("Npu").precompile(true)], false);
    let recorder = recorders[0].clone();
    let graph = relu_chain(&[2], 2)?;
    let network = optimize(
        &graph,
        &[BackendId::new("Npu")],
        &registry,
        &OptimizerOptions::default(),
    )?;

    assert_eq!(count(&network, LayerType::Activation), 0);
    let precompiled: Vec<_> = network.graph().layers_of_type(LayerType::PreCompiled).collect();
    assert_eq!(precompiled.len(), 1);
    let layer = precompiled[0];
    assert_eq!(layer.name(), "precompiled_Npu_0");
    let LayerParams::PreCompiled(desc) = layer.params() else {
        panic!("precompiled layer carries {:?}", layer.params());
    };
    assert_eq!(desc.fused_layers, vec!["relu0", "relu1"]);
    let compiled = desc
        .object
        .downcast_ref::<MockCompiledSubgraph>()
        .expect("object comes from the mock backend");
    assert_eq!(compiled.backend, BackendId::new("Npu"));
    assert_eq!(compiled.layers, vec!["relu0", "relu1"]);
    assert_eq!(
        layer.output_info(0).map(|info| info.shape.dims().to_vec()),
        Some(vec![2])
    );

    let outputs = run(
        &registry,
        &network,
        vec![(0, f32_input(&[2], &[1.0, 2.0]))],
        vec![(0, Tensor::zeroed(TensorInfo::new([2], DataType::Float32)))],
    )?;
    assert_eq!(outputs[0].1.to_elements::<f32>(), vec![0.0, 0.0]);
    assert_eq!(recorder.executed(), vec!["precompiled_Npu_0"]);
    Ok(())
}

#[test]
fn detection_post_process_network_keeps_its_shape() -> Result<()> {
    init_test_logging();
    let (registry, recorders) = registry_with(vec![MockBackend::builder("Mock")], false);
    let recorder = recorders[0].clone();
    let detection = detection_post_process_graph()?;
    let network = optimize(
        &detection.graph,
        &[BackendId::new("Mock")],
        &registry,
        &OptimizerOptions::default(),
    )?;
    let graph = network.graph();

    assert_eq!(graph.num_layers(), 7);
    assert_eq!(graph.num_inputs(), 2);
    assert_eq!(graph.num_outputs(), 4);
    let layer = graph
        .first_layer_with_name(DETECTION_LAYER_NAME)
        .expect("detection layer survives");
    assert_eq!(layer.inputs().len(), 2);
    assert_eq!(layer.outputs().len(), 4);
    let shapes: Vec<Vec<u32>> = (0..4)
        .map(|slot| {
            layer
                .output_info(slot)
                .map(|info| info.shape.dims().to_vec())
                .expect("output info")
        })
        .collect();
    assert_eq!(shapes, vec![vec![1, 3, 4], vec![1, 3], vec![1, 3], vec![1]]);

    let boxes = ConstTensor::new(
        TensorInfo::quantized([1, 6, 4], DataType::QAsymmU8, 1.0, 1),
        vec![1u8; 24],
    )
    .map_err(anyhow::Error::msg)?;
    let scores = ConstTensor::new(
        TensorInfo::quantized([1, 6, 3], DataType::QAsymmU8, 0.009_999_999_78, 0),
        vec![0u8; 18],
    )
    .map_err(anyhow::Error::msg)?;
    let outputs = run(
        &registry,
        &network,
        vec![(0, boxes), (1, scores)],
        vec![
            (0, Tensor::zeroed(TensorInfo::new([1, 3, 4], DataType::Float32))),
            (1, Tensor::zeroed(TensorInfo::new([1, 3], DataType::Float32))),
            (2, Tensor::zeroed(TensorInfo::new([1, 3], DataType::Float32))),
            (3, Tensor::zeroed(TensorInfo::new([1], DataType::Float32))),
        ],
    )?;
    assert_eq!(outputs.len(), 4);
    assert_eq!(recorder.executed(), vec![DETECTION_LAYER_NAME]);
    Ok(())
}

#[test]
fn options_parse_from_json() -> Result<()> {
    let options = OptimizerOptions::from_json(
        r#"{"reduce_fp32_to_fp16": true, "canonicalize_max_iters": 4}"#,
    )?;
    assert!(options.reduce_fp32_to_fp16);
    assert_eq!(options.canonicalize_max_iters, Some(4));
    assert!(!options.debug);
    assert!(OptimizerOptions::from_json(r#"{"debug": "yes"}"#).is_err());
    Ok(())
}

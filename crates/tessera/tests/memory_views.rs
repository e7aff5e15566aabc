use std::sync::Arc;

use anyhow::Result;
use proptest::prelude::*;
use tessera::backend::{BackendId, BackendRegistry, HandleKind};
use tessera::graph::{
    ActivationDescriptor, ActivationFunction, BinaryOperation, ConcatDescriptor, Graph, LayerId,
    LayerType, OutputSlotId, SplitDescriptor,
};
use tessera::optimizer::{optimize, OptimizedNetwork, OptimizerOptions};
use tessera::runtime::{NetworkProperties, Runtime};
use tessera::tensor::{DataType, Tensor, TensorInfo};
use tessera::Status;
use tessera_backend_ref_cpu::{register_ref_cpu_backend, REF_CPU_BACKEND_ID};
use tessera_backend_tests::graphs::{random_values, relu_concat_graph};
use tessera_backend_tests::smoke::{assert_close, f32_input};
use tessera_backend_tests::{init_test_logging, MockBackend};

fn ref_cpu_registry() -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    Arc::new(registry)
}

fn cpu_ref() -> BackendId {
    BackendId::new(REF_CPU_BACKEND_ID)
}

fn optimize_on(
    registry: &BackendRegistry,
    graph: &Graph,
    backends: &[BackendId],
) -> OptimizedNetwork {
    optimize(graph, backends, registry, &OptimizerOptions::default()).expect("graph optimizes")
}

fn relu() -> ActivationDescriptor {
    ActivationDescriptor::new(ActivationFunction::ReLu)
}

fn layer_id(network: &OptimizedNetwork, name: &str) -> LayerId {
    network
        .graph()
        .first_layer_with_name(name)
        .unwrap_or_else(|| panic!("layer '{name}' is missing"))
        .id()
}

/// One `input -> relu` branch per entry of `widths`, concatenated along axis 1.
fn concat_of_relus(widths: &[u32]) -> Result<Graph> {
    let mut graph = Graph::new();
    let concat = graph.add_concat_layer(
        ConcatDescriptor {
            axis: 1,
            num_inputs: widths.len() as u32,
        },
        "concat",
    );
    for (index, &width) in widths.iter().enumerate() {
        let input = graph.add_input_layer(index as i32, &format!("input{index}"));
        let act = graph.add_activation_layer(relu(), &format!("relu{index}"));
        graph.set_output_info(input, 0, TensorInfo::new([2, width, 3], DataType::Float32))?;
        graph.connect_layers(input, 0, act, 0)?;
        graph.connect_layers(act, 0, concat, index as u32)?;
    }
    let output = graph.add_output_layer(0, "output");
    graph.connect_layers(concat, 0, output, 0)?;
    Ok(graph)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concat_views_sit_at_running_offsets(widths in prop::collection::vec(1u32..5, 1..5)) {
        let registry = ref_cpu_registry();
        let graph = concat_of_relus(&widths).unwrap();
        let network = optimize_on(&registry, &graph, &[cpu_ref()]);
        let concat = layer_id(&network, "concat");
        let plan = network.memory_plan();
        prop_assert!(plan.is_elided(concat));

        let mut offset = 0;
        for (index, width) in widths.iter().enumerate() {
            let relu = layer_id(&network, &format!("relu{index}"));
            let view = plan.view_for(OutputSlotId::new(relu, 0)).expect("relu output is a view");
            prop_assert_eq!(view.parent, OutputSlotId::new(concat, 0));
            prop_assert_eq!(&view.origin, &vec![0, offset, 0]);
            offset += width;
        }

        let inputs: Vec<_> = widths
            .iter()
            .enumerate()
            .map(|(index, &width)| {
                let values = random_values(6 * width as usize, 0.0, 1.0, index as u64);
                (index as i32, f32_input(&[2, width, 3], &values))
            })
            .collect();
        let mut outputs =
            vec![(0, Tensor::zeroed(TensorInfo::new([2, offset, 3], DataType::Float32)))];
        let runtime = Runtime::new(Arc::clone(&registry));
        let id = runtime.load_network(&network, NetworkProperties::default()).unwrap();
        let status = runtime.enqueue_workload(id, &inputs, &mut outputs).unwrap();
        prop_assert_eq!(status, Status::Success);

        let mut expected = Vec::new();
        for batch in 0..2usize {
            for (_, tensor) in &inputs {
                let values = tensor.to_elements::<f32>();
                let row = values.len() / 2;
                expected.extend_from_slice(&values[batch * row..(batch + 1) * row]);
            }
        }
        prop_assert_eq!(outputs[0].1.to_elements::<f32>(), expected);
    }
}

#[test]
fn tapped_concat_inputs_fall_back_to_a_real_concat() -> Result<()> {
    init_test_logging();
    let registry = ref_cpu_registry();
    let graph = concat_of_relus(&[1, 2])?;
    let options = OptimizerOptions {
        debug: true,
        ..OptimizerOptions::default()
    };
    let network = optimize(&graph, &[cpu_ref()], &registry, &options)?;
    assert!(network.memory_plan().is_empty(), "taps share every relu output");

    let first = random_values(6, -1.0, 1.0, 7);
    let second = random_values(12, -1.0, 1.0, 8);
    let inputs = vec![
        (0, f32_input(&[2, 1, 3], &first)),
        (1, f32_input(&[2, 2, 3], &second)),
    ];
    let mut outputs = vec![(0, Tensor::zeroed(TensorInfo::new([2, 3, 3], DataType::Float32)))];
    let runtime = Runtime::new(Arc::clone(&registry));
    let id = runtime.load_network(&network, NetworkProperties::default())?;
    assert_eq!(runtime.enqueue_workload(id, &inputs, &mut outputs)?, Status::Success);

    let relu = |v: &f32| v.max(0.0);
    let mut expected = Vec::new();
    for batch in 0..2 {
        expected.extend(first[batch * 3..(batch + 1) * 3].iter().map(relu));
        expected.extend(second[batch * 6..(batch + 1) * 6].iter().map(relu));
    }
    assert_close(&outputs[0].1.to_elements::<f32>(), &expected);
    Ok(())
}

#[test]
fn elided_concat_runs_no_workload() -> Result<()> {
    init_test_logging();
    let registry = ref_cpu_registry();
    let graph = relu_concat_graph()?;
    let network = optimize_on(&registry, &graph, &[cpu_ref()]);
    let runtime = Runtime::new(Arc::clone(&registry));
    let id = runtime.load_network(&network, NetworkProperties::default())?;
    let loaded = runtime.network(id)?;

    assert_eq!(loaded.workload_names(), vec!["relu0", "relu1"]);
    let views = loaded
        .handle_table()
        .entries()
        .iter()
        .filter(|entry| matches!(entry.kind, HandleKind::View { .. }))
        .count();
    assert_eq!(views, 2);
    runtime.unload_network(id)?;
    Ok(())
}

#[test]
fn concat_with_a_shared_input_copies() -> Result<()> {
    init_test_logging();
    let registry = ref_cpu_registry();
    let mut graph = concat_of_relus(&[1, 2])?;
    let relu0 = graph.first_layer_with_name("relu0").expect("relu0").id();
    let tap = graph.add_output_layer(1, "tap");
    graph.connect_layers(relu0, 0, tap, 0)?;
    let network = optimize_on(&registry, &graph, &[cpu_ref()]);

    assert!(network.memory_plan().is_empty(), "one unqualified input keeps the whole concat");
    let outputs = {
        let runtime = Runtime::new(Arc::clone(&registry));
        let id = runtime.load_network(&network, NetworkProperties::default())?;
        let mut outputs = vec![
            (0, Tensor::zeroed(TensorInfo::new([2, 3, 3], DataType::Float32))),
            (1, Tensor::zeroed(TensorInfo::new([2, 1, 3], DataType::Float32))),
        ];
        let status = runtime.enqueue_workload(
            id,
            &[
                (0, f32_input(&[2, 1, 3], &[-1.0, 1.0, 2.0, 3.0, -4.0, 5.0])),
                (1, f32_input(&[2, 2, 3], &[1.0; 12])),
            ],
            &mut outputs,
        )?;
        assert_eq!(status, Status::Success);
        outputs
    };
    assert_close(&outputs[1].1.to_elements::<f32>(), &[0.0, 1.0, 2.0, 3.0, 0.0, 5.0]);
    let joined = outputs[0].1.to_elements::<f32>();
    assert_close(&joined[..3], &[0.0, 1.0, 2.0]);
    assert_close(&joined[9..12], &[3.0, 0.0, 5.0]);
    Ok(())
}

#[test]
fn concat_of_network_inputs_copies() -> Result<()> {
    let registry = ref_cpu_registry();
    let mut graph = Graph::new();
    let a = graph.add_input_layer(0, "a");
    let b = graph.add_input_layer(1, "b");
    let concat = graph.add_concat_layer(
        ConcatDescriptor {
            axis: 0,
            num_inputs: 2,
        },
        "concat",
    );
    let out = graph.add_output_layer(0, "out");
    graph.set_output_info(a, 0, TensorInfo::new([1, 2], DataType::Float32))?;
    graph.set_output_info(b, 0, TensorInfo::new([1, 2], DataType::Float32))?;
    graph.connect_layers(a, 0, concat, 0)?;
    graph.connect_layers(b, 0, concat, 1)?;
    graph.connect_layers(concat, 0, out, 0)?;

    let network = optimize_on(&registry, &graph, &[cpu_ref()]);
    assert!(network.memory_plan().is_empty());
    Ok(())
}

#[test]
fn concat_across_backends_copies() -> Result<()> {
    init_test_logging();
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    registry.register(Arc::new(
        MockBackend::builder("Accel")
            .supports(&[LayerType::Activation])
            .build(),
    ));
    let graph = relu_concat_graph()?;
    let network = optimize_on(&registry, &graph, &[BackendId::new("Accel"), cpu_ref()]);
    assert_eq!(
        network
            .graph()
            .first_layer_with_name("concat")
            .and_then(|layer| layer.backend().cloned()),
        Some(cpu_ref())
    );
    assert!(network.memory_plan().is_empty(), "relu outputs live on another backend");
    Ok(())
}

#[test]
fn split_outputs_alias_their_input() -> Result<()> {
    init_test_logging();
    let registry = ref_cpu_registry();
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let act = graph.add_activation_layer(relu(), "relu");
    let split = graph.add_split_layer(
        SplitDescriptor {
            axis: 1,
            sizes: vec![2, 2],
        },
        "split",
    );
    let mul = graph.add_elementwise_binary_layer(BinaryOperation::Mul, "mul");
    let out = graph.add_output_layer(0, "out");
    graph.set_output_info(input, 0, TensorInfo::new([2, 4], DataType::Float32))?;
    graph.connect_layers(input, 0, act, 0)?;
    graph.connect_layers(act, 0, split, 0)?;
    graph.connect_layers(split, 0, mul, 0)?;
    graph.connect_layers(split, 1, mul, 1)?;
    graph.connect_layers(mul, 0, out, 0)?;

    let network = optimize_on(&registry, &graph, &[cpu_ref()]);
    let split = layer_id(&network, "split");
    let relu = layer_id(&network, "relu");
    let plan = network.memory_plan();
    assert!(plan.is_elided(split));
    for (index, origin) in [vec![0, 0], vec![0, 2]].into_iter().enumerate() {
        let view = plan
            .view_for(OutputSlotId::new(split, index as u32))
            .expect("split output is a view");
        assert_eq!(view.parent, OutputSlotId::new(relu, 0));
        assert_eq!(view.origin, origin);
    }

    let runtime = Runtime::new(Arc::clone(&registry));
    let id = runtime.load_network(&network, NetworkProperties::default())?;
    let mut outputs = vec![(0, Tensor::zeroed(TensorInfo::new([2, 2], DataType::Float32)))];
    let status = runtime.enqueue_workload(
        id,
        &[(0, f32_input(&[2, 4], &[1.0, 2.0, 3.0, 4.0, -1.0, 5.0, 6.0, 7.0]))],
        &mut outputs,
    )?;
    assert_eq!(status, Status::Success);
    assert_close(&outputs[0].1.to_elements::<f32>(), &[3.0, 8.0, 0.0, 35.0]);
    assert_eq!(runtime.network(id)?.workload_names(), vec!["relu", "mul"]);
    Ok(())
}

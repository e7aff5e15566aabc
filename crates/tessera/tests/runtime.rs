use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tessera::backend::{BackendId, BackendRegistry};
use tessera::graph::{ActivationDescriptor, ActivationFunction, Graph};
use tessera::optimizer::{optimize, OptimizerOptions};
use tessera::runtime::{
    reset_inference_time, run_asynchronous, run_synchronous, take_inference_time,
    CallbackManager, InputTensors, MemorySource, NetworkId, NetworkProperties, NetworkState,
    OutputTensors, QosExecPriority, Runtime, Threadpool,
};
use tessera::tensor::{DataType, Tensor, TensorInfo};
use tessera::{Error, Status};
use tessera_backend_ref_cpu::{register_ref_cpu_backend, CpuTensorHandle, REF_CPU_BACKEND_ID};
use tessera_backend_tests::smoke::{assert_close, f32_input};
use tessera_backend_tests::{init_test_logging, ExecutionRecorder, MockBackend, MockBackendBuilder};

fn relu_graph(len: u32) -> Result<Graph> {
    let mut graph = Graph::new();
    let input = graph.add_input_layer(0, "input");
    let act = graph.add_activation_layer(ActivationDescriptor::new(ActivationFunction::ReLu), "relu");
    let output = graph.add_output_layer(0, "output");
    graph.set_output_info(input, 0, TensorInfo::new([len], DataType::Float32))?;
    graph.connect_layers(input, 0, act, 0)?;
    graph.connect_layers(act, 0, output, 0)?;
    Ok(graph)
}

fn ref_cpu_runtime() -> (Runtime, BackendId) {
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    (Runtime::new(Arc::new(registry)), BackendId::new(REF_CPU_BACKEND_ID))
}

fn mock_runtime(builder: MockBackendBuilder) -> (Runtime, BackendId, ExecutionRecorder) {
    let mock = builder.build();
    let id = mock_id(&mock);
    let recorder = mock.recorder();
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(mock));
    (Runtime::new(Arc::new(registry)), id, recorder)
}

fn mock_id(mock: &MockBackend) -> BackendId {
    use tessera::backend::Backend;
    mock.id()
}

fn load_relu(runtime: &Runtime, backend: &BackendId, properties: NetworkProperties) -> Result<NetworkId> {
    let graph = relu_graph(4)?;
    let network = optimize(
        &graph,
        std::slice::from_ref(backend),
        runtime.registry(),
        &OptimizerOptions::default(),
    )?;
    Ok(runtime.load_network(&network, properties)?)
}

fn relu_request(values: [f32; 4]) -> (InputTensors, OutputTensors) {
    (
        vec![(0, f32_input(&[4], &values))],
        vec![(0, Tensor::zeroed(TensorInfo::new([4], DataType::Float32)))],
    )
}

fn async_properties() -> NetworkProperties {
    NetworkProperties {
        async_enabled: true,
        ..NetworkProperties::default()
    }
}

#[test]
fn network_state_follows_the_lifecycle() -> Result<()> {
    init_test_logging();
    let (runtime, backend, _recorder) =
        mock_runtime(MockBackend::builder("Slow").delay(Duration::from_millis(200)));
    let runtime = Arc::new(runtime);
    let id = load_relu(&runtime, &backend, NetworkProperties::default())?;
    assert_eq!(runtime.network_state(id), NetworkState::Loaded);

    let worker = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            let (inputs, mut outputs) = relu_request([-1.0, 1.0, -2.0, 2.0]);
            let status = runtime.enqueue_workload(id, &inputs, &mut outputs);
            (status.map_err(|err| err.to_string()), outputs)
        })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while runtime.network_state(id) != NetworkState::Running {
        assert!(Instant::now() < deadline, "inference never started");
        thread::sleep(Duration::from_millis(1));
    }

    runtime.unload_network(id)?;
    let (status, outputs) = worker.join().expect("worker thread panicked");
    assert_eq!(status, Ok(Status::Success), "unload waits for the running inference");
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 1.0, 0.0, 2.0]);

    assert_eq!(runtime.network_state(id), NetworkState::Unloaded);
    let (inputs, mut outputs) = relu_request([0.0; 4]);
    let err = runtime
        .enqueue_workload(id, &inputs, &mut outputs)
        .expect_err("network is gone");
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");
    assert!(runtime.unload_network(id).is_err(), "double unload is rejected");
    Ok(())
}

#[test]
fn workload_failures_surface_as_status() -> Result<()> {
    init_test_logging();
    let (runtime, backend, recorder) = mock_runtime(MockBackend::builder("Flaky").fail_on("relu"));
    let id = load_relu(&runtime, &backend, NetworkProperties::default())?;
    let (inputs, mut outputs) = relu_request([1.0; 4]);
    assert_eq!(runtime.enqueue_workload(id, &inputs, &mut outputs)?, Status::Failure);
    assert_eq!(recorder.executed(), vec!["relu"]);

    // The network stays usable after a failed inference.
    assert_eq!(runtime.network_state(id), NetworkState::Loaded);
    assert_eq!(runtime.enqueue_workload(id, &inputs, &mut outputs)?, Status::Failure);
    Ok(())
}

#[test]
fn malformed_requests_are_rejected() -> Result<()> {
    init_test_logging();
    let (runtime, backend) = ref_cpu_runtime();
    let id = load_relu(&runtime, &backend, NetworkProperties::default())?;
    let mut outputs = vec![(0, Tensor::zeroed(TensorInfo::new([4], DataType::Float32)))];

    let missing = runtime.enqueue_workload(id, &[], &mut outputs);
    assert!(matches!(missing, Err(Error::InvalidArgument(_))), "{missing:?}");

    let twice = vec![
        (0, f32_input(&[4], &[1.0; 4])),
        (0, f32_input(&[4], &[2.0; 4])),
    ];
    let duplicate = runtime.enqueue_workload(id, &twice, &mut outputs);
    assert!(matches!(duplicate, Err(Error::InvalidArgument(_))), "{duplicate:?}");

    let unknown = runtime.enqueue_workload(
        id,
        &[(0, f32_input(&[4], &[1.0; 4])), (9, f32_input(&[4], &[1.0; 4]))],
        &mut outputs,
    );
    assert!(matches!(unknown, Err(Error::InvalidArgument(_))), "{unknown:?}");

    let wrong_shape = runtime.enqueue_workload(id, &[(0, f32_input(&[2, 2], &[1.0; 4]))], &mut outputs);
    assert!(matches!(wrong_shape, Err(Error::InvalidArgument(_))), "{wrong_shape:?}");

    let mut bad_output = vec![(3, Tensor::zeroed(TensorInfo::new([4], DataType::Float32)))];
    let unknown_output =
        runtime.enqueue_workload(id, &[(0, f32_input(&[4], &[1.0; 4]))], &mut bad_output);
    assert!(matches!(unknown_output, Err(Error::InvalidArgument(_))), "{unknown_output:?}");

    // Expanded shapes with leading unit dimensions are accepted.
    let status = runtime.enqueue_workload(id, &[(0, f32_input(&[1, 4], &[-1.0; 4]))], &mut outputs)?;
    assert_eq!(status, Status::Success);
    Ok(())
}

#[test]
fn malloc_inputs_are_imported_without_copying() -> Result<()> {
    init_test_logging();
    let (runtime, backend) = ref_cpu_runtime();
    let copied = load_relu(&runtime, &backend, NetworkProperties::default())?;
    let imported = load_relu(
        &runtime,
        &backend,
        NetworkProperties {
            input_source: MemorySource::Malloc,
            ..NetworkProperties::default()
        },
    )?;
    assert!(!runtime.network(copied)?.input_bindings()[0].importable);

    let network = runtime.network(imported)?;
    let binding = network.input_binding(0).expect("input binding 0").clone();
    assert!(binding.importable);

    let memory = network.create_working_memory()?;
    let (inputs, mut outputs) = relu_request([-3.0, 3.0, -4.0, 4.0]);
    let aligned = inputs[0].1.data.as_ptr() as usize % 4 == 0;
    assert_eq!(network.execute(&memory, &inputs, &mut outputs)?, Status::Success);
    assert_close(&outputs[0].1.to_elements::<f32>(), &[0.0, 3.0, 0.0, 4.0]);

    let handle = memory.handle(binding.handle)?;
    let cpu = handle
        .as_any()
        .downcast_ref::<CpuTensorHandle>()
        .expect("reference backend hands out cpu handles");
    assert_eq!(cpu.is_imported(), aligned);
    Ok(())
}

#[test]
fn synchronous_iterations_report_thresholds() -> Result<()> {
    init_test_logging();
    let (runtime, backend, _recorder) =
        mock_runtime(MockBackend::builder("Slow").delay(Duration::from_millis(5)));
    let id = load_relu(&runtime, &backend, NetworkProperties::default())?;

    reset_inference_time();
    let mut iterations = vec![relu_request([1.0; 4]), relu_request([-1.0; 4])];
    let reports = run_synchronous(&runtime, id, &mut iterations, Duration::ZERO)?;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status == Status::Success && r.within_threshold));
    assert_eq!(reports[1].iteration, 1);
    let total: Duration = reports.iter().map(|r| r.duration).sum();
    assert_eq!(take_inference_time(), total);
    assert_close(&iterations[0].1[0].1.to_elements::<f32>(), &[1.0; 4]);
    assert_close(&iterations[1].1[0].1.to_elements::<f32>(), &[0.0; 4]);

    let reports = run_synchronous(&runtime, id, &mut iterations, Duration::from_nanos(1))?;
    assert!(reports.iter().all(|r| !r.within_threshold), "5ms workloads miss a 1ns deadline");
    Ok(())
}

#[test]
fn threadpool_requires_async_networks() -> Result<()> {
    let (runtime, backend) = ref_cpu_runtime();
    let sync_only = load_relu(&runtime, &backend, NetworkProperties::default())?;
    let err = Threadpool::new(&runtime, &[sync_only], 1).expect_err("not async");
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {err}");
    assert!(Threadpool::new(&runtime, &[], 1).is_err());

    let served = load_relu(&runtime, &backend, async_properties())?;
    let pool = Threadpool::new(&runtime, &[served], 2)?;
    assert_eq!(pool.num_threads(), 2);
    let (inputs, outputs) = relu_request([0.0; 4]);
    let manager = CallbackManager::new();
    assert!(pool
        .schedule(sync_only, inputs, outputs, QosExecPriority::Medium, manager)
        .is_err());
    Ok(())
}

#[test]
fn threadpool_serves_higher_priorities_first() -> Result<()> {
    init_test_logging();
    let (runtime, backend, _recorder) =
        mock_runtime(MockBackend::builder("Slow").delay(Duration::from_millis(50)));
    let id = load_relu(&runtime, &backend, async_properties())?;
    let pool = Threadpool::new(&runtime, &[id], 1)?;
    let manager = CallbackManager::new();

    let schedule = |priority| {
        let (inputs, outputs) = relu_request([1.0; 4]);
        pool.schedule(id, inputs, outputs, priority, manager.clone())
    };
    let _blocker = schedule(QosExecPriority::Low)?;
    let low = schedule(QosExecPriority::Low)?;
    let medium = schedule(QosExecPriority::Medium)?;
    let high = schedule(QosExecPriority::High)?;

    let mut order = Vec::new();
    for _ in 0..4 {
        let completion = manager
            .wait_timeout(Duration::from_secs(10))
            .expect("every inference completes");
        assert_eq!(completion.status, Status::Success);
        assert!(!completion.cancelled);
        assert_eq!(completion.network_id, id);
        assert_close(&completion.outputs[0].1.to_elements::<f32>(), &[1.0; 4]);
        order.push(completion.inference_id);
    }
    order.retain(|inference| [low, medium, high].contains(inference));
    assert_eq!(order, vec![high, medium, low]);
    Ok(())
}

#[test]
fn pending_inferences_are_cancelled() -> Result<()> {
    init_test_logging();
    let (runtime, backend, _recorder) =
        mock_runtime(MockBackend::builder("Slow").delay(Duration::from_millis(100)));
    let id = load_relu(&runtime, &backend, async_properties())?;
    let manager = CallbackManager::new();

    let pool = Threadpool::new(&runtime, &[id], 1)?;
    for _ in 0..3 {
        let (inputs, outputs) = relu_request([1.0; 4]);
        pool.schedule(id, inputs, outputs, QosExecPriority::Medium, manager.clone())?;
    }
    let cancelled = pool.cancel_pending();
    assert!(cancelled >= 2, "at most one request was running, {cancelled} cancelled");

    for _ in 0..3 {
        let (inputs, outputs) = relu_request([1.0; 4]);
        pool.schedule(id, inputs, outputs, QosExecPriority::Low, manager.clone())?;
    }
    drop(pool);

    let mut completions = Vec::new();
    while let Some(completion) = manager.wait_timeout(Duration::from_secs(1)) {
        completions.push(completion);
    }
    assert_eq!(completions.len(), 6, "every callback fires exactly once");
    let dropped = completions.iter().filter(|c| c.cancelled).count();
    assert!(dropped >= 4, "only {dropped} requests were cancelled");
    assert!(completions
        .iter()
        .filter(|c| c.cancelled)
        .all(|c| c.status == Status::Failure));
    Ok(())
}

#[test]
fn scheduled_request_errors_are_reported_through_the_callback() -> Result<()> {
    init_test_logging();
    let (runtime, backend) = ref_cpu_runtime();
    let id = load_relu(&runtime, &backend, async_properties())?;
    let pool = Threadpool::new(&runtime, &[id], 1)?;
    let manager = CallbackManager::new();

    let outputs = vec![(0, Tensor::zeroed(TensorInfo::new([4], DataType::Float32)))];
    pool.schedule(id, Vec::new(), outputs, QosExecPriority::High, manager.clone())?;
    let completion = manager
        .wait_timeout(Duration::from_secs(10))
        .expect("the request completes");
    assert_eq!(completion.status, Status::Failure);
    assert!(!completion.cancelled);
    assert!(completion.error.is_some_and(|e| e.contains("no tensor supplied")));
    Ok(())
}

#[test]
fn asynchronous_iterations_come_back_in_order() -> Result<()> {
    init_test_logging();
    let (runtime, backend) = ref_cpu_runtime();
    let id = load_relu(&runtime, &backend, async_properties())?;
    let pool = Threadpool::new(&runtime, &[id], 2)?;

    let iterations: Vec<_> = (0..6)
        .map(|i| relu_request([i as f32, -(i as f32), 1.0, -1.0]))
        .collect();
    let results = run_asynchronous(&pool, id, iterations, QosExecPriority::Medium, Duration::ZERO)?;
    assert_eq!(results.len(), 6);
    for (i, (report, outputs)) in results.iter().enumerate() {
        assert_eq!(report.iteration, i);
        assert_eq!(report.status, Status::Success);
        assert!(report.within_threshold);
        assert_close(&outputs[0].1.to_elements::<f32>(), &[i as f32, 0.0, 1.0, 0.0]);
    }
    Ok(())
}

#[test]
fn network_properties_parse_from_json() -> Result<()> {
    let properties =
        NetworkProperties::from_json(r#"{"async_enabled": true, "input_source": "Malloc"}"#)?;
    assert!(properties.async_enabled);
    assert_eq!(properties.input_source, MemorySource::Malloc);
    assert_eq!(properties.output_source, MemorySource::Undefined);
    assert!(NetworkProperties::from_json(r#"{"input_source": "Dma"}"#).is_err());
    Ok(())
}

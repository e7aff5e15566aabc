//! Graphs shared by the smoke suite and the integration tests.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::graph::{
    ActivationDescriptor, ActivationFunction, ConcatDescriptor, DetectionPostProcessDescriptor,
    Graph, LayerId,
};
use tessera::tensor::{ConstTensor, DataType, TensorInfo};

pub const CONCAT_AXIS: u32 = 2;

/// Random Float32 values in `[lo, hi)`, reproducible per seed.
pub fn random_values(len: usize, lo: f32, hi: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

/// `input0 {1,6,2} -> ReLU`, `input1 {1,6,1} -> ReLU`, both concatenated on axis 2
/// into output 0 `{1,6,3}`.
pub fn relu_concat_graph() -> Result<Graph> {
    let mut graph = Graph::new();
    let in0 = graph.add_input_layer(0, "input0");
    let in1 = graph.add_input_layer(1, "input1");
    let relu0 = graph.add_activation_layer(ActivationDescriptor::new(ActivationFunction::ReLu), "relu0");
    let relu1 = graph.add_activation_layer(ActivationDescriptor::new(ActivationFunction::ReLu), "relu1");
    let concat = graph.add_concat_layer(
        ConcatDescriptor {
            axis: CONCAT_AXIS,
            num_inputs: 2,
        },
        "concat",
    );
    let out = graph.add_output_layer(0, "output");
    graph.set_output_info(in0, 0, TensorInfo::new([1, 6, 2], DataType::Float32))?;
    graph.set_output_info(in1, 0, TensorInfo::new([1, 6, 1], DataType::Float32))?;
    graph.connect_layers(in0, 0, relu0, 0)?;
    graph.connect_layers(in1, 0, relu1, 0)?;
    graph.connect_layers(relu0, 0, concat, 0)?;
    graph.connect_layers(relu1, 0, concat, 1)?;
    graph.connect_layers(concat, 0, out, 0)?;
    Ok(graph)
}

/// Quantized inputs with differing `(scale, offset)` fed straight into a concat whose
/// output uses a third parameter set.
pub fn quantized_concat_graph() -> Result<Graph> {
    let mut graph = Graph::new();
    let in0 = graph.add_input_layer(0, "input0");
    let in1 = graph.add_input_layer(1, "input1");
    let concat = graph.add_concat_layer(
        ConcatDescriptor {
            axis: CONCAT_AXIS,
            num_inputs: 2,
        },
        "concat",
    );
    let out = graph.add_output_layer(0, "output");
    graph.set_output_info(in0, 0, TensorInfo::quantized([1, 6, 2], DataType::QAsymmU8, 0.5, 5))?;
    graph.set_output_info(in1, 0, TensorInfo::quantized([1, 6, 1], DataType::QAsymmU8, 0.2, 10))?;
    graph.set_output_info(
        concat,
        0,
        TensorInfo::quantized([1, 6, 3], DataType::QAsymmU8, 0.1, 20),
    )?;
    graph.connect_layers(in0, 0, concat, 0)?;
    graph.connect_layers(in1, 0, concat, 1)?;
    graph.connect_layers(concat, 0, out, 0)?;
    Ok(graph)
}

/// Input values and the expected output of [`quantized_concat_graph`].
pub fn quantized_concat_data() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let in0: Vec<u8> = (1..=12).collect();
    let in1: Vec<u8> = (37..=42).collect();
    let expected = (0..6u8)
        .flat_map(|r| [10 * r, 10 * r + 5, 74 + 2 * r])
        .collect();
    (in0, in1, expected)
}

pub struct DetectionGraph {
    pub graph: Graph,
    pub detection: LayerId,
}

pub const DETECTION_LAYER_NAME: &str = "DetectionPostProcess:0:0";

/// Box encodings `{1,6,4}` and scores `{1,6,3}` feeding a DetectionPostProcess layer
/// with `max_detections = 3`, whose four outputs each go to an output layer.
pub fn detection_post_process_graph() -> Result<DetectionGraph> {
    let anchors: Vec<f32> = [
        [0.5, 0.5, 1.0, 1.0],
        [0.5, 0.5, 1.0, 1.0],
        [0.5, 0.5, 1.0, 1.0],
        [0.5, 10.5, 1.0, 1.0],
        [0.5, 10.5, 1.0, 1.0],
        [0.5, 100.5, 1.0, 1.0],
    ]
    .concat();
    let anchors = ConstTensor::from_elements(TensorInfo::new([6, 4], DataType::Float32), &anchors)
        .map_err(anyhow::Error::msg)?;
    let desc = DetectionPostProcessDescriptor {
        max_detections: 3,
        max_classes_per_detection: 1,
        detections_per_class: 1,
        nms_score_threshold: 0.0,
        nms_iou_threshold: 0.5,
        num_classes: 2,
        use_regular_nms: false,
        scale_x: 10.0,
        scale_y: 10.0,
        scale_w: 5.0,
        scale_h: 5.0,
        anchors: Some(anchors),
    };

    let mut graph = Graph::new();
    let boxes = graph.add_input_layer(0, "box_encodings");
    let scores = graph.add_input_layer(1, "scores");
    let detection = graph.add_detection_post_process_layer(desc, DETECTION_LAYER_NAME);
    graph.set_output_info(boxes, 0, TensorInfo::quantized([1, 6, 4], DataType::QAsymmU8, 1.0, 1))?;
    graph.set_output_info(
        scores,
        0,
        TensorInfo::quantized([1, 6, 3], DataType::QAsymmU8, 0.009_999_999_78, 0),
    )?;
    graph.connect_layers(boxes, 0, detection, 0)?;
    graph.connect_layers(scores, 0, detection, 1)?;
    for (slot, name) in ["detection_boxes", "detection_classes", "detection_scores", "num_detections"]
        .into_iter()
        .enumerate()
    {
        let out = graph.add_output_layer(slot as i32, name);
        graph.connect_layers(detection, slot as u32, out, 0)?;
    }
    Ok(DetectionGraph { graph, detection })
}

use tessera::graph::{ActivationDescriptor, ActivationFunction, BinaryOperation};
use tessera::tensor::TensorShape;

pub fn activation(desc: &ActivationDescriptor, values: &mut [f32]) {
    let (a, b) = (desc.a, desc.b);
    let f: fn(f32, f32, f32) -> f32 = match desc.function {
        ActivationFunction::ReLu => |x, _, _| x.max(0.0),
        ActivationFunction::BoundedReLu => |x, a, b| x.max(b).min(a),
        ActivationFunction::Sigmoid => |x, _, _| 1.0 / (1.0 + (-x).exp()),
        ActivationFunction::TanH => |x, a, b| a * (b * x).tanh(),
        ActivationFunction::Linear => |x, a, b| a * x + b,
        ActivationFunction::LeakyReLu => |x, a, _| if x > 0.0 { x } else { a * x },
    };
    for value in values.iter_mut() {
        *value = f(*value, a, b);
    }
}

/// Maps an output element to the element of a right-aligned, broadcast operand.
fn broadcast_index(out_coord: &[usize], shape: &TensorShape) -> usize {
    let skip = out_coord.len() - shape.rank();
    let strides = shape.strides();
    out_coord[skip..]
        .iter()
        .enumerate()
        .map(|(axis, &c)| if shape.dim(axis) == 1 { 0 } else { c * strides[axis] })
        .sum()
}

pub fn elementwise_binary(
    operation: BinaryOperation,
    lhs: (&TensorShape, &[f32]),
    rhs: (&TensorShape, &[f32]),
    output: &TensorShape,
) -> Vec<f32> {
    let f: fn(f32, f32) -> f32 = match operation {
        BinaryOperation::Add => |x, y| x + y,
        BinaryOperation::Sub => |x, y| x - y,
        BinaryOperation::Mul => |x, y| x * y,
        BinaryOperation::Div => |x, y| x / y,
        BinaryOperation::Maximum => f32::max,
        BinaryOperation::Minimum => f32::min,
    };
    let dims = output.dims();
    let mut coord = vec![0usize; dims.len()];
    let mut out = Vec::with_capacity(output.num_elements());
    for _ in 0..output.num_elements() {
        let x = lhs.1[broadcast_index(&coord, lhs.0)];
        let y = rhs.1[broadcast_index(&coord, rhs.0)];
        out.push(f(x, y));
        for axis in (0..coord.len()).rev() {
            coord[axis] += 1;
            if coord[axis] < dims[axis] as usize {
                break;
            }
            coord[axis] = 0;
        }
    }
    out
}

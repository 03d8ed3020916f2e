//! Text dump of a graph for debugging and `--emit-ir`.

use std::fmt::Write;

use crate::graph::{Graph, Op};

fn attrs(op: &Op) -> String {
    match op {
        Op::Conv2d(a) | Op::DepthwiseConv2d(a) => format!(
            " stride={:?} dilation={:?} padding={:?} act={}",
            a.stride, a.dilation, a.padding, a.activation
        ),
        Op::MaxPool2d(a) | Op::AvgPool2d(a) => format!(
            " kernel={:?} stride={:?} padding={:?} act={}",
            a.kernel, a.stride, a.padding, a.activation
        ),
        Op::Add { activation }
        | Op::Sub { activation }
        | Op::Mul { activation }
        | Op::FullyConnected { activation } => format!(" act={activation}"),
        Op::Softmax { beta } => format!(" beta={beta}"),
        _ => String::new(),
    }
}

/// Renders the tensor table, nodes and graph interface as text.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();

    out.push_str("Tensors:\n");
    for (i, t) in graph.tensors.iter().enumerate() {
        let kind = if t.constant.is_some() { " const" } else { "" };
        let _ = writeln!(out, "  t{i} {}: {}{kind}", t.name, t.ty);
    }

    out.push_str("\nNodes:\n");
    for node in &graph.nodes {
        let ins: Vec<String> = node.inputs.iter().map(|t| t.to_string()).collect();
        let outs: Vec<String> = node.outputs.iter().map(|t| t.to_string()).collect();
        let _ = writeln!(
            out,
            "  {} {} = {}({}){}  ; {}",
            node.id,
            outs.join(", "),
            node.op,
            ins.join(", "),
            attrs(&node.op),
            node.name
        );
    }

    let join = |ids: &[crate::graph::TensorId]| {
        ids.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
    };
    let _ = writeln!(out, "\nInputs: {}", join(&graph.inputs));
    let _ = writeln!(out, "Outputs: {}", join(&graph.outputs));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::types::DType;

    #[test]
    fn dump_contains_sections() {
        let mut b = GraphBuilder::new();
        let x = b.input("ifm", [1, 4], DType::Float32);
        let y = b.tanh(x).unwrap();
        b.output(y);
        let text = dump_graph(&b.finish().unwrap());
        assert!(text.contains("Tensors:"));
        assert!(text.contains("t0 ifm: float32[1, 4]"));
        assert!(text.contains("n0 t1 = TANH(t0)"));
        assert!(text.contains("Inputs: t0"));
        assert!(text.contains("Outputs: t1"));
    }
}

//! Graphviz rendering shared by the tape and the reference counted terms.

use crate::op::Op;
use std::io::Write;

pub(crate) struct DotNode {
    pub id: usize,
    pub name: String,
    pub data: f64,
    pub grad: f64,
    pub op: Op,
    pub operands: Vec<usize>,
}

/// Write graphviz dot file to the given writer. Every non-leaf node gets an
/// extra operation vertex between its operands and itself.
pub(crate) fn write_dot(writer: &mut impl Write, nodes: &[DotNode]) -> std::io::Result<()> {
    writeln!(writer, "digraph G {{\nrankdir=\"LR\";")?;
    for node in nodes {
        writeln!(
            writer,
            "a{} [label=\"{} \\ndata:{}, grad:{}\", shape=box];",
            node.id, node.name, node.data, node.grad
        )?;
        if node.op != Op::Leaf {
            writeln!(writer, "a{}_op [label=\"{}\"];", node.id, node.op.symbol())?;
            writeln!(writer, "a{}_op -> a{};", node.id, node.id)?;
        }
    }
    for node in nodes {
        for pid in &node.operands {
            writeln!(writer, "a{} -> a{}_op;", pid, node.id)?;
        }
    }
    writeln!(writer, "}}")?;
    Ok(())
}

#[test]
fn test_write_dot() {
    let nodes = [
        DotNode {
            id: 0,
            name: "a".to_string(),
            data: 2.,
            grad: 1.,
            op: Op::Leaf,
            operands: vec![],
        },
        DotNode {
            id: 1,
            name: "b".to_string(),
            data: 4.,
            grad: 1.,
            op: Op::Add,
            operands: vec![0, 0],
        },
    ];
    let mut buf = vec![];
    write_dot(&mut buf, &nodes).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.starts_with("digraph G {"));
    assert!(text.contains("a1_op [label=\"+\"];"));
    assert_eq!(text.matches("a0 -> a1_op;").count(), 2);
    assert!(!text.contains("a0_op"));
    assert!(text.trim_end().ends_with('}'));
}

//! Implementation of shared memory arena for the terms, aka a tape.
//! See https://rufflewind.com/2016-12-30/reverse-mode-automatic-differentiation
//!
//! Every node lives in one `Vec` owned by the [`Tape`] and is addressed by its
//! index. An operation only ever appends a node referring to indices that are
//! already on the tape, so operands always have smaller indices than their
//! results and the graph cannot contain a cycle.

use crate::{
    dot::{write_dot, DotNode},
    op::{Expr, Op},
    Result,
};
use std::{cell::RefCell, fmt::Display, io::Write};

/// Arena owning every node of a graph. Terms from different tapes cannot be
/// combined; doing so panics.
#[derive(Default, Debug)]
pub struct Tape {
    nodes: RefCell<Vec<TapeNode>>,
}

#[derive(Clone, Debug)]
struct TapeNode {
    name: String,
    value: Expr<u32>,
    data: f64,
    grad: f64,
}

/// A handle to a node on a [`Tape`]. It is `Copy`, so it can be used in
/// several expressions without cloning.
#[derive(Copy, Clone)]
pub struct TapeTerm<'a> {
    tape: &'a Tape,
    idx: u32,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a leaf with the given value, e.g. an input or a parameter.
    pub fn term<'a>(&'a self, name: impl Into<String>, init: f64) -> TapeTerm<'a> {
        let mut nodes = self.nodes.borrow_mut();
        let idx = push_node(&mut nodes, name.into(), Expr::Leaf, init);
        TapeTerm { tape: self, idx }
    }

    /// Leaf promoted from a bare literal operand.
    fn constant(&self, value: f64) -> TapeTerm {
        self.term(value.to_string(), value)
    }

    fn term0(&self, value: Expr<u32>) -> TapeTerm {
        let mut nodes = self.nodes.borrow_mut();
        let data = value.eval(|&i| nodes[i as usize].data);
        let name = node_name(&nodes, &value);
        let idx = push_node(&mut nodes, name, value, data);
        TapeTerm { tape: self, idx }
    }

    /// Number of nodes recorded so far, including promoted literals.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Reset the gradient of every node on the tape.
    pub fn zero_grad(&self) {
        for node in self.nodes.borrow_mut().iter_mut() {
            node.grad = 0.;
        }
    }
}

fn push_node(nodes: &mut Vec<TapeNode>, name: String, value: Expr<u32>, data: f64) -> u32 {
    let idx = nodes.len();
    nodes.push(TapeNode {
        name,
        value,
        data,
        grad: 0.,
    });
    idx as u32
}

#[cfg(feature = "expr_name")]
fn node_name(nodes: &[TapeNode], value: &Expr<u32>) -> String {
    value.describe(|&i| nodes[i as usize].name.clone())
}

#[cfg(not(feature = "expr_name"))]
fn node_name(nodes: &[TapeNode], _value: &Expr<u32>) -> String {
    format!("a{}", nodes.len())
}

impl<'a> std::ops::Add for TapeTerm<'a> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        self.binary(rhs, Expr::Add)
    }
}

impl<'a> std::ops::Add<f64> for TapeTerm<'a> {
    type Output = Self;
    fn add(self, rhs: f64) -> Self::Output {
        self + self.tape.constant(rhs)
    }
}

impl<'a> std::ops::Add<TapeTerm<'a>> for f64 {
    type Output = TapeTerm<'a>;
    fn add(self, rhs: TapeTerm<'a>) -> Self::Output {
        rhs.tape.constant(self) + rhs
    }
}

impl<'a> std::ops::Sub for TapeTerm<'a> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        self + (-rhs)
    }
}

impl<'a> std::ops::Sub<f64> for TapeTerm<'a> {
    type Output = Self;
    fn sub(self, rhs: f64) -> Self::Output {
        self + (-rhs)
    }
}

impl<'a> std::ops::Sub<TapeTerm<'a>> for f64 {
    type Output = TapeTerm<'a>;
    fn sub(self, rhs: TapeTerm<'a>) -> Self::Output {
        rhs.tape.constant(self) - rhs
    }
}

impl<'a> std::ops::Mul for TapeTerm<'a> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        self.binary(rhs, Expr::Mul)
    }
}

impl<'a> std::ops::Mul<f64> for TapeTerm<'a> {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self::Output {
        self * self.tape.constant(rhs)
    }
}

impl<'a> std::ops::Mul<TapeTerm<'a>> for f64 {
    type Output = TapeTerm<'a>;
    fn mul(self, rhs: TapeTerm<'a>) -> Self::Output {
        rhs.tape.constant(self) * rhs
    }
}

impl<'a> std::ops::Div for TapeTerm<'a> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        self * rhs.powf(-1.)
    }
}

impl<'a> std::ops::Div<f64> for TapeTerm<'a> {
    type Output = Self;
    fn div(self, rhs: f64) -> Self::Output {
        self * rhs.powf(-1.)
    }
}

impl<'a> std::ops::Div<TapeTerm<'a>> for f64 {
    type Output = TapeTerm<'a>;
    fn div(self, rhs: TapeTerm<'a>) -> Self::Output {
        rhs.tape.constant(self) / rhs
    }
}

impl<'a> std::ops::Neg for TapeTerm<'a> {
    type Output = Self;
    fn neg(self) -> Self::Output {
        self * -1.
    }
}

impl<'a> TapeTerm<'a> {
    fn binary(self, rhs: Self, f: fn(u32, u32) -> Expr<u32>) -> Self {
        assert!(
            std::ptr::eq(self.tape, rhs.tape),
            "Terms from different tapes cannot be combined"
        );
        self.tape.term0(f(self.idx, rhs.idx))
    }

    /// Raise to a constant power. Every `f64` is accepted: NaN and infinite
    /// exponents propagate under IEEE rules like any other numeric value.
    /// Only an exponent that is not a number at all is an
    /// [`Error::InvalidArgument`](crate::Error::InvalidArgument), and taking
    /// `f64` rules that out at compile time, so this currently never fails.
    pub fn pow(self, exp: f64) -> Result<Self> {
        Ok(self.powf(exp))
    }

    fn powf(self, exp: f64) -> Self {
        self.tape.term0(Expr::Pow(self.idx, exp))
    }

    pub fn exp(self) -> Self {
        self.tape.term0(Expr::Exp(self.idx))
    }

    pub fn tanh(self) -> Self {
        self.tape.term0(Expr::Tanh(self.idx))
    }

    pub fn data(&self) -> f64 {
        self.tape.nodes.borrow()[self.idx as usize].data
    }

    pub fn grad(&self) -> f64 {
        self.tape.nodes.borrow()[self.idx as usize].grad
    }

    pub fn name(&self) -> String {
        self.tape.nodes.borrow()[self.idx as usize].name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.tape.nodes.borrow_mut()[self.idx as usize].name = name.into();
    }

    pub fn op(&self) -> Op {
        self.tape.nodes.borrow()[self.idx as usize].value.op()
    }

    /// The terms this one was computed from, in operation order.
    pub fn operands(&self) -> Vec<TapeTerm<'a>> {
        let nodes = self.tape.nodes.borrow();
        let operands = nodes[self.idx as usize]
            .value
            .operands()
            .map(|&idx| TapeTerm {
                tape: self.tape,
                idx,
            })
            .collect();
        operands
    }

    /// Every term reachable from this one, each term after all of its
    /// operands. This term comes last.
    pub fn topo_order(&self) -> Vec<TapeTerm<'a>> {
        let nodes = self.tape.nodes.borrow();
        topo_order(&nodes, self.idx)
            .into_iter()
            .map(|idx| TapeTerm {
                tape: self.tape,
                idx,
            })
            .collect()
    }

    /// Reverse-mode differentiation rooted at this term. The seed gradient is
    /// forced to 1 and contributions are added onto whatever gradients the
    /// nodes already hold, so a second call accumulates. Use
    /// [`TapeTerm::zero_grad`] or [`Tape::zero_grad`] in between to start
    /// fresh.
    pub fn backward(&self) {
        let mut nodes = self.tape.nodes.borrow_mut();
        let order = topo_order(&nodes, self.idx);
        log::debug!(
            "backward from {} over {} nodes",
            nodes[self.idx as usize].name,
            order.len()
        );
        nodes[self.idx as usize].grad = 1.;
        let mut poisoned = false;
        for &idx in order.iter().rev() {
            let node = &nodes[idx as usize];
            let (value, data, grad) = (node.value, node.data, node.grad);
            log::trace!("propagate {} ({}): grad {grad}", node.name, value.op());
            let contributions = value.backward(data, grad, |&i| nodes[i as usize].data);
            for (&operand, contribution) in contributions.into_iter().flatten() {
                poisoned |= !contribution.is_finite();
                nodes[operand as usize].grad += contribution;
            }
        }
        if poisoned {
            log::warn!(
                "backward from {} produced non-finite gradients",
                nodes[self.idx as usize].name
            );
        }
    }

    /// Reset the gradient of this term and everything it depends on.
    pub fn zero_grad(&self) {
        let mut nodes = self.tape.nodes.borrow_mut();
        for idx in topo_order(&nodes, self.idx) {
            nodes[idx as usize].grad = 0.;
        }
    }

    /// Write graphviz dot file of the graph rooted at this term.
    pub fn dot(&self, writer: &mut impl Write) -> std::io::Result<()> {
        let nodes = self.tape.nodes.borrow();
        let dot_nodes: Vec<_> = topo_order(&nodes, self.idx)
            .into_iter()
            .map(|idx| {
                let node = &nodes[idx as usize];
                DotNode {
                    id: idx as usize,
                    name: node.name.clone(),
                    data: node.data,
                    grad: node.grad,
                    op: node.value.op(),
                    operands: node.value.operands().map(|&i| i as usize).collect(),
                }
            })
            .collect();
        write_dot(writer, &dot_nodes)
    }
}

/// Depth-first post-order from `root`: operands are appended before the node
/// that consumes them, and a node shared by several consumers only once. An
/// explicit stack replaces recursion so long chains cannot overflow, while
/// producing the same order as the recursive walk.
fn topo_order(nodes: &[TapeNode], root: u32) -> Vec<u32> {
    let mut visited = vec![false; root as usize + 1];
    let mut order = vec![];
    let mut stack = vec![(root, false)];
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            order.push(idx);
            continue;
        }
        if visited[idx as usize] {
            continue;
        }
        visited[idx as usize] = true;
        stack.push((idx, true));
        for &operand in nodes[idx as usize].value.operands().rev() {
            if !visited[operand as usize] {
                stack.push((operand, false));
            }
        }
    }
    order
}

impl<'a> Display for TapeTerm<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.tape.nodes.borrow();
        let node = &nodes[self.idx as usize];
        write!(f, "Value(data={:?}, grad={:?})", node.data, node.grad)
    }
}

impl<'a> std::fmt::Debug for TapeTerm<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.tape.nodes.borrow();
        let node = &nodes[self.idx as usize];
        f.debug_struct("TapeTerm")
            .field("idx", &self.idx)
            .field("name", &node.name)
            .field("data", &node.data)
            .field("grad", &node.grad)
            .finish()
    }
}

#[test]
fn test_topo_order_post_order() {
    let tape = Tape::new();
    let a = tape.term("a", 1.);
    let b = tape.term("b", 2.);
    let ab = a * b;
    let c = ab + a;
    let order: Vec<u32> = c.topo_order().iter().map(|t| t.idx).collect();
    assert_eq!(order, vec![a.idx, b.idx, ab.idx, c.idx]);
}

#[test]
fn test_topo_order_skips_unreachable() {
    let tape = Tape::new();
    let a = tape.term("a", 1.);
    let _unused = tape.term("unused", 5.);
    let b = a.exp();
    assert_eq!(b.topo_order().len(), 2);
    assert_eq!(tape.len(), 3);
}

#[cfg(not(feature = "expr_name"))]
#[test]
fn test_topo_order_deep_chain() {
    let tape = Tape::new();
    let mut x = tape.term("x", 0.5);
    for _ in 0..200_000 {
        x = x + 0.;
    }
    assert_eq!(x.topo_order().len(), 400_001);
    x.backward();
}

#[test]
fn test_operands_point_backwards() {
    let tape = Tape::new();
    let a = tape.term("a", 3.);
    let b = a * a + a.tanh();
    let nodes = tape.nodes.borrow();
    for (idx, node) in nodes.iter().enumerate() {
        assert!(node.value.operands().all(|&i| (i as usize) < idx));
    }
    drop(nodes);
    assert_eq!(b.op(), Op::Add);
}

#[test]
#[should_panic(expected = "Terms from different tapes cannot be combined")]
fn test_mixing_tapes_panics() {
    let tape1 = Tape::new();
    let tape2 = Tape::new();
    let a = tape1.term("a", 1.);
    let b = tape2.term("b", 2.);
    let _ = a * b;
}

#[test]
fn test_tape_zero_grad() {
    let tape = Tape::new();
    let a = tape.term("a", 3.);
    let b = tape.term("b", 4.);
    let c = a * b;
    c.backward();
    assert_eq!(a.grad(), 4.);
    tape.zero_grad();
    assert_eq!(a.grad(), 0.);
    assert_eq!(c.grad(), 0.);
}

#[cfg(not(feature = "expr_name"))]
#[test]
fn test_positional_names() {
    let tape = Tape::new();
    let a = tape.term("a", 3.);
    let b = a * 2.;
    assert_eq!(a.name(), "a");
    assert_eq!(b.operands()[1].name(), "2");
    assert_eq!(b.name(), "a2");
}

#[cfg(feature = "expr_name")]
#[test]
fn test_expression_names() {
    let tape = Tape::new();
    let a = tape.term("a", 3.);
    let b = tape.term("b", 1.);
    let c = (a + b).tanh();
    assert_eq!(c.name(), "tanh((a + b))");
}

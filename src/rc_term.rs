use crate::{
    dot::{write_dot, DotNode},
    op::{Expr, Op},
    Result,
};
use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt::Display,
    io::Write,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

#[derive(Debug)]
struct TermPayload {
    name: RefCell<String>,
    value: Expr<RcTerm>,
    data: f64,
    grad: Cell<f64>,
}

impl TermPayload {
    fn new(name: String, value: Expr<RcTerm>) -> TermPayload {
        let data = value.eval(RcTerm::data);
        Self {
            name: RefCell::new(name),
            value,
            data,
            grad: Cell::new(0.),
        }
    }

    fn take_operands(&mut self) -> impl Iterator<Item = RcTerm> {
        std::mem::replace(&mut self.value, Expr::Leaf).into_operands()
    }
}

/// Operands whose last handle is released here are unlinked onto a work list
/// instead of dropping recursively, so a long chain cannot overflow the stack.
impl Drop for TermPayload {
    fn drop(&mut self) {
        let mut pending: Vec<RcTerm> = self.take_operands().collect();
        while let Some(term) = pending.pop() {
            if let Ok(mut payload) = Rc::try_unwrap(term.0) {
                pending.extend(payload.take_operands());
            }
        }
    }
}

/// A node held by reference counted handles. Operands are shared, never
/// owned exclusively, and a node stays alive as long as any term computed
/// from it does.
#[derive(Clone, Debug)]
pub struct RcTerm(Rc<TermPayload>);

/// Each operator is written once over borrowed terms, plus its form with a
/// literal on the right. Owned operands and literals on the left forward to
/// those, so intermediate results chain without references to temporaries.
macro_rules! impl_ops {
    ($($trait:ident, $method:ident: |$a:ident, $b:ident| $term:expr, |$x:ident, $c:ident| $lit:expr;)*) => {$(
        impl $trait<&RcTerm> for &RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: &RcTerm) -> Self::Output {
                let ($a, $b) = (self, rhs);
                $term
            }
        }

        impl $trait<f64> for &RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: f64) -> Self::Output {
                let ($x, $c) = (self, rhs);
                $lit
            }
        }

        impl $trait<&RcTerm> for f64 {
            type Output = RcTerm;
            fn $method(self, rhs: &RcTerm) -> Self::Output {
                $trait::$method(&RcTerm::constant(self), rhs)
            }
        }

        impl $trait<RcTerm> for RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: RcTerm) -> Self::Output {
                $trait::$method(&self, &rhs)
            }
        }

        impl $trait<&RcTerm> for RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: &RcTerm) -> Self::Output {
                $trait::$method(&self, rhs)
            }
        }

        impl $trait<RcTerm> for &RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: RcTerm) -> Self::Output {
                $trait::$method(self, &rhs)
            }
        }

        impl $trait<f64> for RcTerm {
            type Output = RcTerm;
            fn $method(self, rhs: f64) -> Self::Output {
                $trait::$method(&self, rhs)
            }
        }

        impl $trait<RcTerm> for f64 {
            type Output = RcTerm;
            fn $method(self, rhs: RcTerm) -> Self::Output {
                $trait::$method(self, &rhs)
            }
        }
    )*};
}

impl_ops! {
    Add, add: |a, b| RcTerm::compute(Expr::Add(a.clone(), b.clone())),
        |a, c| a + &RcTerm::constant(c);
    Sub, sub: |a, b| a + &(-b), |a, c| a + (-c);
    Mul, mul: |a, b| RcTerm::compute(Expr::Mul(a.clone(), b.clone())),
        |a, c| a * &RcTerm::constant(c);
    Div, div: |a, b| a * &b.powf(-1.), |a, c| a * c.powf(-1.);
}

impl Neg for &RcTerm {
    type Output = RcTerm;
    fn neg(self) -> Self::Output {
        self * -1.
    }
}

impl Neg for RcTerm {
    type Output = RcTerm;
    fn neg(self) -> Self::Output {
        -&self
    }
}

impl RcTerm {
    pub fn new(name: impl Into<String>, val: f64) -> RcTerm {
        Self::new_payload(TermPayload {
            name: RefCell::new(name.into()),
            value: Expr::Leaf,
            data: val,
            grad: Cell::new(0.),
        })
    }

    /// Leaf promoted from a bare literal operand.
    fn constant(val: f64) -> RcTerm {
        Self::new(val.to_string(), val)
    }

    fn compute(value: Expr<RcTerm>) -> RcTerm {
        Self::new_payload(TermPayload::new(term_name(&value), value))
    }

    fn new_payload(val: TermPayload) -> Self {
        Self(Rc::new(val))
    }

    pub fn data(&self) -> f64 {
        self.0.data
    }

    pub fn grad(&self) -> f64 {
        self.0.grad.get()
    }

    pub fn name(&self) -> String {
        self.0.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.borrow_mut() = name.into();
    }

    pub fn op(&self) -> Op {
        self.0.value.op()
    }

    /// The terms this one was computed from, in operation order.
    pub fn operands(&self) -> Vec<RcTerm> {
        self.0.value.operands().cloned().collect()
    }

    /// Whether both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn id(&self) -> usize {
        let payload = &*self.0;
        payload as *const _ as usize
    }

    /// Raise to a constant power. Every `f64` is accepted: NaN and infinite
    /// exponents propagate under IEEE rules like any other numeric value.
    /// Only an exponent that is not a number at all is an
    /// [`Error::InvalidArgument`](crate::Error::InvalidArgument), and taking
    /// `f64` rules that out at compile time, so this currently never fails.
    pub fn pow(&self, exp: f64) -> Result<Self> {
        Ok(self.powf(exp))
    }

    fn powf(&self, exp: f64) -> Self {
        Self::compute(Expr::Pow(self.clone(), exp))
    }

    pub fn exp(&self) -> Self {
        Self::compute(Expr::Exp(self.clone()))
    }

    pub fn tanh(&self) -> Self {
        Self::compute(Expr::Tanh(self.clone()))
    }

    /// Every term reachable from this one, each after all of its operands,
    /// ending with this term. Shared terms appear once.
    pub fn topo_order(&self) -> Vec<RcTerm> {
        let mut visited = HashSet::new();
        let mut order = vec![];
        let mut stack = vec![(self.clone(), false)];
        while let Some((term, expanded)) = stack.pop() {
            if expanded {
                order.push(term);
                continue;
            }
            if !visited.insert(term.id()) {
                continue;
            }
            let operands: Vec<_> = term.0.value.operands().rev().cloned().collect();
            stack.push((term, true));
            for operand in operands {
                if !visited.contains(&operand.id()) {
                    stack.push((operand, false));
                }
            }
        }
        order
    }

    /// The entry point to backpropagation. Gradients accumulate across calls;
    /// call [`RcTerm::zero_grad`] first for a fresh computation.
    pub fn backward(&self) {
        let order = self.topo_order();
        log::debug!(
            "backward from {} over {} nodes",
            self.0.name.borrow(),
            order.len()
        );
        self.0.grad.set(1.);
        let mut poisoned = false;
        for term in order.iter().rev() {
            let payload = &*term.0;
            let grad = payload.grad.get();
            log::trace!(
                "propagate {} ({}): grad {grad}",
                payload.name.borrow(),
                payload.value.op()
            );
            let contributions = payload.value.backward(payload.data, grad, RcTerm::data);
            for (operand, contribution) in contributions.into_iter().flatten() {
                poisoned |= !contribution.is_finite();
                operand.0.grad.set(operand.0.grad.get() + contribution);
            }
        }
        if poisoned {
            log::warn!(
                "backward from {} produced non-finite gradients",
                self.0.name.borrow()
            );
        }
    }

    /// Reset the gradient of this term and everything it depends on.
    pub fn zero_grad(&self) {
        for term in self.topo_order() {
            term.0.grad.set(0.);
        }
    }

    /// Write graphviz dot file to the given writer.
    pub fn dot(&self, writer: &mut impl Write) -> std::io::Result<()> {
        let nodes: Vec<_> = self
            .topo_order()
            .iter()
            .map(|term| DotNode {
                id: term.id(),
                name: term.name(),
                data: term.data(),
                grad: term.grad(),
                op: term.op(),
                operands: term.0.value.operands().map(RcTerm::id).collect(),
            })
            .collect();
        write_dot(writer, &nodes)
    }
}

#[cfg(feature = "expr_name")]
fn term_name(value: &Expr<RcTerm>) -> String {
    value.describe(RcTerm::name)
}

#[cfg(not(feature = "expr_name"))]
fn term_name(_value: &Expr<RcTerm>) -> String {
    String::new()
}

impl Display for RcTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value(data={:?}, grad={:?})", self.data(), self.grad())
    }
}

#[test]
fn test_rc_topo_order() {
    let a = RcTerm::new("a", 1.);
    let b = RcTerm::new("b", 2.);
    let ab = &a * &b;
    let c = &ab + &a;
    let order = c.topo_order();
    assert_eq!(order.len(), 4);
    assert!(order[0].ptr_eq(&a));
    assert!(order[1].ptr_eq(&b));
    assert!(order[2].ptr_eq(&ab));
    assert!(order[3].ptr_eq(&c));
}

#[cfg(not(feature = "expr_name"))]
#[test]
fn test_rc_deep_chain() {
    let mut x = RcTerm::new("x", 0.5);
    for _ in 0..200_000 {
        x = &x + 0.;
    }
    assert_eq!(x.topo_order().len(), 400_001);
    x.backward();
    drop(x);
}

#[test]
fn test_rc_drop_keeps_shared_operands() {
    let a = RcTerm::new("a", 2.);
    let b = &a * 3.;
    let c = (&b + &a).tanh();
    drop(c);
    // `b` is still held here, so its operands survive the drop of `c`.
    assert_eq!(b.operands().len(), 2);
    assert!(b.operands()[0].ptr_eq(&a));
    assert_eq!(b.data(), 6.);
}

#[test]
fn test_rc_shared_operand_lifetime() {
    let out = {
        let a = RcTerm::new("a", 3.);
        &a * &a
    };
    // `a` went out of scope but the product still holds it.
    assert_eq!(out.data(), 9.);
    out.backward();
    assert_eq!(out.operands()[0].grad(), 6.);
}

#[test]
fn test_rc_display() {
    let a = RcTerm::new("a", 2.);
    assert_eq!(a.to_string(), "Value(data=2.0, grad=0.0)");
}

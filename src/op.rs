//! The operation table shared by every graph representation.
//!
//! A node is stored as an [`Expr`] over some operand reference type `R`
//! (a tape index or a shared handle). Forward values and local gradient rules
//! are dispatched from the variant, so no node carries a closure.

use std::fmt::Display;

/// Tag identifying which rule produced a node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    Leaf,
    Add,
    Mul,
    /// Power by a constant exponent.
    Pow(f64),
    Exp,
    Tanh,
}

impl Op {
    /// Short symbol used in graph renderings.
    pub fn symbol(&self) -> String {
        match self {
            Self::Leaf => String::new(),
            Self::Add => "+".to_string(),
            Self::Mul => "*".to_string(),
            Self::Pow(exp) => format!("**{exp}"),
            Self::Exp => "exp".to_string(),
            Self::Tanh => "tanh".to_string(),
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf => write!(f, "leaf"),
            _ => write!(f, "{}", self.symbol()),
        }
    }
}

/// At most one contribution per operand slot, in operand order.
pub(crate) type Contributions<'a, R> = [Option<(&'a R, f64)>; 2];

#[derive(Clone, Copy, Debug)]
pub(crate) enum Expr<R> {
    Leaf,
    Add(R, R),
    Mul(R, R),
    Pow(R, f64),
    Exp(R),
    Tanh(R),
}

impl<R> Expr<R> {
    pub(crate) fn op(&self) -> Op {
        match self {
            Self::Leaf => Op::Leaf,
            Self::Add(..) => Op::Add,
            Self::Mul(..) => Op::Mul,
            Self::Pow(_, exp) => Op::Pow(*exp),
            Self::Exp(_) => Op::Exp,
            Self::Tanh(_) => Op::Tanh,
        }
    }

    /// Operands in the order the operation received them. The same reference
    /// is yielded twice when a node consumes one operand on both sides.
    pub(crate) fn operands(&self) -> impl DoubleEndedIterator<Item = &R> {
        let pair = match self {
            Self::Leaf => [None, None],
            Self::Add(lhs, rhs) | Self::Mul(lhs, rhs) => [Some(lhs), Some(rhs)],
            Self::Pow(term, _) | Self::Exp(term) | Self::Tanh(term) => [Some(term), None],
        };
        pair.into_iter().flatten()
    }

    /// Consumes the node, yielding its operands in operation order.
    pub(crate) fn into_operands(self) -> impl Iterator<Item = R> {
        let pair = match self {
            Self::Leaf => [None, None],
            Self::Add(lhs, rhs) | Self::Mul(lhs, rhs) => [Some(lhs), Some(rhs)],
            Self::Pow(term, _) | Self::Exp(term) | Self::Tanh(term) => [Some(term), None],
        };
        pair.into_iter().flatten()
    }

    /// Forward value of a non-leaf node. Leaves carry their own literal and
    /// are never evaluated through here.
    pub(crate) fn eval(&self, data: impl Fn(&R) -> f64) -> f64 {
        match self {
            Self::Leaf => 0.,
            Self::Add(lhs, rhs) => data(lhs) + data(rhs),
            Self::Mul(lhs, rhs) => data(lhs) * data(rhs),
            Self::Pow(term, exp) => data(term).powf(*exp),
            Self::Exp(term) => data(term).exp(),
            Self::Tanh(term) => data(term).tanh(),
        }
    }

    /// Gradient contributions this node pushes into its operands, given its
    /// own forward value and its fully accumulated gradient. Callers must add
    /// each contribution onto the operand's gradient, never assign it.
    pub(crate) fn backward(
        &self,
        out_data: f64,
        out_grad: f64,
        data: impl Fn(&R) -> f64,
    ) -> Contributions<'_, R> {
        match self {
            Self::Leaf => [None, None],
            Self::Add(lhs, rhs) => [Some((lhs, out_grad)), Some((rhs, out_grad))],
            Self::Mul(lhs, rhs) => [
                Some((lhs, data(rhs) * out_grad)),
                Some((rhs, data(lhs) * out_grad)),
            ],
            Self::Pow(term, exp) => [
                Some((term, exp * data(term).powf(exp - 1.) * out_grad)),
                None,
            ],
            Self::Exp(term) => [Some((term, out_data * out_grad)), None],
            Self::Tanh(term) => [Some((term, (1. - out_data.powi(2)) * out_grad)), None],
        }
    }

    /// Human readable expression, used to name intermediate nodes when the
    /// `expr_name` feature is enabled.
    #[cfg_attr(not(feature = "expr_name"), allow(dead_code))]
    pub(crate) fn describe(&self, name: impl Fn(&R) -> String) -> String {
        match self {
            Self::Leaf => String::new(),
            Self::Add(lhs, rhs) => format!("({} + {})", name(lhs), name(rhs)),
            Self::Mul(lhs, rhs) => format!("{} * {}", name(lhs), name(rhs)),
            Self::Pow(term, exp) => format!("{}**{exp}", name(term)),
            Self::Exp(term) => format!("exp({})", name(term)),
            Self::Tanh(term) => format!("tanh({})", name(term)),
        }
    }
}

#[test]
fn test_local_rules() {
    let data = |x: &f64| *x;
    let grads = |expr: Expr<f64>, out: f64| -> Vec<f64> {
        expr.backward(out, 1., data)
            .into_iter()
            .flatten()
            .map(|(_, g)| g)
            .collect()
    };
    assert_eq!(grads(Expr::Add(2., 3.), 5.), vec![1., 1.]);
    assert_eq!(grads(Expr::Mul(2., 3.), 6.), vec![3., 2.]);
    assert_eq!(grads(Expr::Pow(2., 3.), 8.), vec![12.]);
    assert_eq!(grads(Expr::Exp(0.), 1.), vec![1.]);
    assert_eq!(grads(Expr::Tanh(0.), 0.), vec![1.]);
    assert!(grads(Expr::<f64>::Leaf, 1.).is_empty());
}

#[test]
fn test_pow_non_finite_exponent() {
    let data = |x: &f64| *x;
    assert_eq!(Expr::Pow(0.5, f64::INFINITY).eval(data), 0.);
    assert!(Expr::Pow(2., f64::NAN).eval(data).is_nan());
    let grads: Vec<f64> = Expr::Pow(2., f64::INFINITY)
        .backward(f64::INFINITY, 1., data)
        .into_iter()
        .flatten()
        .map(|(_, g)| g)
        .collect();
    assert_eq!(grads, vec![f64::INFINITY]);
}

#[test]
fn test_backward_scales_by_upstream() {
    let expr = Expr::Mul(4., -0.5);
    let grads: Vec<f64> = expr
        .backward(-2., 3., |x| *x)
        .into_iter()
        .flatten()
        .map(|(_, g)| g)
        .collect();
    assert_eq!(grads, vec![-1.5, 12.]);
}

#[test]
fn test_operands_order() {
    let expr = Expr::Add(1u32, 0u32);
    assert_eq!(expr.operands().copied().collect::<Vec<_>>(), vec![1, 0]);
    assert_eq!(expr.operands().rev().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(Expr::Tanh(7u32).operands().count(), 1);
}

use approx::{assert_abs_diff_eq, assert_relative_eq};
use tapegrad::{Error, RcTerm, Tape, TapeTerm};

fn chain(tape: &Tape, a: f64, b: f64, c: f64) -> [TapeTerm<'_>; 4] {
    let a = tape.term("a", a);
    let b = tape.term("b", b);
    let c = tape.term("c", c);
    let o = (a * b + c).tanh();
    [a, b, c, o]
}

#[test]
fn chain_rule_matches_finite_differences() {
    let inputs = [0.7, -1.3, 0.4];
    let tape = Tape::new();
    let [a, b, c, o] = chain(&tape, inputs[0], inputs[1], inputs[2]);
    o.backward();
    let grads = [a.grad(), b.grad(), c.grad()];

    let h = 1e-6;
    for i in 0..3 {
        let mut plus = inputs;
        let mut minus = inputs;
        plus[i] += h;
        minus[i] -= h;
        let f_plus = chain(&Tape::new(), plus[0], plus[1], plus[2])[3].data();
        let f_minus = chain(&Tape::new(), minus[0], minus[1], minus[2])[3].data();
        let numerical = (f_plus - f_minus) / (2. * h);
        assert_abs_diff_eq!(grads[i], numerical, epsilon = 1e-8);
    }

    // Exact chain rule
    let local = 1. - o.data() * o.data();
    assert_relative_eq!(a.grad(), inputs[1] * local, max_relative = 1e-12);
    assert_relative_eq!(b.grad(), inputs[0] * local, max_relative = 1e-12);
    assert_relative_eq!(c.grad(), local, max_relative = 1e-12);
}

#[test]
fn diamond_accumulates() {
    let tape = Tape::new();
    let a = tape.term("a", 3.);
    let b = a + a;
    let c = b * 2.;
    c.backward();
    assert_eq!(b.grad(), 2.);
    assert_eq!(a.grad(), 4.);
}

#[test]
fn rc_diamond_accumulates() {
    let a = RcTerm::new("a", 3.);
    let b = &a + &a;
    let c = &b * 2.;
    c.backward();
    assert_eq!(a.grad(), 4.);
}

#[test]
fn three_paths_sum() -> Result<(), Error> {
    let x = 1.5f64;
    let tape = Tape::new();
    let leaf = tape.term("x", x);
    let p1 = leaf * 3.;
    let p2 = leaf.pow(2.)?;
    let p3 = leaf.exp();
    let out = p1 + p2 + p3;
    out.backward();
    assert_relative_eq!(leaf.grad(), 3. + 2. * x + x.exp(), max_relative = 1e-12);
    Ok(())
}

#[test]
fn shared_intermediate_is_complete_before_it_fires() {
    // s feeds three consumers, one of which also feeds another.
    let tape = Tape::new();
    let x = tape.term("x", 0.5);
    let s = x.tanh();
    let u = s * s;
    let v = s.exp();
    let w = u * v + s;
    w.backward();

    let sv = s.data();
    // w = s^2 e^s + s
    let dw_ds = 2. * sv * sv.exp() + sv * sv * sv.exp() + 1.;
    assert_relative_eq!(s.grad(), dw_ds, max_relative = 1e-12);
    assert_relative_eq!(x.grad(), dw_ds * (1. - sv * sv), max_relative = 1e-12);
}

#[test]
fn neuron() {
    let tape = Tape::new();
    let x1 = tape.term("x1", 2.0);
    let x2 = tape.term("x2", 0.0);
    let w1 = tape.term("w1", -3.0);
    let w2 = tape.term("w2", 1.0);
    let b = tape.term("b", 6.8813735870195432);
    let n = x1 * w1 + x2 * w2 + b;
    let o = n.tanh();
    o.backward();

    assert_eq!(o.grad(), 1.);
    assert_abs_diff_eq!(o.data(), 0.5f64.sqrt(), epsilon = 1e-9);
    let local = 1. - o.data().powi(2);
    assert_abs_diff_eq!(n.grad(), 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(x1.grad(), w1.data() * local, epsilon = 1e-9);
    assert_abs_diff_eq!(x1.grad(), -1.5, epsilon = 1e-9);
    assert_abs_diff_eq!(w1.grad(), 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(x2.grad(), 0.5, epsilon = 1e-9);
    assert_eq!(w2.grad(), 0.);
    assert_abs_diff_eq!(b.grad(), 0.5, epsilon = 1e-9);
}

#[test]
fn leaf_backward_seeds_one() {
    let tape = Tape::new();
    let a = tape.term("a", 42.);
    a.backward();
    assert_eq!(a.grad(), 1.);
    a.backward();
    assert_eq!(a.grad(), 1.);

    let r = RcTerm::new("r", 1.);
    r.backward();
    assert_eq!(r.grad(), 1.);
}

#[test]
fn repeated_backward_accumulates() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = tape.term("b", 3.);
    let c = a * b;
    c.backward();
    c.backward();
    assert_eq!(c.grad(), 1.);
    assert_eq!(a.grad(), 6.);
    assert_eq!(b.grad(), 4.);
}

#[test]
fn repeated_backward_compounds_through_intermediates() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = tape.term("b", 3.);
    let n = a + b;
    let o = n * 2.;
    o.backward();
    assert_eq!(a.grad(), 2.);
    // n keeps its first gradient and receives a second one on top.
    o.backward();
    assert_eq!(n.grad(), 4.);
    assert_eq!(a.grad(), 6.);
}

#[test]
fn zero_grad_restores_fresh_results() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = tape.term("b", 3.);
    let o = ((a + b) * 2.).tanh();
    o.backward();
    let first = a.grad();

    o.zero_grad();
    assert_eq!(a.grad(), 0.);
    o.backward();
    assert_eq!(a.grad(), first);

    tape.zero_grad();
    o.backward();
    assert_eq!(a.grad(), first);
}

#[test]
fn zero_grad_leaves_unrelated_terms() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let other = tape.term("other", 1.);
    let o1 = a * 3.;
    let o2 = other * 5.;
    o1.backward();
    o2.backward();
    o1.zero_grad();
    assert_eq!(a.grad(), 0.);
    assert_eq!(other.grad(), 5.);
}

#[test]
fn backward_leaves_unreachable_terms() {
    let a = RcTerm::new("a", 2.);
    let b = RcTerm::new("b", 4.);
    let ab = &a * &b;
    let unrelated = &b + 1.;
    ab.backward();
    assert_eq!(unrelated.grad(), 0.);
    assert_eq!(b.grad(), 2.);

    ab.zero_grad();
    assert_eq!(a.grad(), 0.);
    assert_eq!(b.grad(), 0.);
}

#[test]
fn backward_from_intermediate() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = a * 4.;
    let c = b.exp();
    b.backward();
    assert_eq!(a.grad(), 4.);
    assert_eq!(c.grad(), 0.);
}

#[test]
fn fresh_terms_have_zero_gradient() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = (a * a).tanh();
    for term in b.topo_order() {
        assert_eq!(term.grad(), 0.);
    }
    assert_eq!(b.topo_order().last().map(|t| t.data()), Some(b.data()));
}

#[test]
fn dot_renders_reachable_graph() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let b = tape.term("b", 3.);
    let c = (a * b).tanh();
    c.backward();
    let mut buf = vec![];
    c.dot(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.starts_with("digraph G {"));
    assert!(text.contains("label=\"a \\ndata:2, grad:"));
    assert!(text.contains("[label=\"*\"]"));
    assert!(text.contains("[label=\"tanh\"]"));

    let r = RcTerm::new("r", 1.);
    let s = r.exp();
    let mut buf = vec![];
    s.dot(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("[label=\"exp\"]"));
    assert!(text.contains("label=\"r \\ndata:1, grad:0\""));
}

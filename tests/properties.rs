use approx::relative_eq;
use proptest::prelude::*;
use tapegrad::{RcTerm, Tape};

proptest! {
    #[test]
    fn sum_rule_holds(a in -1e3..1e3f64, b in -1e3..1e3f64) {
        let tape = Tape::new();
        let (ta, tb) = (tape.term("a", a), tape.term("b", b));
        let c = ta + tb;
        c.backward();
        prop_assert_eq!(ta.grad(), 1.);
        prop_assert_eq!(tb.grad(), 1.);
    }

    #[test]
    fn product_rule_swaps_values(a in -1e3..1e3f64, b in -1e3..1e3f64) {
        let tape = Tape::new();
        let (ta, tb) = (tape.term("a", a), tape.term("b", b));
        let c = ta * tb;
        c.backward();
        prop_assert_eq!(ta.grad(), b);
        prop_assert_eq!(tb.grad(), a);
    }

    #[test]
    fn power_rule_holds(x in 0.1..10f64, p in -3.0..3.0f64) {
        let tape = Tape::new();
        let tx = tape.term("x", x);
        let y = tx.pow(p).unwrap();
        y.backward();
        prop_assert!(relative_eq!(y.data(), x.powf(p), max_relative = 1e-12));
        prop_assert!(relative_eq!(tx.grad(), p * x.powf(p - 1.), max_relative = 1e-12));
    }

    #[test]
    fn repeated_use_counts_every_edge(x in -10.0..10f64, k in 1usize..20) {
        let tape = Tape::new();
        let tx = tape.term("x", x);
        let mut sum = tx;
        for _ in 1..k {
            sum = sum + tx;
        }
        sum.backward();
        prop_assert_eq!(tx.grad(), k as f64);
    }

    #[test]
    fn gradients_match_finite_differences(
        a in -2.0..2.0f64,
        b in -2.0..2.0f64,
        c in -2.0..2.0f64,
    ) {
        fn f(tape: &Tape, v: [f64; 3]) -> [tapegrad::TapeTerm<'_>; 4] {
            let a = tape.term("a", v[0]);
            let b = tape.term("b", v[1]);
            let c = tape.term("c", v[2]);
            let o = (a * b + c).tanh() + (a / (b * b + 1.)).exp() - c * 0.5;
            [a, b, c, o]
        }
        let v = [a, b, c];
        let tape = Tape::new();
        let terms = f(&tape, v);
        terms[3].backward();
        let h = 1e-6;
        for i in 0..3 {
            let (mut plus, mut minus) = (v, v);
            plus[i] += h;
            minus[i] -= h;
            let numerical =
                (f(&Tape::new(), plus)[3].data() - f(&Tape::new(), minus)[3].data()) / (2. * h);
            prop_assert!(
                (terms[i].grad() - numerical).abs() < 1e-6,
                "input {}: analytic {} numerical {}",
                i,
                terms[i].grad(),
                numerical
            );
        }
    }

    #[test]
    fn tape_and_rc_agree(a in -2.0..2.0f64, b in 0.5..3.0f64, c in -2.0..2.0f64) {
        let tape = Tape::new();
        let (ta, tb, tc) = (tape.term("a", a), tape.term("b", b), tape.term("c", c));
        let to = ((ta - tc) / tb).tanh() * (ta * tc).exp() + tb.pow(1.5).unwrap() - 2.;
        to.backward();

        let (ra, rb, rc) = (RcTerm::new("a", a), RcTerm::new("b", b), RcTerm::new("c", c));
        let ro = ((&ra - &rc) / &rb).tanh() * (&ra * &rc).exp() + rb.pow(1.5).unwrap() - 2.;
        ro.backward();

        prop_assert_eq!(to.data(), ro.data());
        prop_assert_eq!(ta.grad(), ra.grad());
        prop_assert_eq!(tb.grad(), rb.grad());
        prop_assert_eq!(tc.grad(), rc.grad());
        prop_assert_eq!(to.topo_order().len(), ro.topo_order().len());
    }
}

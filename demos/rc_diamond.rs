//! Dependency graph in diamond shape. It evaluates the same term twice, so the derivative should add up.

use tapegrad::RcTerm;

fn main() {
    let a = RcTerm::new("a", 1.);
    let b = RcTerm::new("b", 3.);
    let c = RcTerm::new("c", 5.);
    let ab = &a + &b;
    let ac = &a + &c;
    let abac = &ab + &ac;

    abac.backward();
    println!("abac: {abac}");
    println!("a: {a}");
    println!("b: {b}");
    println!("c: {c}");
    abac.dot(&mut std::io::stdout()).unwrap();
}

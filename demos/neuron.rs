//! A single neuron with two inputs and a tanh activation.

use tapegrad::Tape;

fn main() {
    let tape = Tape::new();

    // inputs
    let x1 = tape.term("x1", 2.0);
    let x2 = tape.term("x2", 0.0);

    // weights
    let w1 = tape.term("w1", -3.0);
    let w2 = tape.term("w2", 1.0);

    // bias
    let b = tape.term("b", 6.8813735870195432);

    let x1w1 = x1 * w1;
    x1w1.set_name("x1*w1");
    let x2w2 = x2 * w2;
    x2w2.set_name("x2*w2");
    let x1w1x2w2 = x1w1 + x2w2;
    x1w1x2w2.set_name("x1*w1 + x2*w2");
    let n = x1w1x2w2 + b;
    n.set_name("n");
    let o = n.tanh();
    o.set_name("o");

    o.backward();

    println!("o: {o}");
    for term in [x1, w1, x2, w2, b] {
        println!("{}: {term}", term.name());
    }
    o.dot(&mut std::io::stdout()).unwrap();
}

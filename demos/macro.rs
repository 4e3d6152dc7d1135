use tapegrad_macro::tapegrad;

fn main() -> Result<(), tapegrad::Error> {
    tapegrad! {{
        let x = 123.;
        let result = 2. * x.pow(2) + 321.;
    }};
    println!("f(x): {}", result.data());
    result.backward();
    println!("df/dx: {}", x.grad());
    result.dot(&mut std::io::stdout()).unwrap();
    Ok(())
}

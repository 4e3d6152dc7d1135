//! Reverse-mode automatic differentiation over scalar values.
//!
//! Composing terms with `+ - * /`, [`TapeTerm::pow`], [`TapeTerm::exp`] and
//! [`TapeTerm::tanh`] computes the forward value right away and records how it
//! was produced. Calling `backward()` on a result fills in the gradient of that
//! result with respect to every term it depends on.
//!
//! Two storages are available with the same semantics: [`Tape`], an arena
//! addressed by indices, and [`RcTerm`], reference counted shared nodes.
//!
//! ```
//! use tapegrad::Tape;
//!
//! let tape = Tape::new();
//! let a = tape.term("a", 2.);
//! let b = tape.term("b", 3.);
//! let c = a * b + 1.;
//! c.backward();
//! assert_eq!(c.data(), 7.);
//! assert_eq!(a.grad(), 3.);
//! assert_eq!(b.grad(), 2.);
//! ```

mod dot;
pub mod error;
mod op;
mod rc_term;
pub mod tape;

pub use error::{Error, Result};
pub use op::Op;
pub use rc_term::RcTerm;
pub use tape::{Tape, TapeTerm};

#[cfg(feature = "macro")]
pub use tapegrad_macro::tapegrad;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, BinOp, Block, Expr, Ident, Lit, Pat, Stmt, UnOp};

/// Build a graph of `tapegrad::RcTerm`s from ordinary arithmetic.
///
/// ```ignore
/// tapegrad! {{
///     let x1 = 2.;
///     let w1 = -3.;
///     let b = 6.8813735870195432;
///     let o = tanh(x1 * w1 + b);
/// }}
/// ```
///
/// Every `let` binding becomes a term labelled with the binding's name.
/// Literals become leaves, `+ - * /` and unary minus map to the operators,
/// and `exp(x)`, `tanh(x)`, `x.exp()`, `x.tanh()`, `x.pow(p)` map to the
/// methods. `pow` returns a `Result`, so the enclosing function must be able
/// to propagate a `tapegrad::Error` with `?`.
#[proc_macro]
pub fn tapegrad(input: TokenStream) -> TokenStream {
    // Parse the input tokens into a syntax tree
    let input = parse_macro_input!(input as Block);

    let mut objs = vec![];

    for stmt in &input.stmts {
        traverse_stmt(stmt, &mut objs);
    }

    // Build the output, possibly using quasi-quotation
    let expanded = quote! {
        #(#objs)*
    };

    // Hand the output tokens back to the compiler
    TokenStream::from(expanded)
}

enum Operand {
    Term(Ident),
    Lit(TokenStream2),
}

impl Operand {
    fn tokens(&self) -> TokenStream2 {
        match self {
            Self::Term(id) => quote! { &#id },
            Self::Lit(lit) => quote! { (#lit as f64) },
        }
    }
}

fn traverse_stmt(input: &Stmt, terms: &mut Vec<TokenStream2>) {
    match input {
        Stmt::Local(local) => {
            if let (Pat::Ident(id), Some(init)) = (&local.pat as &Pat, &local.init) {
                let name = id.ident.clone();
                let ex = &init.expr;
                let ts = if let Some(lit) = literal(ex) {
                    quote! {
                        let #name = ::tapegrad::RcTerm::new(stringify!(#name), (#lit as f64));
                    }
                } else if let Expr::Path(path) = ex as &Expr {
                    quote! {
                        let #name = #path.clone();
                    }
                } else {
                    match traverse_expr(ex, terms).map(|res| into_term(res, ex, terms)) {
                        Some(res) => quote! {
                            let #name = #res.clone();
                            #name.set_name(stringify!(#name));
                        },
                        None => syn::Error::new(ex.span(), "unsupported expression for tapegrad")
                            .to_compile_error(),
                    }
                };
                terms.push(ts);
            }
        }
        Stmt::Expr(ex, _) => {
            traverse_expr(ex, terms);
        }
        _ => (),
    }
}

fn var_name(terms: &[TokenStream2]) -> String {
    format!("_a{}", terms.len())
}

/// A numeric literal, possibly negated or parenthesized.
fn literal(ex: &Expr) -> Option<TokenStream2> {
    match ex {
        Expr::Lit(lit) if matches!(lit.lit, Lit::Float(_) | Lit::Int(_)) => Some(quote! { #lit }),
        Expr::Unary(un) if matches!(un.op, UnOp::Neg(_)) => {
            literal(&un.expr).map(|inner| quote! { -#inner })
        }
        Expr::Paren(ex) => literal(&ex.expr),
        _ => None,
    }
}

fn format_term(lit: &TokenStream2, ex: &Expr, terms: &mut Vec<TokenStream2>) -> Ident {
    let name = Ident::new(&var_name(terms), ex.span());
    let ts = quote! {
        let #name = ::tapegrad::RcTerm::new(stringify!(#name), (#lit as f64));
    };
    terms.push(ts);
    name
}

/// Promote a literal operand to a leaf so methods can be called on it.
fn into_term(operand: Operand, ex: &Expr, terms: &mut Vec<TokenStream2>) -> Ident {
    match operand {
        Operand::Term(id) => id,
        Operand::Lit(lit) => format_term(&lit, ex, terms),
    }
}

fn push_term(ts: TokenStream2, ex: &Expr, terms: &mut Vec<TokenStream2>) -> Operand {
    let name = Ident::new(&var_name(terms), ex.span());
    terms.push(quote! {
        let #name = #ts;
    });
    Operand::Term(name)
}

fn unary_method(arg: Ident, method: &Ident, args: &[&Expr]) -> Option<TokenStream2> {
    match (method.to_string().as_str(), args) {
        ("exp", []) => Some(quote! { #arg.exp() }),
        ("tanh", []) => Some(quote! { #arg.tanh() }),
        ("pow", [exp]) => Some(quote! { #arg.pow((#exp) as f64)? }),
        _ => None,
    }
}

fn traverse_expr(input: &Expr, terms: &mut Vec<TokenStream2>) -> Option<Operand> {
    if let Some(lit) = literal(input) {
        return Some(Operand::Lit(lit));
    }
    match input {
        Expr::Binary(ex) => {
            let lhs = traverse_expr(&ex.left, terms)?;
            let rhs = traverse_expr(&ex.right, terms)?;
            let lhs = match (lhs, &rhs) {
                (Operand::Lit(lit), Operand::Lit(_)) => {
                    Operand::Term(format_term(&lit, &ex.left, terms))
                }
                (lhs, _) => lhs,
            };
            let (lhs, rhs) = (lhs.tokens(), rhs.tokens());
            let binop = match ex.op {
                BinOp::Add(_) => quote! { #lhs + #rhs },
                BinOp::Sub(_) => quote! { #lhs - #rhs },
                BinOp::Mul(_) => quote! { #lhs * #rhs },
                BinOp::Div(_) => quote! { #lhs / #rhs },
                _ => return None,
            };
            Some(push_term(binop, input, terms))
        }
        Expr::Unary(ex) if matches!(ex.op, UnOp::Neg(_)) => {
            let term = traverse_expr(&ex.expr, terms)?;
            let term = into_term(term, &ex.expr, terms);
            Some(push_term(quote! { -&#term }, input, terms))
        }
        Expr::Paren(ex) => traverse_expr(&ex.expr, terms),
        Expr::Path(path) => path.path.segments.last().map(|seg| Operand::Term(seg.ident.clone())),
        Expr::Call(call) => {
            let Expr::Path(func) = &call.func as &Expr else {
                return None;
            };
            let method = &func.path.segments.last()?.ident;
            let mut args = call.args.iter();
            let arg = args.next()?;
            let rest: Vec<_> = args.collect();
            let term = traverse_expr(arg, terms)?;
            let term = into_term(term, arg, terms);
            let ts = unary_method(term, method, &rest)?;
            Some(push_term(ts, input, terms))
        }
        Expr::MethodCall(call) => {
            let term = traverse_expr(&call.receiver, terms)?;
            let term = into_term(term, &call.receiver, terms);
            let args: Vec<_> = call.args.iter().collect();
            let ts = unary_method(term, &call.method, &args)?;
            Some(push_term(ts, input, terms))
        }
        _ => None,
    }
}

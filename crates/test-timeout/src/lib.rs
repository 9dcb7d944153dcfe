//! Test attributes that fail a test after a wall-clock deadline instead of
//! letting a stuck socket or task hang the whole suite.
//!
//! `#[tokio_timeout_test]`, `#[tokio_timeout_test(5)]` and
//! `#[tokio_timeout_test(30, paused)]` run an async test on a fresh
//! current-thread runtime. With `paused` the tokio clock starts paused and
//! auto-advances, so only the wall-clock guard applies. `#[timeout(n)]` is the
//! synchronous counterpart.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestArgs {
    timeout_secs: u64,
    paused: bool,
}

fn parse_args(attr: TokenStream) -> syn::Result<TestArgs> {
    let mut args = TestArgs {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let exprs = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for expr in exprs {
        match &expr {
            Expr::Lit(lit) => match &lit.lit {
                Lit::Int(int) => {
                    let secs: u64 = int.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(int, "timeout must be greater than zero"));
                    }
                    args.timeout_secs = secs;
                }
                other => return Err(syn::Error::new_spanned(other, "expected a timeout in seconds")),
            },
            Expr::Path(path) if path.path.is_ident("paused") => args.paused = true,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected `<seconds>` or `paused`",
                ))
            }
        }
    }
    Ok(args)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]))
        .collect();
    let timeout = args.timeout_secs;

    // A paused clock auto-advances whenever the runtime idles, which would fire
    // an in-runtime timeout before the timers the test is waiting on.
    let body = if args.paused {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block);
        }
    } else {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    with_watchdog(&attrs, &vis, &sig, timeout, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.paused {
        return syn::Error::new_spanned(&sig.ident, "`paused` only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let body = quote! { (|| #block)(); };
    with_watchdog(&attrs, &vis, &sig, args.timeout_secs, body)
}

/// Runs `body` on a helper thread and fails the test if it outlives the deadline.
fn with_watchdog(
    attrs: &[Attribute],
    vis: &syn::Visibility,
    sig: &syn::Signature,
    timeout_secs: u64,
    body: proc_macro2::TokenStream,
) -> TokenStream {
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}

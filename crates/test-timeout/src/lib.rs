//! `#[test_timeout::timeout]` runs a test on a watchdog thread and fails it
//! when it does not finish in time. Works on both plain and `async` test
//! functions; async bodies get a current-thread tokio runtime, so crates
//! using it on async tests need `tokio` as a dev-dependency.
//!
//! `TANDEM_TEST_TIMEOUT_SECS` overrides the per-test limit at runtime.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const OVERRIDE_ENV: &str = "TANDEM_TEST_TIMEOUT_SECS";

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let name = sig.ident.to_string();
    let body: TokenStream2 = if sig.asyncness.take().is_some() {
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build test runtime");
            runtime.block_on(async move #block)
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::env::var(#OVERRIDE_ENV)
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(#timeout_secs);
            let limit = std::time::Duration::from_secs(limit);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let worker = std::thread::Builder::new()
                .name(String::from(#name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        #body
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit) {
                Ok(Ok(value)) => {
                    let _ = worker.join();
                    value
                }
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {:?}", limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Strips `#[test]` and `#[tokio::test]` so the generated `#[test]` is the
/// only harness attribute.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}

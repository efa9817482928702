//! `#[tokio_timeout_test]`: async tests that fail instead of hanging.
//!
//! Accepted arguments, in any order and comma separated:
//! - an integer: the timeout in seconds (default 30)
//! - `paused`: start the Tokio clock paused so timers auto-advance once every
//!   task is idle. Requires the calling crate to enable tokio's `test-util`.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

enum TimeoutOption {
    Seconds(LitInt),
    Paused,
}

impl Parse for TimeoutOption {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TimeoutOption::Seconds(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TimeoutOption::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TimeoutArgs {
    seconds: u64,
    paused: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            seconds: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let options = Punctuated::<TimeoutOption, Token![,]>::parse_terminated(input)?;
        for option in options {
            match option {
                TimeoutOption::Seconds(lit) => {
                    let seconds: u64 = lit.base10_parse()?;
                    if seconds == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.seconds = seconds;
                }
                TimeoutOption::Paused => args.paused = true,
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { seconds, paused } = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test needs an `async fn`")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_runtime_attribute(attr))
        .collect();
    let name = sig.ident.to_string();
    let pause = paused.then(|| quote! { builder.start_paused(true); });

    // The test body runs on its own thread so a wedged runtime (or a paused
    // clock that never advances) still trips the wall-clock deadline.
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#seconds);
            let started = ::std::time::Instant::now();
            let worker = ::std::thread::Builder::new()
                .name(#name.to_string())
                .spawn(move || {
                    let mut builder = ::tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause
                    let runtime = match builder.build() {
                        Ok(runtime) => runtime,
                        Err(err) => panic!("cannot build test runtime: {err}"),
                    };
                    runtime.block_on(async move #block)
                })
                .unwrap_or_else(|err| panic!("cannot spawn test thread: {err}"));
            while !worker.is_finished() {
                if started.elapsed() >= limit {
                    panic!("`{}` still running after {}s", #name, #seconds);
                }
                ::std::thread::sleep(::std::time::Duration::from_millis(5));
            }
            match worker.join() {
                Ok(output) => output,
                Err(payload) => ::std::panic::resume_unwind(payload),
            }
        }
    };
    expanded.into()
}

/// A stray `#[tokio::test]` would wrap the body in a second runtime.
fn is_runtime_attribute(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    path == ["tokio", "test"]
}

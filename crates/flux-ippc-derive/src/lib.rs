// Make the following work:
//
// #[service]
// impl Math {
//     #[public]
//     fn add(&self, a: i64, b: i64) -> i64 { a + b }
// }
//
// generating a `flux_ippc::dispatch::Service` impl whose `dispatch_entries`
// exposes every `#[public]` method under its bare name, bound to a cloned
// `Arc<Self>`. Positional args bind to parameters by index; anything left
// over is looked up in kwargs by parameter name; arguments present in
// neither bind to `null` (so `Option<T>` parameters default to `None`).

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{FnArg, ImplItem, ItemImpl, Pat, ReturnType, Type, parse_macro_input};

fn is_public(item: &ImplItem) -> bool {
    let ImplItem::Fn(f) = item else { return false };
    f.attrs.iter().any(|a| a.path().is_ident("public"))
}

fn strip_public(item: &mut ImplItem) {
    if let ImplItem::Fn(f) = item {
        f.attrs.retain(|a| !a.path().is_ident("public"));
    }
}

/// Does the return type look like `Result<_, _>`?
fn returns_result(ret: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = ret else { return false };
    matches!(ty.as_ref(), Type::Path(p) if p.path.segments.last().is_some_and(|s| s.ident == "Result"))
}

#[proc_macro_attribute]
pub fn service(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(item as ItemImpl);
    let self_ty = input.self_ty.clone();

    let mut entries = Vec::new();

    for item in &input.items {
        if !is_public(item) {
            continue;
        }
        let ImplItem::Fn(f) = item else { continue };
        let method_ident = &f.sig.ident;
        let method_name = method_ident.to_string();

        let mut params = Vec::new();
        let mut saw_receiver = false;
        for (idx, arg) in f.sig.inputs.iter().enumerate() {
            match arg {
                FnArg::Receiver(r) => {
                    if r.mutability.is_some() || r.reference.is_none() {
                        panic!("#[public] method `{method_name}` must take `&self`");
                    }
                    saw_receiver = true;
                }
                FnArg::Typed(pat_ty) => {
                    let Pat::Ident(pat_ident) = pat_ty.pat.as_ref() else {
                        panic!("#[public] method `{method_name}` must use simple identifier parameters");
                    };
                    let ty = pat_ty.ty.as_ref();
                    let position = if saw_receiver { idx - 1 } else { idx };
                    params.push((pat_ident.ident.clone(), pat_ident.ident.to_string(), ty.clone(), position));
                }
            }
        }

        let binders = params.iter().map(|(ident, name, ty, position)| {
            let local = format_ident!("__arg_{ident}");
            quote! {
                let #local: #ty = {
                    let __v = __args.get(#position)
                        .cloned()
                        .or_else(|| __kwargs.get(#name).cloned())
                        .unwrap_or(::serde_json::Value::Null);
                    ::serde_json::from_value(__v).map_err(|e| {
                        ::flux_ippc::error::HandlerError::ordinary(format!(
                            "bad argument `{}` for `{}`: {e}", #name, #method_name
                        ))
                    })?
                };
            }
        });
        let call_args = params.iter().map(|(ident, ..)| {
            let local = format_ident!("__arg_{ident}");
            quote! { #local }
        });

        let invoke = if returns_result(&f.sig.output) {
            quote! {
                let __result = __service.#method_ident(#(#call_args),*)
                    .map_err(::std::convert::Into::into)?;
            }
        } else {
            quote! {
                let __result = __service.#method_ident(#(#call_args),*);
            }
        };

        entries.push(quote! {
            {
                let __service = ::std::sync::Arc::clone(&self);
                let __f: ::flux_ippc::dispatch::Method = ::std::sync::Arc::new(
                    move |(__args, __kwargs): ::flux_ippc::dispatch::Args| {
                        #(#binders)*
                        #invoke
                        ::serde_json::to_value(&__result).map_err(|e| {
                            ::flux_ippc::error::HandlerError::ordinary(format!(
                                "could not encode result of `{}`: {e}", #method_name
                            ))
                        })
                    },
                );
                (#method_name.to_string(), __f)
            }
        });
    }

    for item in &mut input.items {
        if is_public(item) {
            strip_public(item);
        }
    }

    let expanded = quote! {
        #input

        impl ::flux_ippc::dispatch::Service for #self_ty {
            fn dispatch_entries(self: ::std::sync::Arc<Self>) -> ::std::vec::Vec<(::std::string::String, ::flux_ippc::dispatch::Method)> {
                ::std::vec![ #(#entries),* ]
            }
        }
    };

    TokenStream::from(expanded)
}

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};
use quote::quote;

/// Derive `RegisterMap` for a fieldless enum naming the registers of one
/// peripheral window. The expansion refers to `crate::register::RegisterMap`,
/// so the derive is only usable inside the periphsim crate itself.
///
/// Each variant may carry `#[offset(N)]`; variants without it sit 4 bytes
/// after the previous one (the first defaults to 0).
#[proc_macro_derive(RegisterMap, attributes(offset))]
pub fn register_map(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    impl_register_map(&input).unwrap_or_else(|e| e.to_compile_error()).into()
}

#[derive(Debug)]
struct RegisterInfo {
    ident: syn::Ident,
    name: String,
    offset: u32,
}

/// `InterruptEnable` -> `INTERRUPT_ENABLE`
fn screaming_snake(ident: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for c in ident.chars() {
        if c.is_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        out.extend(c.to_uppercase());
    }
    out
}

fn impl_register_map(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let data = match &input.data {
        syn::Data::Enum(data) => data,
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "RegisterMap can only be used on enums",
            ));
        }
    };

    let mut off: u32 = 0;
    let mut reginfos = Vec::<RegisterInfo>::new();
    for v in &data.variants {
        if !matches!(v.fields, syn::Fields::Unit) {
            return Err(syn::Error::new_spanned(v, "Register variants cannot carry data"));
        }
        for attr in &v.attrs {
            if attr.path().is_ident("offset") {
                let lit: syn::LitInt = attr.parse_args()?;
                off = lit.base10_parse()?;
                if (off & 3) != 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "Register address must be aligned on word boundary",
                    ));
                }
            }
        }
        if let Some(dup) = reginfos.iter().find(|r| r.offset == off) {
            return Err(syn::Error::new_spanned(
                v,
                format!("Register offset 0x{off:x} already used by {}", dup.ident),
            ));
        }
        reginfos.push(RegisterInfo {
            ident: v.ident.clone(),
            name: screaming_snake(&v.ident.to_string()),
            offset: off,
        });
        off += 4;
    }

    // Match arms for offset()
    let offset_matches = reginfos.iter().map(|ri| {
        let ident = &ri.ident;
        let offset = ri.offset;

        quote! {
            #name::#ident => #offset,
        }
    });

    // Match arms for name()
    let name_matches = reginfos.iter().map(|ri| {
        let ident = &ri.ident;
        let rname = &ri.name;

        quote! {
            #name::#ident => #rname,
        }
    });

    // Match arms for from_offset()
    let from_matches = reginfos.iter().map(|ri| {
        let ident = &ri.ident;
        let offset = ri.offset;

        quote! {
            #offset => Some(#name::#ident),
        }
    });

    let all = reginfos.iter().map(|ri| {
        let ident = &ri.ident;
        quote! { #name::#ident, }
    });

    let expanded = quote! {
        impl crate::register::RegisterMap for #name {
            const ALL: &'static [Self] = &[#(#all)*];

            fn offset(self) -> u32 {
                match self {
                    #(#offset_matches)*
                }
            }

            fn name(self) -> &'static str {
                match self {
                    #(#name_matches)*
                }
            }

            fn from_offset(offset: u32) -> Option<Self> {
                match offset {
                    #(#from_matches)*
                    _ => None
                }
            }
        }
    };

    Ok(expanded)
}

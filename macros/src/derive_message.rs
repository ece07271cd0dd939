use quote::{quote, ToTokens};
use syn::{
    custom_keyword,
    parse::{Parse, ParseStream},
    punctuated::Punctuated,
    spanned::Spanned,
    Data, DeriveInput, Generics, Ident, LitStr, Token,
};

pub struct DeriveMessage {
    attrs: DeriveMessageAttrs,
    ident: Ident,
    generics: Generics,
}

impl ToTokens for DeriveMessage {
    fn to_tokens(&self, tokens: &mut proc_macro2::TokenStream) {
        let Self {
            attrs,
            ident,
            generics,
        } = self;
        let tag = match &attrs.tag {
            Some(s) => s.value(),
            None => ident.to_string(),
        };
        let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

        tokens.extend(quote! {
            #[automatically_derived]
            impl #impl_generics ::comlink::message::Message for #ident #ty_generics #where_clause {
                const TAG: &'static str = #tag;
            }
        });
    }
}

impl Parse for DeriveMessage {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let input: DeriveInput = input.parse()?;
        if let Data::Union(_) = &input.data {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "Message cannot be derived for unions",
            ));
        }
        let ident = input.ident;
        let generics = input.generics;
        if !generics.params.is_empty() {
            return Err(syn::Error::new(
                generics.span(),
                "generic messages need an explicit `impl Message` with a unique tag per instantiation",
            ));
        }
        let mut attrs = None;
        for attr in input.attrs {
            if attr.path().is_ident("message") {
                if attrs.is_some() {
                    return Err(syn::Error::new(
                        attr.span(),
                        "message attribute already specified",
                    ));
                }
                attrs = Some(attr.parse_args_with(DeriveMessageAttrs::parse)?);
            }
        }

        Ok(DeriveMessage {
            attrs: attrs.unwrap_or_default(),
            ident,
            generics,
        })
    }
}

#[derive(Default)]
struct DeriveMessageAttrs {
    tag: Option<LitStr>,
}

impl Parse for DeriveMessageAttrs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs: Punctuated<(tag, LitStr), Token![,]> =
            Punctuated::parse_terminated_with(input, |input| {
                let key: tag = input.parse()?;
                let _: Token![=] = input.parse()?;
                let value: LitStr = input.parse()?;
                Ok((key, value))
            })?;

        let mut tag = None;
        for (key, value) in attrs {
            if tag.is_some() {
                return Err(syn::Error::new(key.span, "tag already set"));
            }
            if value.value().is_empty() {
                return Err(syn::Error::new(value.span(), "tag must not be empty"));
            }
            tag = Some(value);
        }

        Ok(DeriveMessageAttrs { tag })
    }
}

custom_keyword!(tag);

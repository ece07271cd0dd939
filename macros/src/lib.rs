mod derive_message;

use derive_message::DeriveMessage;
use proc_macro::TokenStream;
use quote::ToTokens;
use syn::parse_macro_input;

/// Derive macro implementing the [Message](https://docs.rs/comlink/latest/comlink/message/trait.Message.html) trait.
///
/// The type tag identifies the message on the wire and selects the receive pipeline it is dispatched to.
/// It defaults to the type's ident and can be overridden with `#[message(tag = "...")]`.
///
/// The type must also implement `serde::Serialize` and `serde::Deserialize`.
///
/// # Example
///
/// ```ignore
/// use comlink::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Message, Serialize, Deserialize)]
/// #[message(tag = "chat.line")]
/// struct ChatLine {
///     text: String,
/// }
///
/// assert_eq!(<ChatLine as comlink::message::Message>::TAG, "chat.line");
/// ```
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    let derive_message = parse_macro_input!(input as DeriveMessage);
    TokenStream::from(derive_message.into_token_stream())
}

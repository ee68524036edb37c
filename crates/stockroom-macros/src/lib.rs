//! Proc macros for stockroom.

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2, TokenTree};
use quote::{format_ident, quote, quote_spanned};

/// Register an async function as a migration.
///
/// The version and name come from the file name unless given explicitly:
/// `m2018_12_19_123224_create_products.rs` registers version
/// `2018_12_19_123224` named `create_products`.
///
/// ```ignore
/// #[stockroom::migration(down = revert)]
/// pub async fn migrate(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
///     ctx.execute("CREATE TABLE \"thing\" (\"id\" BIGINT PRIMARY KEY)").await?;
///     Ok(())
/// }
///
/// pub async fn revert(ctx: &mut MigrationContext<'_>) -> MigrationResult<()> {
///     ctx.execute("DROP TABLE \"thing\"").await?;
///     Ok(())
/// }
/// ```
///
/// Arguments (all optional): `version = "..."`, `name = "..."`, `down = <fn>`.
/// Without `down` the migration cannot be rolled back.
#[proc_macro_attribute]
pub fn migration(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand(attr.into(), item.into()) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct Error {
    span: Span,
    message: String,
}

impl Error {
    fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }

    fn to_compile_error(&self) -> TokenStream2 {
        let message = &self.message;
        quote_spanned!(self.span => ::core::compile_error!(#message);)
    }
}

#[derive(Default)]
struct Args {
    version: Option<String>,
    name: Option<String>,
    down: Option<Ident>,
}

fn expand(attr: TokenStream2, item: TokenStream2) -> Result<TokenStream2, Error> {
    let args = parse_args(attr)?;
    let up = function_name(&item)?;

    let version = match &args.version {
        Some(version) => quote!(#version),
        None => quote!(::stockroom::__migration_version(::core::file!())),
    };
    let name = match &args.name {
        Some(name) => quote!(#name),
        None => quote!(::stockroom::__migration_name(::core::file!())),
    };
    let checksum = checksum(&item);

    let up_shim = format_ident!("__stockroom_{}_up", up);
    let up_def = shim(&up_shim, &up);

    let (down_def, down) = match &args.down {
        Some(down) => {
            let down_shim = format_ident!("__stockroom_{}_down", up);
            let def = shim(&down_shim, down);
            (def, quote!(::core::option::Option::Some(#down_shim)))
        }
        None => (quote!(), quote!(::core::option::Option::None)),
    };

    Ok(quote! {
        #item

        #up_def
        #down_def

        ::stockroom::inventory::submit! {
            ::stockroom::Migration {
                version: #version,
                name: #name,
                checksum: #checksum,
                source_file: ::core::file!(),
                up: #up_shim,
                down: #down,
            }
        }
    })
}

/// A non-async wrapper with the `MigrationFn` signature.
fn shim(shim: &Ident, target: &Ident) -> TokenStream2 {
    quote! {
        #[doc(hidden)]
        fn #shim<'a>(
            ctx: &'a mut ::stockroom::MigrationContext<'a>,
        ) -> ::std::pin::Pin<
            ::std::boxed::Box<
                dyn ::std::future::Future<Output = ::stockroom::MigrationResult<()>>
                    + ::std::marker::Send
                    + 'a,
            >,
        > {
            ::std::boxed::Box::pin(#target(ctx))
        }
    }
}

fn parse_args(attr: TokenStream2) -> Result<Args, Error> {
    let mut args = Args::default();
    let mut tokens = attr.into_iter();

    while let Some(token) = tokens.next() {
        let key = match token {
            TokenTree::Ident(key) => key,
            other => {
                return Err(Error::new(
                    other.span(),
                    "expected `version`, `name` or `down`",
                ));
            }
        };

        match tokens.next() {
            Some(TokenTree::Punct(p)) if p.as_char() == '=' => {}
            _ => return Err(Error::new(key.span(), format!("expected `=` after `{key}`"))),
        }

        let value = tokens
            .next()
            .ok_or_else(|| Error::new(key.span(), format!("missing value for `{key}`")))?;

        match key.to_string().as_str() {
            "version" => args.version = Some(string_literal(&value)?),
            "name" => args.name = Some(string_literal(&value)?),
            "down" => match value {
                TokenTree::Ident(down) => args.down = Some(down),
                other => {
                    return Err(Error::new(
                        other.span(),
                        "`down` takes the name of an async function",
                    ));
                }
            },
            other => {
                return Err(Error::new(
                    key.span(),
                    format!("unknown migration argument `{other}`"),
                ));
            }
        }

        match tokens.next() {
            None => break,
            Some(TokenTree::Punct(p)) if p.as_char() == ',' => {}
            Some(other) => return Err(Error::new(other.span(), "expected `,`")),
        }
    }

    Ok(args)
}

fn string_literal(token: &TokenTree) -> Result<String, Error> {
    if let TokenTree::Literal(lit) = token {
        let repr = lit.to_string();
        if let Some(inner) = repr
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            && !inner.contains('\\')
        {
            return Ok(inner.to_string());
        }
    }
    Err(Error::new(token.span(), "expected a plain string literal"))
}

/// Find the name of the annotated function, which must be async.
fn function_name(item: &TokenStream2) -> Result<Ident, Error> {
    let mut is_async = false;
    let mut tokens = item.clone().into_iter();

    while let Some(token) = tokens.next() {
        let TokenTree::Ident(ident) = token else {
            continue;
        };
        if ident == "async" {
            is_async = true;
        } else if ident == "fn" {
            let Some(TokenTree::Ident(name)) = tokens.next() else {
                return Err(Error::new(ident.span(), "expected a function name"));
            };
            if !is_async {
                return Err(Error::new(
                    name.span(),
                    "migration functions must be `async fn`",
                ));
            }
            return Ok(name);
        }
    }

    Err(Error::new(
        Span::call_site(),
        "#[stockroom::migration] must be applied to an async function",
    ))
}

/// blake3 of the function's tokens, ignoring whitespace.
fn checksum(item: &TokenStream2) -> String {
    let normalized: String = item.to_string().split_whitespace().collect();
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

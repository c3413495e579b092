use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, ImplItem, Item, ItemFn, LitBool, LitInt, LitStr};

#[derive(Clone, Copy)]
enum Format {
    Table,
    Json,
    JsonPretty,
}

impl Format {
    fn to_tokens(self) -> proc_macro2::TokenStream {
        match self {
            Format::Table => quote!(memprof::Format::Table),
            Format::Json => quote!(memprof::Format::Json),
            Format::JsonPretty => quote!(memprof::Format::JsonPretty),
        }
    }
}

#[derive(Clone, Copy)]
enum DumpFormat {
    Callgraph,
    Samples,
    Tree,
}

impl DumpFormat {
    fn to_tokens(self) -> proc_macro2::TokenStream {
        match self {
            DumpFormat::Callgraph => quote!(memprof::DumpFormat::Callgraph),
            DumpFormat::Samples => quote!(memprof::DumpFormat::Samples),
            DumpFormat::Tree => quote!(memprof::DumpFormat::Tree),
        }
    }
}

fn parse_bool(meta: &syn::meta::ParseNestedMeta<'_>) -> syn::Result<bool> {
    if meta.input.peek(syn::Token![=]) {
        meta.input.parse::<syn::Token![=]>()?;
        let lit: LitBool = meta.input.parse()?;
        Ok(lit.value)
    } else {
        Ok(true)
    }
}

/// Starts a profiling session for the duration of the annotated function and
/// prints a report of the frames still holding memory when it returns.
///
/// The function body runs inside a frame named after the function.
///
/// # Parameters
///
/// * `format` - Report format: `"table"` (default), `"json"`, or `"json-pretty"`
/// * `limit` - Maximum number of frames in the report (0 = show all). Default: `15`
/// * `native` - Intercept the process allocator. Default: `true`
/// * `dump_on_limit` - Dump automatically on a host memory-limit error. Default: `false`
/// * `dump` - Also write the profile to a file on exit: `"callgraph"`, `"samples"` or `"tree"`
/// * `output_dir` - Directory for dump files. Default: the system temp dir
///
/// # Examples
///
/// ```rust,no_run
/// #[cfg_attr(feature = "memprof", memprof::main)]
/// fn main() {
///     // Your code here
/// }
/// ```
///
/// ```rust,no_run
/// #[cfg_attr(feature = "memprof", memprof::main(format = "json-pretty", limit = 0, dump = "callgraph"))]
/// fn main() {
///     // Your code here
/// }
/// ```
///
/// When using with tokio, place `#[tokio::main]` before `#[memprof::main]`.
///
/// # Limitations
///
/// Only one session can be active at a time. A second one (either via this
/// macro or via [`MemprofBuilder`](../memprof/struct.MemprofBuilder.html))
/// panics.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    // Defaults
    let mut format = Format::Table;
    let mut limit: usize = 15;
    let mut native = true;
    let mut dump_on_limit = false;
    let mut dump: Option<DumpFormat> = None;
    let mut output_dir: Option<String> = None;

    if !attr.is_empty() {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("format") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                format =
                    match lit.value().as_str() {
                        "table" => Format::Table,
                        "json" => Format::Json,
                        "json-pretty" => Format::JsonPretty,
                        other => return Err(meta.error(format!(
                            "Unknown format {:?}. Expected one of: \"table\", \"json\", \"json-pretty\"",
                            other
                        ))),
                    };
                return Ok(());
            }

            if meta.path.is_ident("limit") {
                meta.input.parse::<syn::Token![=]>()?;
                let li: LitInt = meta.input.parse()?;
                limit = li.base10_parse()?;
                return Ok(());
            }

            if meta.path.is_ident("native") {
                native = parse_bool(&meta)?;
                return Ok(());
            }

            if meta.path.is_ident("dump_on_limit") {
                dump_on_limit = parse_bool(&meta)?;
                return Ok(());
            }

            if meta.path.is_ident("dump") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                dump = Some(match lit.value().as_str() {
                    "callgraph" => DumpFormat::Callgraph,
                    "samples" => DumpFormat::Samples,
                    "tree" => DumpFormat::Tree,
                    other => {
                        return Err(meta.error(format!(
                            "Unknown dump format {:?}. Expected one of: \"callgraph\", \"samples\", \"tree\"",
                            other
                        )))
                    }
                });
                return Ok(());
            }

            if meta.path.is_ident("output_dir") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                output_dir = Some(lit.value());
                return Ok(());
            }

            Err(meta.error(
                "Unknown parameter. Supported: format=\"..\", limit=N, native=bool, dump_on_limit=bool, dump=\"..\", output_dir=\"..\"",
            ))
        });

        if let Err(e) = parser.parse2(proc_macro2::TokenStream::from(attr)) {
            return e.to_compile_error().into();
        }
    }

    let format_token = format.to_tokens();
    let dump_token = dump.map(|d| {
        let d = d.to_tokens();
        quote!(.dump_on_drop(#d))
    });
    let output_dir_token = output_dir.map(|dir| quote!(.output_dir(#dir)));

    let asyncness = sig.asyncness.is_some();
    let fn_name = &sig.ident;

    let body = quote! {
        let _memprof = {
            let caller_name: &'static str =
                concat!(module_path!(), "::", stringify!(#fn_name));

            memprof::MemprofBuilder::new(caller_name)
                .native(#native)
                .dump_on_limit(#dump_on_limit)
                .limit(#limit)
                .format(#format_token)
                #dump_token
                #output_dir_token
                .build()
        };
        #block
    };

    let wrapped_body = if asyncness {
        quote! { async { #body }.await }
    } else {
        body
    };

    let output = quote! {
        #vis #sig {
            #wrapped_body
        }
    };

    output.into()
}

/// Attributes the allocations a function makes to its own frame, nested
/// under the frame of its caller.
///
/// The frame is named `module::path::function`; pass `name = "..."` to pick
/// a different one. Calling the same function repeatedly from the same
/// caller reuses one frame and counts the calls.
///
/// Async functions keep their frame across `.await` points only while they
/// are polled on the thread that started the session.
///
/// ```rust,no_run
/// #[cfg_attr(feature = "memprof", memprof::measure)]
/// fn load() -> Vec<u8> {
///     vec![0; 1024]
/// }
///
/// #[cfg_attr(feature = "memprof", memprof::measure(name = "parse"))]
/// fn parse_input(input: &str) -> Vec<String> {
///     input.split(',').map(String::from).collect()
/// }
/// ```
#[proc_macro_attribute]
pub fn measure(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let mut custom_name: Option<String> = None;
    if !attr.is_empty() {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("name") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                custom_name = Some(lit.value());
                return Ok(());
            }
            Err(meta.error("Unknown parameter. Supported: name=\"..\""))
        });

        if let Err(e) = parser.parse2(proc_macro2::TokenStream::from(attr)) {
            return e.to_compile_error().into();
        }
    }

    let attrs = &input.attrs;

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    let asyncness = sig.asyncness.is_some();

    let frame_name = match custom_name {
        Some(name) => quote!(#name),
        None => {
            let name = sig.ident.to_string();
            quote!(concat!(module_path!(), "::", #name))
        }
    };

    let guard_init = quote! {
        let _frame = memprof::FrameGuard::enter(#frame_name);
        #block
    };

    let wrapped = if asyncness {
        quote! { async { #guard_init }.await }
    } else {
        guard_init
    };

    let output = quote! {
        #(#attrs)*
        #vis #sig {
            #wrapped
        }
    };

    output.into()
}

/// Excludes a function from [`measure_all`](macro@measure_all).
///
/// ```rust,no_run
/// # struct Cache { entries: Vec<u8> }
/// #[cfg_attr(feature = "memprof", memprof::measure_all)]
/// impl Cache {
///     fn fill(&mut self) {
///         // gets its own frame
///     }
///
///     #[cfg_attr(feature = "memprof", memprof::skip)]
///     fn len(&self) -> usize {
///         // attributed to the caller's frame
///         self.entries.len()
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn skip(_attr: TokenStream, item: TokenStream) -> TokenStream {
    item
}

/// Applies [`measure`](macro@measure) to every function in a module or impl
/// block, except those marked with [`skip`](macro@skip).
///
/// ```rust,no_run
/// #[cfg_attr(feature = "memprof", memprof::measure_all)]
/// mod loaders {
///     pub fn load_users() -> Vec<String> {
///         Vec::with_capacity(128)
///     }
///
///     pub fn load_orders() -> Vec<u64> {
///         Vec::with_capacity(1024)
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn measure_all(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let parsed_item = parse_macro_input!(item as Item);

    match parsed_item {
        Item::Mod(mut module) => {
            if let Some((_brace, items)) = &mut module.content {
                for it in items.iter_mut() {
                    if let Item::Fn(func) = it {
                        if !has_memprof_skip(&func.attrs) {
                            let func_tokens = TokenStream::from(quote!(#func));
                            let transformed = measure(TokenStream::new(), func_tokens);
                            *func = syn::parse_macro_input!(transformed as ItemFn);
                        }
                    }
                }
            }
            TokenStream::from(quote!(#module))
        }
        Item::Impl(mut impl_block) => {
            for item in impl_block.items.iter_mut() {
                if let ImplItem::Fn(method) = item {
                    if !has_memprof_skip(&method.attrs) {
                        let func_tokens = TokenStream::from(quote!(#method));
                        let transformed = measure(TokenStream::new(), func_tokens);
                        *method = syn::parse_macro_input!(transformed as syn::ImplItemFn);
                    }
                }
            }
            TokenStream::from(quote!(#impl_block))
        }
        _ => syn::Error::new(
            proc_macro2::Span::call_site(),
            "measure_all can only be applied to modules or impl blocks",
        )
        .to_compile_error()
        .into(),
    }
}

fn has_memprof_skip(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        // #[skip] or #[memprof::skip]
        if attr.path().is_ident("skip")
            || (attr.path().segments.len() == 2
                && attr.path().segments[0].ident == "memprof"
                && attr.path().segments[1].ident == "skip")
        {
            return true;
        }

        // #[cfg_attr(feature = "memprof", memprof::skip)]
        if attr.path().is_ident("cfg_attr") {
            let attr_str = quote!(#attr).to_string();
            if attr_str.contains("memprof") && attr_str.contains("skip") {
                return true;
            }
        }

        false
    })
}

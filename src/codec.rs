//! Typed argument/result wire format between the judge and compiled
//! artifacts.
//!
//! Arguments are encoded as a newline-framed bundle (strings and list
//! elements base64-framed so they are newline-safe), and the whole bundle is
//! base64-wrapped into the single opaque payload the container transport
//! carries. The generated harness inside the artifact decodes the bundle
//! with matching readers and writes the returned value back in the same
//! format after a sentinel marker.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::Value;

/// Closed set of parameter and return types the judge can marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    Str,
    IntList,
    StrList,
}

impl ParamKind {
    /// Maps a declared Rust type to a wire kind; `None` for anything
    /// outside the supported set.
    pub fn from_type(ty: &syn::Type) -> Option<ParamKind> {
        match type_name(ty)?.as_str() {
            "i64" => Some(ParamKind::Int),
            "f64" => Some(ParamKind::Float),
            "bool" => Some(ParamKind::Bool),
            "String" => Some(ParamKind::Str),
            "Vec<i64>" => Some(ParamKind::IntList),
            "Vec<String>" => Some(ParamKind::StrList),
            _ => None,
        }
    }

    /// The Rust source spelling, used when generating the harness.
    pub fn rust_type(&self) -> &'static str {
        match self {
            ParamKind::Int => "i64",
            ParamKind::Float => "f64",
            ParamKind::Bool => "bool",
            ParamKind::Str => "String",
            ParamKind::IntList => "Vec<i64>",
            ParamKind::StrList => "Vec<String>",
        }
    }

    /// Name of the generated `__judge` reader for this kind.
    pub fn reader_fn(&self) -> &'static str {
        match self {
            ParamKind::Int => "read_i64",
            ParamKind::Float => "read_f64",
            ParamKind::Bool => "read_bool",
            ParamKind::Str => "read_str",
            ParamKind::IntList => "read_int_list",
            ParamKind::StrList => "read_str_list",
        }
    }

    /// Name of the generated `__judge` writer for this kind.
    pub fn writer_fn(&self) -> &'static str {
        match self {
            ParamKind::Int => "write_i64",
            ParamKind::Float => "write_f64",
            ParamKind::Bool => "write_bool",
            ParamKind::Str => "write_str",
            ParamKind::IntList => "write_int_list",
            ParamKind::StrList => "write_str_list",
        }
    }

    /// Whether a task-supplied JSON argument is representable as this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::Int => value.is_i64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Str => value.is_string(),
            ParamKind::IntList => value
                .as_array()
                .is_some_and(|xs| xs.iter().all(Value::is_i64)),
            ParamKind::StrList => value
                .as_array()
                .is_some_and(|xs| xs.iter().all(Value::is_string)),
        }
    }
}

/// Renders a type path like `Vec < String >` into the canonical `Vec<String>`.
fn type_name(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Path(p) if p.qself.is_none() => {
            let seg = p.path.segments.last()?;
            let ident = seg.ident.to_string();
            match &seg.arguments {
                syn::PathArguments::None => Some(ident),
                syn::PathArguments::AngleBracketed(args) => {
                    let inner: Vec<String> = args
                        .args
                        .iter()
                        .filter_map(|a| match a {
                            syn::GenericArgument::Type(t) => type_name(t),
                            _ => None,
                        })
                        .collect();
                    if inner.len() != args.args.len() {
                        return None;
                    }
                    Some(format!("{}<{}>", ident, inner.join(", ")))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Encodes one value into its bundle lines.
fn encode_value(kind: ParamKind, value: &Value) -> Result<Vec<String>, String> {
    fn mismatch(kind: ParamKind, value: &Value) -> String {
        format!("argument {value} is not a {}", kind.rust_type())
    }
    match kind {
        ParamKind::Int => Ok(vec![value
            .as_i64()
            .ok_or_else(|| mismatch(kind, value))?
            .to_string()]),
        ParamKind::Float => Ok(vec![value
            .as_f64()
            .ok_or_else(|| mismatch(kind, value))?
            .to_string()]),
        ParamKind::Bool => Ok(vec![value
            .as_bool()
            .ok_or_else(|| mismatch(kind, value))?
            .to_string()]),
        ParamKind::Str => {
            let s = value.as_str().ok_or_else(|| mismatch(kind, value))?;
            Ok(vec![B64.encode(s.as_bytes())])
        }
        ParamKind::IntList => {
            let xs = value.as_array().ok_or_else(|| mismatch(kind, value))?;
            let mut line = vec![xs.len().to_string()];
            for x in xs {
                line.push(x.as_i64().ok_or_else(|| mismatch(kind, value))?.to_string());
            }
            Ok(vec![line.join(" ")])
        }
        ParamKind::StrList => {
            let xs = value.as_array().ok_or_else(|| mismatch(kind, value))?;
            let mut lines = vec![xs.len().to_string()];
            for x in xs {
                lines.push(B64.encode(x.as_str().ok_or_else(|| mismatch(kind, value))?.as_bytes()));
            }
            Ok(lines)
        }
    }
}

/// Encodes a full argument bundle into the opaque base64 payload.
pub fn encode_payload(kinds: &[ParamKind], args: &[Value]) -> Result<String, String> {
    if kinds.len() != args.len() {
        return Err(format!(
            "arity mismatch: {} parameter(s), {} argument(s)",
            kinds.len(),
            args.len()
        ));
    }
    let mut lines = Vec::new();
    for (kind, value) in kinds.iter().zip(args) {
        lines.extend(encode_value(*kind, value)?);
    }
    Ok(B64.encode(lines.join("\n").as_bytes()))
}

/// Decodes the returned-value text the harness printed after the sentinel
/// marker back into a JSON value, using the declared return kind.
pub fn decode_returned(kind: Option<ParamKind>, text: &str) -> Result<Value, String> {
    let Some(kind) = kind else {
        return Ok(Value::Null);
    };
    let mut lines = text.lines();
    let mut next = || lines.next().ok_or_else(|| "truncated result".to_string());
    match kind {
        ParamKind::Int => {
            let n: i64 = next()?.trim().parse().map_err(|e| format!("bad i64: {e}"))?;
            Ok(Value::from(n))
        }
        ParamKind::Float => {
            let x: f64 = next()?.trim().parse().map_err(|e| format!("bad f64: {e}"))?;
            Ok(Value::from(x))
        }
        ParamKind::Bool => {
            let b: bool = next()?.trim().parse().map_err(|e| format!("bad bool: {e}"))?;
            Ok(Value::from(b))
        }
        ParamKind::Str => {
            let bytes = B64
                .decode(next()?.trim())
                .map_err(|e| format!("bad string framing: {e}"))?;
            let s = String::from_utf8(bytes).map_err(|e| format!("bad utf-8: {e}"))?;
            Ok(Value::from(s))
        }
        ParamKind::IntList => {
            let line = next()?;
            let mut parts = line.split_whitespace();
            let n: usize = parts
                .next()
                .ok_or("missing list length")?
                .parse()
                .map_err(|e| format!("bad list length: {e}"))?;
            let xs: Vec<i64> = parts
                .map(|p| p.parse::<i64>().map_err(|e| format!("bad i64: {e}")))
                .collect::<Result<_, _>>()?;
            if xs.len() != n {
                return Err(format!("list length mismatch: {n} declared, {} found", xs.len()));
            }
            Ok(Value::from(xs))
        }
        ParamKind::StrList => {
            let n: usize = next()?
                .trim()
                .parse()
                .map_err(|e| format!("bad list length: {e}"))?;
            let mut xs = Vec::with_capacity(n);
            for _ in 0..n {
                let bytes = B64
                    .decode(next()?.trim())
                    .map_err(|e| format!("bad string framing: {e}"))?;
                xs.push(String::from_utf8(bytes).map_err(|e| format!("bad utf-8: {e}"))?);
            }
            Ok(Value::from(xs))
        }
    }
}

/// The resolved entry point of a submission: fixed naming convention, typed
/// parameter list, optional return kind (`None` = unit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySignature {
    pub name: String,
    pub params: Vec<ParamKind>,
    pub ret: Option<ParamKind>,
}

impl EntrySignature {
    /// Resolves `fn <entry>` among the top-level items of the parsed
    /// submission and maps its declared parameter and return types.
    pub fn extract(file: &syn::File, entry: &str) -> Result<Self, String> {
        let func = file
            .items
            .iter()
            .find_map(|item| match item {
                syn::Item::Fn(f) if f.sig.ident == entry => Some(f),
                _ => None,
            })
            .ok_or_else(|| format!("no function `{entry}` found in submission"))?;

        if func.sig.asyncness.is_some() {
            return Err(format!("entry function `{entry}` must not be async"));
        }
        if !func.sig.generics.params.is_empty() {
            return Err(format!("entry function `{entry}` must not be generic"));
        }

        let mut params = Vec::new();
        for input in &func.sig.inputs {
            match input {
                syn::FnArg::Typed(pat) => {
                    let ty = &pat.ty;
                    let kind = ParamKind::from_type(ty).ok_or_else(|| {
                        format!(
                            "unsupported parameter type `{}` on `{entry}`",
                            quote::quote!(#ty).to_string().replace(' ', "")
                        )
                    })?;
                    params.push(kind);
                }
                syn::FnArg::Receiver(_) => {
                    return Err(format!("entry function `{entry}` must be free-standing"));
                }
            }
        }

        let ret = match &func.sig.output {
            syn::ReturnType::Default => None,
            syn::ReturnType::Type(_, ty) => Some(ParamKind::from_type(ty).ok_or_else(|| {
                format!(
                    "unsupported return type `{}` on `{entry}`",
                    quote::quote!(#ty).to_string().replace(' ', "")
                )
            })?),
        };

        Ok(Self {
            name: entry.to_string(),
            params,
            ret,
        })
    }

    /// Fails fast when a test case's arguments cannot be converted to the
    /// declared parameters: wrong arity is rejected before any invocation,
    /// never truncated or padded.
    pub fn validate_args(&self, args: &[Value]) -> Result<(), String> {
        if args.len() != self.params.len() {
            return Err(format!(
                "arity mismatch: `{}` declares {} parameter(s), test case supplies {}",
                self.name,
                self.params.len(),
                args.len()
            ));
        }
        for (i, (kind, value)) in self.params.iter().zip(args).enumerate() {
            if !kind.accepts(value) {
                return Err(format!(
                    "argument {i} of `{}` is not a {}",
                    self.name,
                    kind.rust_type()
                ));
            }
        }
        Ok(())
    }
}

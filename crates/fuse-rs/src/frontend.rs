//! Textual front-end for building fusions.
//!
//! The format names one fusion, its parameters and a list of statements,
//! one per line:
//!
//! ```text
//! fusion add_two(T0: tensor<f32, 2>, T1: tensor<f32, 2>) {
//!   %2 = add(T1, 2.0)
//!   %3 = add(T0, %2)
//!   output %3
//! }
//! ```
//!
//! Parameters are tensors (`tensor<dtype, rank>`, with fresh symbolic
//! extents) or scalars (`f32`, `i64`, `bool`). Operands are value names,
//! with or without a leading `%`, or scalar literals. Reductions and
//! broadcasts take a bracketed list (`sum(%2, [1])`,
//! `broadcast(%3, [false, true])`) and `cast` takes a target dtype.
//! Text after `//` is ignored.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::error::FusionError;
use crate::ir::{self, BinaryOp, DataType, Fusion, TernaryOp, UnaryOp, ValId};

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("{0}")]
    Message(String),
    #[error("line {line}: {message}")]
    Statement { line: usize, message: String },
    #[error(transparent)]
    Fusion(#[from] FusionError),
}

impl FrontendError {
    fn new(msg: impl Into<String>) -> Self {
        FrontendError::Message(msg.into())
    }

    fn at(line: usize, msg: impl Into<String>) -> Self {
        FrontendError::Statement {
            line,
            message: msg.into(),
        }
    }
}

/// Name of a parsed fusion and the value bound to each textual name.
#[derive(Debug, Clone, Default)]
pub struct FusionSymbols {
    pub name: String,
    pub values: HashMap<String, ValId>,
}

impl FusionSymbols {
    /// Value bound to `name`; a leading `%` is optional.
    pub fn get(&self, name: &str) -> Option<ValId> {
        self.values.get(normalize_value_name(name)).copied()
    }
}

/// Fusion built from text together with its symbol table.
#[derive(Debug)]
pub struct ParsedFusion {
    pub fusion: Fusion,
    pub symbols: FusionSymbols,
}

/// Parses `src` into a new fusion.
///
/// # Example
/// ```
/// use fuse_rs::frontend::parse_fusion;
///
/// let parsed = parse_fusion(r#"
/// fusion scale(T0: tensor<f32, 1>, f1: f32) {
///   %2 = mul(T0, f1)
///   output %2
/// }
/// "#).expect("valid fusion");
/// assert_eq!(parsed.symbols.name, "scale");
/// assert_eq!(parsed.fusion.inputs().len(), 2);
/// assert_eq!(parsed.fusion.outputs().len(), 1);
/// ```
pub fn parse_fusion(src: &str) -> Result<ParsedFusion, FrontendError> {
    let mut fusion = Fusion::new();
    let symbols = Parser::new(src).parse(&mut fusion)?;
    Ok(ParsedFusion { fusion, symbols })
}

/// Parses `src` into the fusion active on the current thread.
///
/// On a parse error every node, input and output the parse added is
/// dropped again, leaving the active fusion as it was.
pub fn parse_into_active(src: &str) -> Result<FusionSymbols, FrontendError> {
    let parser = Parser::new(src);
    ir::with_active_fusion(|fusion| {
        let checkpoint = fusion.checkpoint();
        let parsed = parser.parse(fusion);
        if parsed.is_err() {
            fusion.rollback(checkpoint);
        }
        Ok(parsed)
    })?
}

struct Parameter {
    name: String,
    ty: String,
}

struct Parser<'a> {
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    fn parse(&self, fusion: &mut Fusion) -> Result<FusionSymbols, FrontendError> {
        let trimmed = self.source.trim();
        if trimmed.is_empty() {
            return Err(FrontendError::new("input is empty"));
        }
        let header_end = trimmed
            .find('{')
            .ok_or_else(|| FrontendError::new("missing `{` to start fusion body"))?;
        let body_end = trimmed
            .rfind('}')
            .ok_or_else(|| FrontendError::new("missing `}` to end fusion body"))?;
        if body_end < header_end {
            return Err(FrontendError::new("fusion body is not enclosed in `{ }`"));
        }
        if !trimmed[body_end + 1..].trim().is_empty() {
            return Err(FrontendError::new("unexpected text after fusion body"));
        }
        let (name, params) = self.parse_header(trimmed[..header_end].trim())?;

        let mut symbols = FusionSymbols {
            name,
            values: HashMap::new(),
        };
        for Parameter { name, ty } in params {
            let val = declare_parameter(fusion, &ty)?;
            fusion.add_input(val)?;
            if symbols.values.insert(name.clone(), val).is_some() {
                return Err(FrontendError::new(format!("parameter `{name}` declared twice")));
            }
        }

        let leading = self.source.len() - self.source.trim_start().len();
        let first_line = self.source[..leading + header_end].matches('\n').count() + 1;
        let body = &trimmed[header_end + 1..body_end];
        self.parse_body(body, first_line, fusion, &mut symbols.values)?;
        debug!(
            "parsed fusion {} with {} inputs and {} outputs",
            symbols.name,
            fusion.inputs().len(),
            fusion.outputs().len()
        );
        Ok(symbols)
    }

    fn parse_header(&self, header: &str) -> Result<(String, Vec<Parameter>), FrontendError> {
        let header = header
            .strip_prefix("fusion")
            .ok_or_else(|| FrontendError::new("header must start with `fusion`"))?
            .trim_start();
        let open_paren = header
            .find('(')
            .ok_or_else(|| FrontendError::new("missing `(` in fusion header"))?;
        let close_paren = find_matching(header, open_paren, '(', ')')
            .ok_or_else(|| FrontendError::new("missing `)` to close parameter list"))?;
        let name = header[..open_paren].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(FrontendError::new(format!("invalid fusion name `{name}`")));
        }
        if !header[close_paren + 1..].trim().is_empty() {
            return Err(FrontendError::new("unexpected text after parameter list"));
        }
        let params = self.parse_parameters(&header[open_paren + 1..close_paren])?;
        Ok((name.to_string(), params))
    }

    fn parse_parameters(&self, params: &str) -> Result<Vec<Parameter>, FrontendError> {
        split_top_level(params, ',')
            .into_iter()
            .map(|decl| {
                let (name, ty) = decl
                    .split_once(':')
                    .ok_or_else(|| FrontendError::new("parameter must be `name: type`"))?;
                let name = normalize_value_name(name.trim());
                if name.is_empty() {
                    return Err(FrontendError::new("parameter name cannot be empty"));
                }
                let ty = ty.trim();
                if ty.is_empty() {
                    return Err(FrontendError::new(format!(
                        "parameter `{name}` has no type"
                    )));
                }
                Ok(Parameter {
                    name: name.to_string(),
                    ty: ty.to_string(),
                })
            })
            .collect()
    }

    fn parse_body(
        &self,
        body: &str,
        first_line: usize,
        fusion: &mut Fusion,
        values: &mut HashMap<String, ValId>,
    ) -> Result<(), FrontendError> {
        let mut saw_output = false;
        for (offset, raw) in body.lines().enumerate() {
            let line = first_line + offset;
            let statement = strip_comment(raw).trim().trim_end_matches(';').trim();
            if statement.is_empty() {
                continue;
            }
            if let Some(rest) = statement.strip_prefix("output") {
                if !rest.starts_with(char::is_whitespace) {
                    return Err(FrontendError::at(line, "malformed `output` statement"));
                }
                let names = split_top_level(rest, ',');
                if names.is_empty() {
                    return Err(FrontendError::at(
                        line,
                        "`output` must reference at least one value",
                    ));
                }
                for name in names {
                    let val = lookup(values, name).map_err(|msg| FrontendError::at(line, msg))?;
                    fusion.add_output(val)?;
                }
                saw_output = true;
                continue;
            }
            self.parse_statement(statement, fusion, values)
                .map_err(|err| match err {
                    FrontendError::Message(message) => FrontendError::Statement { line, message },
                    other => other,
                })?;
        }
        if !saw_output {
            return Err(FrontendError::new(
                "fusion body must declare at least one `output`",
            ));
        }
        Ok(())
    }

    fn parse_statement(
        &self,
        statement: &str,
        fusion: &mut Fusion,
        values: &mut HashMap<String, ValId>,
    ) -> Result<(), FrontendError> {
        let (result_raw, rest) = statement
            .split_once('=')
            .ok_or_else(|| FrontendError::new("statements must be of the form `%name = op(...)`"))?;
        let result_name = normalize_value_name(result_raw.trim());
        if result_name.is_empty() {
            return Err(FrontendError::new("result name cannot be empty"));
        }
        if values.contains_key(result_name) {
            return Err(FrontendError::new(format!(
                "`{result_name}` is already defined"
            )));
        }

        let rest = rest.trim();
        let open_paren = rest
            .find('(')
            .ok_or_else(|| FrontendError::new("missing `(` after operation name"))?;
        let close_paren = find_matching(rest, open_paren, '(', ')')
            .ok_or_else(|| FrontendError::new("missing `)` to close operand list"))?;
        if !rest[close_paren + 1..].trim().is_empty() {
            return Err(FrontendError::new("unexpected text after operand list"));
        }
        let op_name = rest[..open_paren].trim();
        let args = split_top_level(&rest[open_paren + 1..close_paren], ',');

        let result = build_operation(op_name, &args, fusion, values)?;
        values.insert(result_name.to_string(), result);
        Ok(())
    }
}

fn build_operation(
    op_name: &str,
    args: &[&str],
    fusion: &mut Fusion,
    values: &HashMap<String, ValId>,
) -> Result<ValId, FrontendError> {
    if let Some(op) = parse_binary_op(op_name) {
        let [lhs, rhs] = expect_args::<2>(op_name, args)?;
        let lhs = resolve_operand(fusion, values, lhs)?;
        let rhs = resolve_operand(fusion, values, rhs)?;
        return Ok(fusion.binary_op(op, lhs, rhs)?);
    }
    if let Some(op) = parse_unary_op(op_name) {
        let [input] = expect_args::<1>(op_name, args)?;
        let input = resolve_operand(fusion, values, input)?;
        return Ok(fusion.unary_op(op, input)?);
    }
    match op_name {
        "where" => {
            let [cond, on_true, on_false] = expect_args::<3>(op_name, args)?;
            let cond = resolve_operand(fusion, values, cond)?;
            let on_true = resolve_operand(fusion, values, on_true)?;
            let on_false = resolve_operand(fusion, values, on_false)?;
            Ok(fusion.ternary_op(TernaryOp::Where, cond, on_true, on_false)?)
        }
        "sum" => {
            let [input, axes] = expect_args::<2>(op_name, args)?;
            let input = resolve_operand(fusion, values, input)?;
            let axes = parse_list(axes, |item| {
                item.parse::<i64>()
                    .map_err(|_| format!("invalid axis `{item}`"))
            })?;
            Ok(fusion.sum(input, &axes)?)
        }
        "broadcast" => {
            let [input, mask] = expect_args::<2>(op_name, args)?;
            let input = resolve_operand(fusion, values, input)?;
            let mask = parse_list(mask, |item| match item {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(format!("broadcast mask entries are booleans, got `{other}`")),
            })?;
            Ok(fusion.broadcast(input, &mask)?)
        }
        "cast" => {
            let [input, dtype] = expect_args::<2>(op_name, args)?;
            let input = resolve_operand(fusion, values, input)?;
            let dtype = parse_dtype(dtype)?;
            Ok(fusion.cast(input, dtype)?)
        }
        other => Err(FrontendError::new(format!("unknown operation `{other}`"))),
    }
}

fn parse_binary_op(name: &str) -> Option<BinaryOp> {
    Some(match name {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "div" => BinaryOp::Div,
        "mod" => BinaryOp::Mod,
        "ceildiv" => BinaryOp::CeilDiv,
        "max" => BinaryOp::Max,
        "min" => BinaryOp::Min,
        "lt" => BinaryOp::Lt,
        "eq" => BinaryOp::Eq,
        _ => return None,
    })
}

fn parse_unary_op(name: &str) -> Option<UnaryOp> {
    Some(match name {
        "neg" => UnaryOp::Neg,
        "abs" => UnaryOp::Abs,
        "exp" => UnaryOp::Exp,
        "sqrt" => UnaryOp::Sqrt,
        "set" => UnaryOp::Set,
        "rand_like" => UnaryOp::RandLike,
        _ => return None,
    })
}

fn expect_args<'s, const N: usize>(
    op_name: &str,
    args: &[&'s str],
) -> Result<[&'s str; N], FrontendError> {
    <[&'s str; N]>::try_from(args).map_err(|_| {
        FrontendError::new(format!(
            "`{op_name}` takes {N} operands, got {}",
            args.len()
        ))
    })
}

fn declare_parameter(fusion: &mut Fusion, ty: &str) -> Result<ValId, FrontendError> {
    if let Some(inner) = ty
        .strip_prefix("tensor<")
        .and_then(|rest| rest.strip_suffix('>'))
    {
        let (dtype, rank) = inner
            .split_once(',')
            .ok_or_else(|| FrontendError::new(format!("tensor type `{ty}` needs a rank")))?;
        let dtype = parse_dtype(dtype)?;
        let rank = rank
            .trim()
            .parse::<usize>()
            .map_err(|_| FrontendError::new(format!("invalid tensor rank in `{ty}`")))?;
        if rank == 0 {
            return Err(FrontendError::new("tensor parameters need at least one axis"));
        }
        return Ok(fusion.new_dims_tensor(rank, dtype));
    }
    Ok(fusion.new_scalar(parse_dtype(ty)?))
}

fn parse_dtype(src: &str) -> Result<DataType, FrontendError> {
    match src.trim() {
        "f32" => Ok(DataType::Float),
        "i64" => Ok(DataType::Int),
        "bool" => Ok(DataType::Bool),
        other => Err(FrontendError::new(format!("unsupported dtype `{other}`"))),
    }
}

/// Value name or literal: `true`/`false`, integers, and floats (a `.`, an
/// exponent, `inf` or `nan` makes a literal a float).
fn resolve_operand(
    fusion: &mut Fusion,
    values: &HashMap<String, ValId>,
    token: &str,
) -> Result<ValId, FrontendError> {
    let token = token.trim();
    match token {
        "true" => return Ok(fusion.new_bool(true)),
        "false" => return Ok(fusion.new_bool(false)),
        _ => {}
    }
    let starts_numeric = token
        .trim_start_matches('-')
        .starts_with(|c: char| c.is_ascii_digit() || c == '.');
    if starts_numeric {
        if let Ok(int) = token.parse::<i64>() {
            return Ok(fusion.new_int(int));
        }
        return token
            .parse::<f64>()
            .map(|float| fusion.new_float(float))
            .map_err(|_| FrontendError::new(format!("invalid literal `{token}`")));
    }
    if let Ok(float) = token.parse::<f64>() {
        return Ok(fusion.new_float(float));
    }
    lookup(values, token).map_err(FrontendError::new)
}

fn lookup(values: &HashMap<String, ValId>, token: &str) -> Result<ValId, String> {
    let name = normalize_value_name(token.trim());
    values
        .get(name)
        .copied()
        .ok_or_else(|| format!("unknown value `{name}`"))
}

fn parse_list<T>(
    src: &str,
    parse_item: impl Fn(&str) -> Result<T, String>,
) -> Result<Vec<T>, FrontendError> {
    let inner = src
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| FrontendError::new(format!("expected a `[...]` list, got `{src}`")))?;
    split_top_level(inner, ',')
        .into_iter()
        .map(|item| parse_item(item).map_err(FrontendError::new))
        .collect()
}

fn normalize_value_name(name: &str) -> &str {
    name.trim_start_matches('%')
}

fn strip_comment(line: &str) -> &str {
    line.split_once("//").map_or(line, |(code, _)| code)
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, ch) in src[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + idx);
            }
        }
    }
    None
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                let piece = input[start..idx].trim();
                if !piece.is_empty() {
                    pieces.push(piece);
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail);
    }
    pieces
}

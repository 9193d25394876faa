//! Text forms of the IR and of lowered kernels.
//!
//! IR values print by handle (`T3`, `f5`, `i7`), tensors with their leaf
//! axes and compute-at link, axes as `iS{i1}` / `rthreadIdx.x{128}`. Scalars
//! printed inline expand their origin: `( ceilDiv(i1, 4) )`.
//!
//! Kernel text follows the CUDA dialect the runtime expects: one
//! `__global__` function taking `Tensor<T, N>` arguments, plus a device
//! helper per reduction operator.

use std::fmt::Write as _;

use crate::error::{FusionError, FusionResult};
use crate::ir::{
    BinaryOp, DataType, Expr, ExprId, ExprKind, Fusion, IterDomainId, ScalarValue,
    TernaryOp, Transform, UnaryOp, ValId,
};
use crate::lower::{
    count_stmts, Buffer, KExpr, Kernel, ParamKind, ReduceTarget, Stmt, TensorRef,
};

const ASSIGN_INDENT: &str = "   ";

pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        }
    } else {
        format!("float({value})")
    }
}

fn push_line(out: &mut String, indent: usize, line: &str) {
    let pad = "  ".repeat(indent);
    for part in line.split('\n') {
        out.push_str(&pad);
        out.push_str(part);
        out.push('\n');
    }
}

fn format_constant(value: ScalarValue) -> String {
    match value {
        ScalarValue::Int(v) => v.to_string(),
        ScalarValue::Float(v) => format_float(v),
        ScalarValue::Bool(v) => format!("bool({v})"),
    }
}

fn unary_call(op: UnaryOp, dtype: DataType, operand: &str) -> String {
    match op {
        UnaryOp::Cast => format!("({dtype}){operand}"),
        op => match op.inline_str() {
            Some(symbol) => format!("{symbol}{operand}"),
            None => format!("{op}({operand})"),
        },
    }
}

fn binary_inline(op: BinaryOp, lhs: &str, rhs: &str) -> String {
    match op.inline_str() {
        Some(symbol) => format!("{lhs} {symbol} {rhs}"),
        None => format!("{op}({lhs}, {rhs})"),
    }
}

// -------------------------------------------------------------------------
// IR
// -------------------------------------------------------------------------

/// Scalar or tensor by handle; constants print their value.
pub fn print_val(fusion: &Fusion, val: ValId) -> FusionResult<String> {
    let value = fusion.val(val)?;
    if value.is_tensor() {
        return print_tensor_view(fusion, val);
    }
    Ok(match value.constant() {
        Some(constant) => format_constant(constant),
        None => value.label(),
    })
}

/// Like [`print_val`], but scalars computed by an operation print it.
pub fn print_inline(fusion: &Fusion, val: ValId) -> FusionResult<String> {
    let value = fusion.val(val)?;
    if value.is_tensor() || value.constant().is_some() {
        return print_val(fusion, val);
    }
    let Some(origin) = fusion.origin(val) else {
        return Ok(value.label());
    };
    let expr = fusion.expr(origin)?;
    let operands = expr
        .inputs
        .iter()
        .map(|v| print_inline(fusion, *v))
        .collect::<FusionResult<Vec<_>>>()?;
    let body = match (&expr.kind, operands.as_slice()) {
        (ExprKind::Unary(op), [x]) => unary_call(*op, value.dtype(), x),
        (ExprKind::Binary(op), [a, b]) => binary_inline(*op, a, b),
        (ExprKind::Ternary(op), [a, b, c]) => format!("{op}({a}, {b}, {c})"),
        _ => return Err(unprintable(fusion, origin)),
    };
    Ok(format!("( {body} )"))
}

fn unprintable(fusion: &Fusion, expr: ExprId) -> FusionError {
    let kind = fusion
        .expr(expr)
        .map(|e| format!("{:?}", e.kind))
        .unwrap_or_default();
    FusionError::unsupported(format!("cannot print operation {kind} inline"))
}

pub fn print_iter_domain(fusion: &Fusion, id: IterDomainId) -> FusionResult<String> {
    let axis = fusion.iter_domain(id)?;
    let mut out = String::new();
    out.push(if axis.is_reduction() {
        'r'
    } else if axis.is_broadcast() {
        'b'
    } else {
        'i'
    });
    let _ = write!(out, "{}", axis.parallel);
    let extent = print_inline(fusion, axis.extent)?;
    if fusion.scalar(axis.start)?.as_int() == Some(0) {
        let _ = write!(out, "{{{extent}}}");
    } else {
        let start = print_inline(fusion, axis.start)?;
        let _ = write!(out, "{{{start} : {extent}}}");
    }
    if axis.rfactor_product {
        out.push_str("rf");
    }
    Ok(out)
}

pub fn print_tensor_view(fusion: &Fusion, tv: ValId) -> FusionResult<String> {
    let view = fusion.tensor_view(tv)?;
    let axes = view
        .domain
        .leaf
        .iter()
        .map(|id| print_iter_domain(fusion, *id))
        .collect::<FusionResult<Vec<_>>>()?;
    let mut out = format!("{}[ {} ]", fusion.label(tv), axes.join(", "));
    if let Some(ca) = &view.compute_at {
        let _ = write!(out, " compute_at( {}, {} )", fusion.label(ca.view), ca.axis);
    }
    Ok(out)
}

/// Fails unless `expr` is a single-output operation over scalars only.
pub fn check_inlineable(fusion: &Fusion, expr: &Expr) -> FusionResult<()> {
    let scalar_inputs = expr
        .inputs
        .iter()
        .all(|v| fusion.val(*v).map(|v| v.is_scalar()).unwrap_or(false));
    let scalar_output = expr
        .output()
        .is_some_and(|v| fusion.val(v).map(|v| v.is_scalar()).unwrap_or(false));
    if !scalar_inputs || !scalar_output {
        return Err(FusionError::unsupported(format!(
            "operation {} cannot be printed inline: it reads or writes tensors",
            expr.name
        )));
    }
    Ok(())
}

/// Statement form of one operation.
pub fn print_expr(fusion: &Fusion, id: ExprId) -> FusionResult<String> {
    let expr = fusion.expr(id)?;
    let out_val = expr
        .output()
        .ok_or_else(|| FusionError::unsupported(format!("operation {} has no single output", expr.name)))?;
    let out = print_val(fusion, out_val)?;
    let operands = expr
        .inputs
        .iter()
        .map(|v| print_val(fusion, *v))
        .collect::<FusionResult<Vec<_>>>()?;
    if check_inlineable(fusion, expr).is_ok() {
        let body = match (&expr.kind, operands.as_slice()) {
            (ExprKind::Unary(op), [x]) => unary_call(*op, fusion.val(out_val)?.dtype(), x),
            (ExprKind::Binary(op), [a, b]) => binary_inline(*op, a, b),
            (ExprKind::Ternary(op), [a, b, c]) => format!("{op}({a}, {b}, {c})"),
            _ => return Err(unprintable(fusion, id)),
        };
        return Ok(format!("{out} = {body};"));
    }
    let dtype = fusion.val(out_val)?.dtype();
    Ok(match (&expr.kind, operands.as_slice()) {
        (ExprKind::Unary(op), [x]) => {
            format!("{out}\n{ASSIGN_INDENT}= {};", unary_call(*op, dtype, x))
        }
        (ExprKind::Binary(op), [a, b]) => match op.inline_str() {
            Some(symbol) => format!("{out}\n{ASSIGN_INDENT}= {a}\n{ASSIGN_INDENT}{symbol} {b};"),
            None => format!("{out}\n{ASSIGN_INDENT}= {op}({a}\n{ASSIGN_INDENT}, {b});"),
        },
        (ExprKind::Ternary(op), [a, b, c]) => format!(
            "{out}\n{ASSIGN_INDENT}= {op}({a}\n{ASSIGN_INDENT}, {b}\n{ASSIGN_INDENT}, {c});"
        ),
        (ExprKind::Reduction { op, init }, [x]) => format!(
            "{out} = reduction( {x}, op = {op}, initial value = {} );",
            print_val(fusion, *init)?
        ),
        (ExprKind::Broadcast { .. }, [x]) => format!("{out}\n{ASSIGN_INDENT}= {x};"),
        _ => return Err(unprintable(fusion, id)),
    })
}

/// Every operation the outputs depend on, in topological order.
pub fn print_math(fusion: &Fusion) -> FusionResult<String> {
    let mut out = String::from("\n%kernel_math {\n");
    for expr in fusion.exprs(true, false)? {
        push_line(&mut out, 0, &print_expr(fusion, expr)?);
    }
    out.push_str("}\n");
    Ok(out)
}

pub fn print_transform(fusion: &Fusion, t: &Transform) -> FusionResult<String> {
    Ok(match *t {
        Transform::Split {
            input,
            outer,
            inner,
            factor,
        } => format!(
            "Split: {} by factor {} -> {}, {}",
            print_iter_domain(fusion, input)?,
            print_val(fusion, factor)?,
            print_iter_domain(fusion, outer)?,
            print_iter_domain(fusion, inner)?
        ),
        Transform::Merge {
            outer,
            inner,
            output,
        } => format!(
            "Merge: {} and {} -> {}",
            print_iter_domain(fusion, outer)?,
            print_iter_domain(fusion, inner)?,
            print_iter_domain(fusion, output)?
        ),
    })
}

/// Split/merge history of every tensor the outputs depend on.
pub fn print_transforms(fusion: &Fusion) -> FusionResult<String> {
    let mut out = String::from("\n%kernel_transforms {\n");
    for val in fusion.used_math_vals() {
        let Ok(view) = fusion.tensor_view(val) else {
            continue;
        };
        if view.domain.history.is_empty() {
            continue;
        }
        push_line(&mut out, 0, &format!("{}:", fusion.label(val)));
        for t in &view.domain.history {
            push_line(&mut out, 1, &print_transform(fusion, t)?);
        }
    }
    out.push_str("}\n");
    Ok(out)
}

// -------------------------------------------------------------------------
// Kernels
// -------------------------------------------------------------------------

fn tensor_ref(r: &TensorRef) -> String {
    let terms: Vec<String> = r.terms.iter().map(kexpr).collect();
    if terms.is_empty() {
        format!("T{}[ 0 ]", r.name)
    } else {
        format!("T{}[ {} ]", r.name, terms.join(" + "))
    }
}

/// Inline form of a kernel expression.
pub fn kexpr(e: &KExpr) -> String {
    match e {
        KExpr::Int(v) => v.to_string(),
        KExpr::Float(v) => format_float(*v),
        KExpr::Bool(v) => v.to_string(),
        KExpr::Index(n) => format!("i{n}"),
        KExpr::ParallelIndex(pt) => pt.index_name().unwrap_or_default().to_string(),
        KExpr::ParallelDim(pt) => pt.dim_name().unwrap_or_default().to_string(),
        KExpr::Size { name, dim, .. } => format!("T{name}.size[{dim}]"),
        KExpr::Stride { name, dim, .. } => format!("T{name}.stride[{dim}]"),
        KExpr::ScalarArg { label, .. } => label.clone(),
        KExpr::Unary(op, dtype, x) => unary_call(*op, *dtype, &kexpr(x)),
        KExpr::Binary(op, a, b) => match op.inline_str() {
            Some(symbol) => format!("( {} {symbol} {} )", kexpr(a), kexpr(b)),
            None => format!("{op}({}, {})", kexpr(a), kexpr(b)),
        },
        KExpr::Ternary(TernaryOp::Where, a, b, c) => {
            format!("where({}, {}, {})", kexpr(a), kexpr(b), kexpr(c))
        }
        KExpr::All(terms) => {
            let terms: Vec<String> = terms.iter().map(kexpr).collect();
            format!("( {} )", terms.join(" && "))
        }
        KExpr::Load(r) => tensor_ref(r),
        KExpr::Rand => "randLike(rnd)".to_string(),
    }
}

fn assign_value(value: &KExpr) -> String {
    match value {
        KExpr::Binary(op, a, b) => match op.inline_str() {
            Some(symbol) => format!(
                "{ASSIGN_INDENT}= {}\n{ASSIGN_INDENT}{symbol} {};",
                kexpr(a),
                kexpr(b)
            ),
            None => format!("{ASSIGN_INDENT}= {op}({}\n{ASSIGN_INDENT}, {});", kexpr(a), kexpr(b)),
        },
        other => format!("{ASSIGN_INDENT}= {};", kexpr(other)),
    }
}

fn reduction_helper(op: BinaryOp, dtype: DataType) -> String {
    format!("reduction_{op}_{dtype}")
}

fn flags(values: &[bool]) -> String {
    values
        .iter()
        .map(bool::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn predicate_arg(pred: &Option<KExpr>) -> String {
    pred.as_ref()
        .map(|p| format!(", {}", kexpr(p)))
        .unwrap_or_default()
}

fn print_stmt(out: &mut String, indent: usize, stmt: &Stmt) {
    match stmt {
        Stmt::ForLoop {
            index,
            start,
            extent,
            unroll,
            body,
        } => {
            if *unroll {
                push_line(out, indent, "#pragma unroll");
            }
            push_line(
                out,
                indent,
                &format!(
                    "for(size_t i{index} = {}; i{index} < {}; ++i{index} ) {{",
                    kexpr(start),
                    kexpr(extent)
                ),
            );
            for s in body {
                print_stmt(out, indent + 1, s);
            }
            push_line(out, indent, "}");
        }
        Stmt::IfThenElse {
            cond,
            then_body,
            else_body,
        } => {
            push_line(out, indent, &format!("if ( {} ) {{ ", kexpr(cond)));
            for s in then_body {
                print_stmt(out, indent + 1, s);
            }
            if !else_body.is_empty() {
                push_line(out, indent, "} else { ");
                for s in else_body {
                    print_stmt(out, indent + 1, s);
                }
            }
            push_line(out, indent, "}");
        }
        Stmt::Allocate {
            buffer,
            dtype,
            size,
            init,
        } => {
            let line = match (buffer, init) {
                (Buffer::BlockResult, Some(init)) => {
                    format!("{dtype} block_result = {};", kexpr(init))
                }
                (Buffer::BlockResult, None) => format!("{dtype} block_result;"),
                (Buffer::Tensor(name), _) => format!("{dtype} T{name}[{}];", kexpr(size)),
            };
            push_line(out, indent, &line);
        }
        Stmt::Assign { target, value } => {
            push_line(
                out,
                indent,
                &format!("{}\n{}", tensor_ref(target), assign_value(value)),
            );
        }
        Stmt::BlockReduce {
            op,
            dtype,
            threads,
            target,
            input,
            pred,
        } => {
            let target = match target {
                ReduceTarget::Tensor(r) => tensor_ref(r),
                ReduceTarget::BlockResult => "block_result".to_string(),
            };
            push_line(
                out,
                indent,
                &format!(
                    "blockReduce< {} > ( {target}, {}, {}, threadIdx, blockDim, reinterpret_cast<{dtype}*>(shared_mem){});",
                    flags(threads),
                    kexpr(input),
                    reduction_helper(*op, *dtype),
                    predicate_arg(pred)
                ),
            );
        }
        Stmt::GridReduce {
            op,
            dtype,
            blocks,
            threads,
            target,
            input,
            pred,
        } => {
            let input = input
                .as_ref()
                .map(kexpr)
                .unwrap_or_else(|| "block_result".to_string());
            let dims: Vec<bool> = blocks.iter().chain(threads.iter()).copied().collect();
            push_line(
                out,
                indent,
                &format!(
                    "reduction::gridReduce< {} > ( {}, {input}, {}, static_cast<{dtype}*>(work_buf), sync_flags, reinterpret_cast<{dtype}*>(shared_mem){});",
                    flags(&dims),
                    tensor_ref(target),
                    reduction_helper(*op, *dtype),
                    predicate_arg(pred)
                ),
            );
        }
    }
}

fn shared_slot_type(kernel: &Kernel) -> DataType {
    let int_reductions = count_stmts(&kernel.body, &|s| {
        matches!(
            s,
            Stmt::BlockReduce {
                dtype: DataType::Int,
                ..
            } | Stmt::GridReduce {
                dtype: DataType::Int,
                ..
            }
        )
    });
    if int_reductions > 0 {
        DataType::Int
    } else {
        DataType::Float
    }
}

/// Complete source of a lowered kernel.
pub fn kernel_source(kernel: &Kernel) -> String {
    let mut out = String::new();
    for (op, dtype) in &kernel.reduction_ops {
        push_line(
            &mut out,
            0,
            &format!(
                "__device__ void {}({dtype}& a, const {dtype} b) {{",
                reduction_helper(*op, *dtype)
            ),
        );
        push_line(&mut out, 1, &format!("a = {};", binary_inline(*op, "a", "b")));
        push_line(&mut out, 0, "}");
    }

    let mut params: Vec<String> = kernel
        .params
        .iter()
        .map(|p| match p.kind {
            ParamKind::Tensor { dtype, ndims } => format!("Tensor<{dtype}, {ndims}> {}", p.label),
            ParamKind::Scalar { dtype } => format!("{dtype} {}", p.label),
        })
        .collect();
    if kernel.has_rng {
        params.push("unsigned long long seed".to_string());
        params.push("unsigned long long offset".to_string());
    }
    if kernel.has_grid_reduction {
        params.push("void* work_buf".to_string());
        params.push("unsigned* sync_flags".to_string());
    }
    push_line(
        &mut out,
        0,
        &format!("__global__ void {}({}){{", kernel.name, params.join(", ")),
    );
    if kernel.has_rng {
        push_line(&mut out, 1, "int idx = blockIdx.x*blockDim.x + threadIdx.x;");
        push_line(&mut out, 1, "Philox rnd(seed, idx, offset);");
    }
    if kernel.has_block_reduction || kernel.has_grid_reduction {
        // One slot per thread of a block, typed for the widest reduction.
        let slot = shared_slot_type(kernel);
        push_line(&mut out, 1, &format!("__shared__ {slot} shared_mem[1024];"));
    }
    for stmt in &kernel.body {
        print_stmt(&mut out, 1, stmt);
    }
    push_line(&mut out, 0, "}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_print_as_constructor_calls() {
        assert_eq!(format_float(2.0), "float(2)");
        assert_eq!(format_float(0.5), "float(0.5)");
        assert_eq!(format_float(f64::NEG_INFINITY), "-INFINITY");
    }

    #[test]
    fn derived_extents_print_with_their_definition() {
        let mut fusion = Fusion::new();
        let tv = fusion.new_dims_tensor(1, DataType::Float);
        fusion.split(tv, 0, 4).expect("split");
        let outer = fusion.tensor_view(tv).expect("tensor").domain.leaf[0];
        let printed = print_iter_domain(&fusion, outer).expect("print");
        assert!(printed.starts_with("iS{( ceilDiv(i"), "got {printed}");
        assert!(printed.ends_with(", 4) )}"), "got {printed}");
    }

    #[test]
    fn tensor_ops_are_not_inlineable() {
        let mut fusion = Fusion::new();
        let tv = fusion.new_dims_tensor(1, DataType::Float);
        let out = fusion.neg(tv).expect("neg");
        let origin = fusion.origin(out).expect("origin");
        let expr = fusion.expr(origin).expect("expr").clone();
        assert!(check_inlineable(&fusion, &expr).is_err());

        let a = fusion.new_scalar(DataType::Int);
        let b = fusion.new_int(3);
        let sum = fusion.add(a, b).expect("add");
        let origin = fusion.origin(sum).expect("origin");
        let expr = fusion.expr(origin).expect("expr").clone();
        assert!(check_inlineable(&fusion, &expr).is_ok());
    }
}

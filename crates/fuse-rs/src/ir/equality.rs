use crate::ir::fusion::Fusion;
use crate::ir::node::{Statement, ValId};

impl Fusion {
    /// Structural equality of two statements.
    ///
    /// Scalars match when they are the same node or equal constants of the
    /// same type; derived values match when their origins apply the same
    /// operator to pairwise matching inputs. Tensors only match themselves.
    pub fn same_as(&self, a: Statement, b: Statement) -> bool {
        match (a, b) {
            (Statement::Val(a), Statement::Val(b)) => self.same_val(a, b),
            (Statement::Expr(a), Statement::Expr(b)) => {
                if a == b {
                    return true;
                }
                let (Ok(lhs), Ok(rhs)) = (self.expr(a), self.expr(b)) else {
                    return false;
                };
                lhs.kind == rhs.kind
                    && lhs.inputs.len() == rhs.inputs.len()
                    && lhs.outputs.len() == rhs.outputs.len()
                    && lhs
                        .inputs
                        .iter()
                        .zip(rhs.inputs.iter())
                        .all(|(x, y)| self.same_val(*x, *y))
            }
            _ => false,
        }
    }

    pub fn same_val(&self, a: ValId, b: ValId) -> bool {
        if a == b {
            return true;
        }
        let (Ok(lhs), Ok(rhs)) = (self.val(a), self.val(b)) else {
            return false;
        };
        let (Some(ls), Some(rs)) = (lhs.as_scalar(), rhs.as_scalar()) else {
            return false;
        };
        if ls.dtype != rs.dtype {
            return false;
        }
        if let (Some(x), Some(y)) = (ls.value, rs.value) {
            return x == y;
        }
        match (self.origin(a), self.origin(b)) {
            (Some(x), Some(y)) => self.same_as(Statement::Expr(x), Statement::Expr(y)),
            _ => false,
        }
    }
}

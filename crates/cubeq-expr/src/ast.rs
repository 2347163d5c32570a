//! AST types for value expressions

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path from the record root
    Field(String),
    Unary { op: UnOp, expr: Box<Expr> },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Call { func: Function, args: Vec<Expr> },
}

impl Expr {
    /// The field path, when the expression is nothing but a field reference
    pub fn as_field(&self) -> Option<&str> {
        match self {
            Expr::Field(name) => Some(name),
            _ => None,
        }
    }

    /// Every field path referenced, in first-seen order
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Unary { expr, .. } => expr.collect_fields(out),
            Expr::Binary { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_fields(out)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Arithmetic
    Add, Sub, Mul, Div, Rem,
    // Comparison
    Eq, Ne, Lt, Le, Gt, Ge,
    // Logical
    And, Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Builtin functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// First non-null argument
    Coalesce,
    Min,
    Max,
    /// `floor(x)` or `floor(x, interval)`
    Floor,
    Concat,
    Length,
    IsNumeric,
    /// Time value to `YYYY-MM`
    YearMonth,
    Now,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "coalesce" => Function::Coalesce,
            "min" => Function::Min,
            "max" => Function::Max,
            "floor" => Function::Floor,
            "concat" => Function::Concat,
            "length" => Function::Length,
            "is_numeric" => Function::IsNumeric,
            "year_month" => Function::YearMonth,
            "now" => Function::Now,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Coalesce => "coalesce",
            Function::Min => "min",
            Function::Max => "max",
            Function::Floor => "floor",
            Function::Concat => "concat",
            Function::Length => "length",
            Function::IsNumeric => "is_numeric",
            Function::YearMonth => "year_month",
            Function::Now => "now",
        }
    }

    /// Accepted argument counts, inclusive
    pub fn arity(self) -> (usize, usize) {
        match self {
            Function::Coalesce | Function::Concat => (1, usize::MAX),
            Function::Min | Function::Max => (2, 2),
            Function::Floor => (1, 2),
            Function::Length | Function::IsNumeric | Function::YearMonth => (1, 1),
            Function::Now => (0, 0),
        }
    }
}

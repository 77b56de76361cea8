//! Expressions.
//!
//! A recursive-descent parser with precedence climbing builds evaluator
//! trees from the tokens inside `{{ }}` and `{% %}` regions, and the same
//! module evaluates those trees per render. Variable paths (dotted
//! attributes, integer indices, subscripts and calls) are resolved here
//! against the execution context.

use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::Error;
use crate::filters::FilterFunction;
use crate::parser::Parser;
use crate::token::{Token, TokenKind};
use crate::value::{natural_cmp, Value, ValueData};

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
    /// Arithmetic identity.
    Pos,
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    In,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "^",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "and",
            Self::Or => "or",
            Self::In => "in",
        }
    }
}

/// One segment of a variable path after the root identifier.
#[derive(Debug)]
pub enum Segment {
    /// `.name`
    Attr(String),
    /// `.0`
    Index(i64),
    /// `[expr]`
    Subscript(Box<Expr>),
    /// `(args...)`
    Call(Vec<Expr>),
}

/// A variable path: a root identifier plus a chain of segments.
#[derive(Debug)]
pub struct VariablePath {
    /// The root identifier looked up in the execution context.
    pub root: String,
    /// The access chain applied to the root value.
    pub segments: Vec<Segment>,
    /// The root token, for error attribution.
    pub token: Token,
}

/// One filter invocation in a chain.
pub struct FilterCall {
    /// The filter name.
    pub name: String,
    /// The token naming the filter.
    pub token: Token,
    /// The parameter after `:`, if any.
    pub param: Option<Expr>,
    /// The function resolved from the set's filter table at parse time.
    pub(crate) func: FilterFunction,
}

impl std::fmt::Debug for FilterCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCall")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("param", &self.param)
            .finish()
    }
}

impl FilterCall {
    fn apply(&self, value: &Value, ctx: &mut ExecutionContext) -> Result<Value, Error> {
        let param = match &self.param {
            Some(expr) => expr.evaluate(ctx)?,
            None => Value::none(),
        };
        (self.func)(value, &param).map_err(|mut e| {
            if !e.sender.starts_with("filter:") {
                e.sender = format!("filter:{}", self.name);
            }
            e.update_from_token(&self.token);
            e.filename.get_or_insert_with(|| ctx.template_name.clone());
            e
        })
    }
}

/// A compiled expression.
#[derive(Debug)]
pub enum Expr {
    /// A literal value.
    Constant(Value),
    /// An array literal.
    List(Vec<Expr>),
    /// A variable path.
    Path(VariablePath),
    /// A primary with a filter chain applied.
    Filtered {
        base: Box<Expr>,
        filters: Vec<FilterCall>,
    },
    /// A unary operation.
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        token: Token,
    },
    /// A binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        token: Token,
    },
    /// `value if cond else other`.
    Ternary {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
}

fn type_name(v: &Value) -> &'static str {
    match &v.data {
        ValueData::None => "nil",
        ValueData::Bool(_) => "bool",
        ValueData::Integer(_) => "integer",
        ValueData::Float(_) => "float",
        ValueData::String(_) => "string",
        ValueData::List(_) => "list",
        ValueData::Map(_) => "map",
        ValueData::DateTime(_) => "datetime",
        ValueData::Object(_) => "struct",
        ValueData::Function(_) => "function",
    }
}

impl Expr {
    /// Evaluates this expression against the execution context.
    pub fn evaluate(&self, ctx: &mut ExecutionContext) -> Result<Value, Error> {
        match self {
            Self::Constant(v) => Ok(v.clone()),
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.evaluate(ctx)?);
                }
                Ok(Value::from(out))
            }
            Self::Path(path) => path.evaluate(ctx),
            Self::Filtered { base, filters } => {
                let mut value = base.evaluate(ctx)?;
                for filter in filters {
                    value = filter.apply(&value, ctx)?;
                }
                Ok(value)
            }
            Self::Unary { op, operand, token } => {
                let value = operand.evaluate(ctx)?;
                match op {
                    UnaryOp::Not => Ok(Value::from(!value.is_truthy())),
                    UnaryOp::Neg => match &value.data {
                        ValueData::Integer(i) => Ok(Value::from(i.wrapping_neg())),
                        ValueData::Float(f) => Ok(Value::from(-f)),
                        _ => Err(Error::new(
                            "execution",
                            format!("invalid operation: unary '-' on {}", type_name(&value)),
                        )
                        .with_token(token)),
                    },
                    UnaryOp::Pos => {
                        if value.is_number() {
                            Ok(value)
                        } else {
                            Err(Error::new(
                                "execution",
                                format!("invalid operation: unary '+' on {}", type_name(&value)),
                            )
                            .with_token(token))
                        }
                    }
                }
            }
            Self::Binary {
                op,
                left,
                right,
                token,
            } => eval_binary(*op, left, right, token, ctx),
            Self::Ternary {
                test,
                if_true,
                if_false,
            } => {
                if test.evaluate(ctx)?.is_truthy() {
                    if_true.evaluate(ctx)
                } else {
                    if_false.evaluate(ctx)
                }
            }
        }
    }

    /// Whether the named filter participates in producing this expression's
    /// output. Used to suppress auto-escaping after `|safe`.
    pub fn filter_applied(&self, name: &str) -> bool {
        match self {
            Self::Constant(_) | Self::List(_) | Self::Path(_) => false,
            Self::Filtered { base, filters } => {
                filters.iter().any(|f| f.name == name) || base.filter_applied(name)
            }
            Self::Unary { operand, .. } => operand.filter_applied(name),
            Self::Binary { left, right, .. } => {
                left.filter_applied(name) && right.filter_applied(name)
            }
            Self::Ternary {
                if_true, if_false, ..
            } => if_true.filter_applied(name) && if_false.filter_applied(name),
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    token: &Token,
    ctx: &mut ExecutionContext,
) -> Result<Value, Error> {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            if !left.evaluate(ctx)?.is_truthy() {
                return Ok(Value::from(false));
            }
            return Ok(Value::from(right.evaluate(ctx)?.is_truthy()));
        }
        BinaryOp::Or => {
            if left.evaluate(ctx)?.is_truthy() {
                return Ok(Value::from(true));
            }
            return Ok(Value::from(right.evaluate(ctx)?.is_truthy()));
        }
        _ => {}
    }

    let l = left.evaluate(ctx)?;
    let r = right.evaluate(ctx)?;
    match op {
        BinaryOp::In => Ok(Value::from(r.contains(&l))),
        BinaryOp::Eq => Ok(Value::from(l == r)),
        BinaryOp::Ne => Ok(Value::from(l != r)),
        BinaryOp::Lt => Ok(Value::from(natural_cmp(&l, &r).is_lt())),
        BinaryOp::Le => Ok(Value::from(natural_cmp(&l, &r).is_le())),
        BinaryOp::Gt => Ok(Value::from(natural_cmp(&l, &r).is_gt())),
        BinaryOp::Ge => Ok(Value::from(natural_cmp(&l, &r).is_ge())),
        BinaryOp::Add
        | BinaryOp::Sub
        | BinaryOp::Mul
        | BinaryOp::Div
        | BinaryOp::Mod
        | BinaryOp::Pow => arithmetic(op, &l, &r, token),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value, token: &Token) -> Result<Value, Error> {
    // String concatenation with `+`: the non-string side is stringified.
    if op == BinaryOp::Add && (l.is_string() || r.is_string()) {
        return Ok(Value::from(format!(
            "{}{}",
            l.to_display_string(),
            r.to_display_string()
        )));
    }

    if !l.is_number() || !r.is_number() {
        return Err(Error::new(
            "execution",
            format!(
                "invalid operation: '{}' between {} and {}",
                op.symbol(),
                type_name(l),
                type_name(r)
            ),
        )
        .with_token(token));
    }

    if op == BinaryOp::Pow {
        let base = l.as_float().unwrap_or(0.0);
        let exp = r.as_float().unwrap_or(0.0);
        return Ok(Value::from(base.powf(exp)));
    }

    let both_int = l.is_integer() && r.is_integer();
    if both_int {
        let (a, b) = (l.as_integer().unwrap_or(0), r.as_integer().unwrap_or(0));
        let result = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Mod => {
                if b == 0 {
                    return Err(Error::new("execution", "division by zero").with_token(token));
                }
                if op == BinaryOp::Div {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                }
            }
            _ => unreachable!(),
        };
        return Ok(Value::from(result));
    }

    let (a, b) = (l.as_float().unwrap_or(0.0), r.as_float().unwrap_or(0.0));
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        _ => unreachable!(),
    };
    Ok(Value::from(result))
}

fn attr_step(current: &Value, name: &str) -> Value {
    match &current.data {
        ValueData::Map(map) => map.get(name).cloned().unwrap_or_else(Value::none),
        ValueData::Object(obj) => obj.get_named_field(name).unwrap_or_else(Value::none),
        _ => Value::none(),
    }
}

impl VariablePath {
    /// Walks the path against the context. A nil intermediate value stops
    /// the walk and yields nil (the missing-value policy).
    pub fn evaluate(&self, ctx: &mut ExecutionContext) -> Result<Value, Error> {
        let mut current = ctx.get(&self.root).unwrap_or_else(Value::none);
        let mut i = 0;
        while i < self.segments.len() {
            if current.is_nil() {
                return Ok(Value::none());
            }
            current = match &self.segments[i] {
                Segment::Attr(name) => {
                    if let ValueData::Object(obj) = &current.data {
                        let obj = Arc::clone(obj);
                        if let Some(v) = obj.get_named_field(name) {
                            v
                        } else if let Some(Segment::Call(arg_exprs)) = self.segments.get(i + 1) {
                            // A named field that does not exist but is
                            // immediately called resolves as a method.
                            let mut args = Vec::with_capacity(arg_exprs.len());
                            for arg in arg_exprs {
                                args.push(arg.evaluate(ctx)?);
                            }
                            i += 1;
                            match obj.call_method(name, &args) {
                                Some(Ok(v)) => v,
                                Some(Err(mut e)) => {
                                    e.update_from_token(&self.token);
                                    return Err(e);
                                }
                                None => Value::none(),
                            }
                        } else {
                            Value::none()
                        }
                    } else {
                        attr_step(&current, name)
                    }
                }
                Segment::Index(idx) => self.index_step(&current, *idx)?,
                Segment::Subscript(expr) => {
                    let key = expr.evaluate(ctx)?;
                    if let Some(name) = key.as_str() {
                        attr_step(&current, name)
                    } else if key.is_number() {
                        self.index_step(&current, key.as_integer().unwrap_or(0))?
                    } else {
                        return Err(Error::new(
                            "execution",
                            format!("invalid subscript of type {}", type_name(&key)),
                        )
                        .with_token(&self.token));
                    }
                }
                Segment::Call(arg_exprs) => {
                    if let ValueData::Function(f) = &current.data {
                        let func = Arc::clone(&f.0);
                        let mut args = Vec::with_capacity(arg_exprs.len());
                        for arg in arg_exprs {
                            args.push(arg.evaluate(ctx)?);
                        }
                        func(ctx, &args).map_err(|mut e| {
                            e.update_from_token(&self.token);
                            e
                        })?
                    } else {
                        return Err(Error::new(
                            "execution",
                            format!(
                                "'{}' of type {} is not callable",
                                self.root,
                                type_name(&current)
                            ),
                        )
                        .with_token(&self.token));
                    }
                }
            };
            i += 1;
        }
        Ok(current)
    }

    fn index_step(&self, current: &Value, idx: i64) -> Result<Value, Error> {
        match &current.data {
            ValueData::List(_) | ValueData::String(_) => {
                Ok(current.index(idx).unwrap_or_else(Value::none))
            }
            ValueData::Object(obj) => Ok(obj.get_indexed_field(idx).unwrap_or_else(Value::none)),
            _ => Err(Error::new(
                "execution",
                format!("can't access an index on type {}", type_name(current)),
            )
            .with_token(&self.token)),
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

impl Parser<'_> {
    /// Parses one expression at the lowest precedence level.
    pub fn parse_expression(&mut self) -> Result<Expr, Error> {
        let expr = self.parse_or()?;
        // Postfix conditional: `value if cond else other`.
        if self.match_token(TokenKind::Identifier, "if").is_some() {
            let test = self.parse_or()?;
            if self.match_token(TokenKind::Identifier, "else").is_none() {
                return Err(self.error("expected 'else' in conditional expression"));
            }
            let if_false = self.parse_expression()?;
            return Ok(Expr::Ternary {
                test: Box::new(test),
                if_true: Box::new(expr),
                if_false: Box::new(if_false),
            });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_and()?;
        loop {
            let tok = match self.match_token(TokenKind::Keyword, "or") {
                Some(t) => t,
                None => match self.match_token(TokenKind::Symbol, "||") {
                    Some(t) => t,
                    None => break,
                },
            };
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                token: tok,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_equality()?;
        loop {
            let tok = match self.match_token(TokenKind::Keyword, "and") {
                Some(t) => t,
                None => match self.match_token(TokenKind::Symbol, "&&") {
                    Some(t) => t,
                    None => break,
                },
            };
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
                token: tok,
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, Error> {
        let left = self.parse_relational()?;
        let (op, tok) = if let Some(t) = self.match_one(TokenKind::Symbol, &["==", "!=", "<>"]) {
            let op = if t.value == "==" {
                BinaryOp::Eq
            } else {
                BinaryOp::Ne
            };
            (op, t)
        } else if let Some(t) = self.match_token(TokenKind::Keyword, "in") {
            (BinaryOp::In, t)
        } else {
            return Ok(left);
        };
        let right = self.parse_relational()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            token: tok,
        })
    }

    fn parse_relational(&mut self) -> Result<Expr, Error> {
        let left = self.parse_additive()?;
        let Some(tok) = self.match_one(TokenKind::Symbol, &["<=", ">=", "<", ">"]) else {
            return Ok(left);
        };
        let op = match tok.value.as_str() {
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            _ => BinaryOp::Ge,
        };
        let right = self.parse_additive()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            token: tok,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_multiplicative()?;
        while let Some(tok) = self.match_one(TokenKind::Symbol, &["+", "-"]) {
            let op = if tok.value == "+" {
                BinaryOp::Add
            } else {
                BinaryOp::Sub
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                token: tok,
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_power()?;
        while let Some(tok) = self.match_one(TokenKind::Symbol, &["*", "/", "%"]) {
            let op = match tok.value.as_str() {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Mod,
            };
            let right = self.parse_power()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                token: tok,
            };
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, Error> {
        let left = self.parse_unary()?;
        if let Some(tok) = self.match_token(TokenKind::Symbol, "^") {
            // Right-associative.
            let right = self.parse_power()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(left),
                right: Box::new(right),
                token: tok,
            });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        if let Some(tok) = self.match_token(TokenKind::Keyword, "not") {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                token: tok,
            });
        }
        if let Some(tok) = self.match_one(TokenKind::Symbol, &["-", "+"]) {
            let op = if tok.value == "-" {
                UnaryOp::Neg
            } else {
                UnaryOp::Pos
            };
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                token: tok,
            });
        }
        self.parse_factor()
    }

    /// A primary with its trailing filter chain.
    fn parse_factor(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_primary()?;
        let mut filters = Vec::new();
        while self.match_token(TokenKind::Symbol, "|").is_some() {
            filters.push(self.parse_filter_call()?);
        }
        if !filters.is_empty() {
            expr = Expr::Filtered {
                base: Box::new(expr),
                filters,
            };
        }
        Ok(expr)
    }

    fn parse_filter_call(&mut self) -> Result<FilterCall, Error> {
        let Some(name_tok) = self.match_type(TokenKind::Identifier) else {
            return Err(self.error("filter name expected after '|'"));
        };
        let name = name_tok.value.clone();
        if self.set().is_filter_banned(&name) {
            return Err(self
                .error(format!(
                    "usage of filter '{name}' is not allowed (sandbox restriction)"
                ))
                .with_token(&name_tok));
        }
        let Some(func) = self.set().filter_function(&name) else {
            return Err(self
                .error(format!("filter '{name}' does not exist"))
                .with_token(&name_tok));
        };
        let param = if self.match_token(TokenKind::Symbol, ":").is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(FilterCall {
            name,
            token: name_tok,
            param,
            func,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        let Some(tok) = self.current().cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        match tok.kind {
            TokenKind::Integer => {
                self.consume();
                let n: i64 = tok
                    .value
                    .parse()
                    .map_err(|_| self.error("integer literal out of range").with_token(&tok))?;
                Ok(Expr::Constant(Value::from(n)))
            }
            TokenKind::Float => {
                self.consume();
                let f: f64 = tok
                    .value
                    .parse()
                    .map_err(|_| self.error("malformed float literal").with_token(&tok))?;
                Ok(Expr::Constant(Value::from(f)))
            }
            TokenKind::String => {
                self.consume();
                Ok(Expr::Constant(Value::from(tok.value)))
            }
            TokenKind::Nil => {
                self.consume();
                Ok(Expr::Constant(Value::none()))
            }
            TokenKind::Keyword if tok.value == "true" || tok.value == "false" => {
                self.consume();
                Ok(Expr::Constant(Value::from(tok.value == "true")))
            }
            TokenKind::Symbol if tok.value == "(" => {
                self.consume();
                let inner = self.parse_expression()?;
                if self.match_token(TokenKind::Symbol, ")").is_none() {
                    return Err(self.error("unbalanced parenthesis, expected ')'"));
                }
                Ok(inner)
            }
            TokenKind::Symbol if tok.value == "[" => {
                self.consume();
                let mut items = Vec::new();
                loop {
                    if self.match_token(TokenKind::Symbol, "]").is_some() {
                        break;
                    }
                    items.push(self.parse_expression()?);
                    if self.match_token(TokenKind::Symbol, ",").is_none() {
                        if self.match_token(TokenKind::Symbol, "]").is_none() {
                            return Err(self.error("expected ',' or ']' in array literal"));
                        }
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            TokenKind::Identifier => {
                self.consume();
                let path = self.parse_path(tok)?;
                Ok(Expr::Path(path))
            }
            _ => Err(self
                .error(format!("unexpected token '{}' in expression", tok.value))
                .with_token(&tok)),
        }
    }

    fn parse_path(&mut self, root: Token) -> Result<VariablePath, Error> {
        let mut segments = Vec::new();
        loop {
            if self.match_token(TokenKind::Symbol, ".").is_some() {
                if let Some(attr) = self.match_type(TokenKind::Identifier) {
                    segments.push(Segment::Attr(attr.value));
                } else if let Some(idx) = self.match_type(TokenKind::Integer) {
                    let n: i64 = idx
                        .value
                        .parse()
                        .map_err(|_| self.error("index literal out of range").with_token(&idx))?;
                    segments.push(Segment::Index(n));
                } else {
                    return Err(self.error("expected identifier or index after '.'"));
                }
            } else if self.match_token(TokenKind::Symbol, "[").is_some() {
                let sub = self.parse_expression()?;
                if self.match_token(TokenKind::Symbol, "]").is_none() {
                    return Err(self.error("unbalanced subscript, expected ']'"));
                }
                segments.push(Segment::Subscript(Box::new(sub)));
            } else if self.match_token(TokenKind::Symbol, "(").is_some() {
                let mut args = Vec::new();
                loop {
                    if self.match_token(TokenKind::Symbol, ")").is_some() {
                        break;
                    }
                    args.push(self.parse_expression()?);
                    if self.match_token(TokenKind::Symbol, ",").is_none() {
                        if self.match_token(TokenKind::Symbol, ")").is_none() {
                            return Err(self.error("expected ',' or ')' in call arguments"));
                        }
                        break;
                    }
                }
                segments.push(Segment::Call(args));
            } else {
                break;
            }
        }
        Ok(VariablePath {
            root: root.value.clone(),
            segments,
            token: root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::lexer;
    use crate::loaders::MemoryLoader;
    use crate::set::{Options, TemplateSet};
    use crate::value::Object;
    use std::collections::HashMap;

    fn eval_with(src: &str, vars: &[(&str, Value)]) -> Result<Value, Error> {
        let set = TemplateSet::new("test", Box::new(MemoryLoader::new()));
        let tokens =
            lexer::tokenize("test", &format!("{{{{ {src} }}}}"), Options::default()).unwrap();
        let mut parser = Parser::new(&set, "test", tokens, vec![]);
        parser.consume(); // {{
        let expr = parser.parse_expression()?;
        assert!(
            parser.match_token(TokenKind::Symbol, "}}").is_some(),
            "expression did not consume all tokens in '{src}'"
        );
        let mut ctx = Context::new();
        for (k, v) in vars {
            ctx.set(*k, v.clone());
        }
        let mut public = HashMap::new();
        for (k, v) in ctx.vars() {
            public.insert(k.clone(), v.clone());
        }
        let mut ec = crate::context::ExecutionContext::new(set, "test", public, true, true);
        expr.evaluate(&mut ec)
    }

    fn eval(src: &str) -> Value {
        eval_with(src, &[]).unwrap()
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("42").to_display_string(), "42");
        assert_eq!(eval("3.5").to_display_string(), "3.5");
        assert_eq!(eval("\"hi\"").to_display_string(), "hi");
        assert_eq!(eval("true").to_display_string(), "True");
        assert!(eval("nil").is_nil());
        assert!(eval("None").is_nil());
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3").as_integer(), Some(7));
        assert_eq!(eval("(1 + 2) * 3").as_integer(), Some(9));
        assert_eq!(eval("10 - 2 - 3").as_integer(), Some(5));
        assert_eq!(eval("7 % 3").as_integer(), Some(1));
    }

    #[test]
    fn test_integer_division_truncates() {
        assert_eq!(eval("7 / 2").as_integer(), Some(3));
        assert_eq!(eval("7.0 / 2").to_display_string(), "3.5");
    }

    #[test]
    fn test_division_by_zero_is_error() {
        let err = eval_with("1 / 0", &[]).unwrap_err();
        assert!(err.message.contains("division by zero"));
        let err = eval_with("1 % 0", &[]).unwrap_err();
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        assert_eq!(eval("1 + 0.5").to_display_string(), "1.5");
    }

    #[test]
    fn test_power_is_float_and_right_assoc() {
        assert_eq!(eval("2 ^ 3").to_display_string(), "8.0");
        assert_eq!(eval("2 ^ 3 ^ 2").to_display_string(), "512.0");
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(eval("\"a\" + \"b\"").to_display_string(), "ab");
        assert_eq!(eval("\"n=\" + 5").to_display_string(), "n=5");
        assert_eq!(eval("5 + \"!\"").to_display_string(), "5!");
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("1 < 2").is_truthy());
        assert!(eval("2 <= 2").is_truthy());
        assert!(eval("3 > 2").is_truthy());
        assert!(!eval("1 >= 2").is_truthy());
        assert!(eval("1 == 1.0").is_truthy());
        assert!(eval("1 != 2").is_truthy());
        assert!(eval("1 <> 2").is_truthy());
        assert!(eval("\"a\" < \"b\"").is_truthy());
    }

    #[test]
    fn test_logic_and_not() {
        assert!(eval("true and true").is_truthy());
        assert!(!eval("true and false").is_truthy());
        assert!(eval("false or true").is_truthy());
        assert!(eval("not false").is_truthy());
        assert!(eval("not false and true").is_truthy());
    }

    #[test]
    fn test_short_circuit_skips_rhs() {
        // The right side would divide by zero, but must never run.
        assert!(!eval_with("false and 1 / 0", &[]).unwrap().is_truthy());
        assert!(eval_with("true or 1 / 0", &[]).unwrap().is_truthy());
    }

    #[test]
    fn test_calling_missing_value_yields_nil() {
        assert!(eval_with("missing()", &[]).unwrap().is_nil());
    }

    #[test]
    fn test_membership() {
        assert!(eval("\"ell\" in \"hello\"").is_truthy());
        assert!(eval_with("2 in items", &[("items", Value::from(vec![1i64, 2, 3]))])
            .unwrap()
            .is_truthy());
        assert!(!eval("\"x\" in \"hello\"").is_truthy());
    }

    #[test]
    fn test_array_literal() {
        assert_eq!(eval("[1, 2, 3]").to_display_string(), "[1, 2, 3]");
        assert_eq!(eval("[1, 2, ]").to_display_string(), "[1, 2]");
        assert_eq!(eval("[]").to_display_string(), "[]");
    }

    #[test]
    fn test_ternary() {
        assert_eq!(eval("\"yes\" if true else \"no\"").to_display_string(), "yes");
        assert_eq!(eval("\"yes\" if false else \"no\"").to_display_string(), "no");
    }

    #[test]
    fn test_filters_bind_to_primaries() {
        assert_eq!(eval("\"ab\"|upper").to_display_string(), "AB");
        assert!(eval("\"ab\"|upper == \"AB\"").is_truthy());
        assert_eq!(eval("\"hi\"|upper + \"!\"|upper").to_display_string(), "HI!");
    }

    #[test]
    fn test_filter_with_param() {
        assert_eq!(
            eval_with("missing|default:\"fallback\"", &[])
                .unwrap()
                .to_display_string(),
            "fallback"
        );
    }

    #[test]
    fn test_filter_param_is_a_full_expression() {
        // The parameter grammar is `':' expression`, so operators bind
        // inside the parameter, not around the filtered value.
        assert_eq!(eval("10|add:2 * 3").as_integer(), Some(16));
        assert_eq!(
            eval_with("x|add:-1", &[("x", Value::from(5i64))])
                .unwrap()
                .as_integer(),
            Some(4)
        );
        assert_eq!(eval("10|add:(1 + 1) * 3").as_integer(), Some(16));
    }

    #[test]
    fn test_unknown_filter_is_parse_error() {
        let set = TemplateSet::new("test", Box::new(MemoryLoader::new()));
        let tokens =
            lexer::tokenize("test", "{{ x|nope }}", Options::default()).unwrap();
        let mut parser = Parser::new(&set, "test", tokens, vec![]);
        parser.consume();
        let err = parser.parse_expression().unwrap_err();
        assert!(err.message.contains("filter 'nope' does not exist"));
    }

    #[test]
    fn test_filter_applied_recurses() {
        let set = TemplateSet::new("test", Box::new(MemoryLoader::new()));
        let tokens =
            lexer::tokenize("test", "{{ a|safe + b|safe }}", Options::default()).unwrap();
        let mut parser = Parser::new(&set, "test", tokens, vec![]);
        parser.consume();
        let expr = parser.parse_expression().unwrap();
        assert!(expr.filter_applied("safe"));
        assert!(!expr.filter_applied("escape"));
    }

    #[test]
    fn test_path_map_and_index() {
        let mut user = std::collections::BTreeMap::new();
        user.insert("name".to_string(), Value::from("Ada"));
        let vars = [
            ("user", Value::from(user)),
            ("items", Value::from(vec!["a", "b", "c"])),
        ];
        assert_eq!(
            eval_with("user.name", &vars).unwrap().to_display_string(),
            "Ada"
        );
        assert_eq!(
            eval_with("items.1", &vars).unwrap().to_display_string(),
            "b"
        );
        assert_eq!(
            eval_with("items[2]", &vars).unwrap().to_display_string(),
            "c"
        );
        assert_eq!(
            eval_with("user[\"name\"]", &vars).unwrap().to_display_string(),
            "Ada"
        );
    }

    #[test]
    fn test_missing_path_yields_nil() {
        assert!(eval_with("user.name.deep", &[]).unwrap().is_nil());
        let vars = [("items", Value::from(vec!["a"]))];
        assert!(eval_with("items.5", &vars).unwrap().is_nil());
    }

    #[test]
    fn test_index_on_scalar_is_error() {
        let vars = [("n", Value::from(5i64))];
        let err = eval_with("n.0", &vars).unwrap_err();
        assert!(err.message.contains("can't access an index on type integer"));
    }

    #[test]
    fn test_call_non_function_is_error() {
        let vars = [("n", Value::from(5i64))];
        let err = eval_with("n()", &vars).unwrap_err();
        assert!(err.message.contains("is not callable"));
    }

    #[test]
    fn test_function_call() {
        let double = Value::function(|_ctx, args| {
            let n = args.first().and_then(Value::as_integer).unwrap_or(0);
            Ok(Value::from(n * 2))
        });
        let vars = [("double", double)];
        assert_eq!(
            eval_with("double(21)", &vars).unwrap().as_integer(),
            Some(42)
        );
    }

    #[derive(Debug)]
    struct Account {
        owner: &'static str,
    }

    impl Object for Account {
        fn get_named_field(&self, name: &str) -> Option<Value> {
            (name == "owner").then(|| Value::from(self.owner))
        }

        fn get_indexed_field(&self, index: i64) -> Option<Value> {
            (index == 0).then(|| Value::from(self.owner))
        }

        fn call_method(&self, name: &str, args: &[Value]) -> Option<Result<Value, Error>> {
            match name {
                "greet" => {
                    let greeting = args
                        .first()
                        .map_or_else(|| "Hello".to_string(), Value::to_display_string);
                    Some(Ok(Value::from(format!("{greeting}, {}", self.owner))))
                }
                "explode" => Some(Err(Error::new("execution", "method failure"))),
                _ => None,
            }
        }
    }

    #[test]
    fn test_object_resolution() {
        let vars = [(
            "account",
            Value::object(std::sync::Arc::new(Account { owner: "Ada" })),
        )];
        assert_eq!(
            eval_with("account.owner", &vars).unwrap().to_display_string(),
            "Ada"
        );
        assert_eq!(
            eval_with("account.0", &vars).unwrap().to_display_string(),
            "Ada"
        );
        assert_eq!(
            eval_with("account.greet(\"Hi\")", &vars)
                .unwrap()
                .to_display_string(),
            "Hi, Ada"
        );
        assert!(eval_with("account.missing", &vars).unwrap().is_nil());
        assert!(eval_with("account.missing_method(1)", &vars).unwrap().is_nil());
    }

    #[test]
    fn test_object_method_error_propagates() {
        let vars = [(
            "account",
            Value::object(std::sync::Arc::new(Account { owner: "Ada" })),
        )];
        let err = eval_with("account.explode()", &vars).unwrap_err();
        assert!(err.message.contains("method failure"));
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(eval("-3").as_integer(), Some(-3));
        assert_eq!(eval("2 - -3").as_integer(), Some(5));
        let err = eval_with("-\"x\"", &[]).unwrap_err();
        assert!(err.message.contains("unary '-'"));
    }

    #[test]
    fn test_invalid_arithmetic_operands() {
        let err = eval_with("nil + 1", &[]).unwrap_err();
        assert!(err.message.contains("invalid operation"));
    }
}

//! Statement rendering.
//!
//! The renderer walks a parsed [`Template`] with a parameter mapping and
//! produces a [`Statement`]: SQL text in which every ordinary `{{ expr }}`
//! output has been replaced by a placeholder, plus the ordered list of values
//! bound to those placeholders. Values reach the SQL text itself only through
//! the `sqlsafe` and `identifier` filters, or through the reserved
//! `_model_fields_` variable.
//!
//! ```rust
//! use pgstencil_template::render::{Renderer, to_params};
//! use serde_json::json;
//!
//! let params = to_params(&json!({ "limit": 3 })).unwrap();
//! let stmt = Renderer::new()
//!     .render("SELECT * FROM t LIMIT {{ limit }}", &params, None)
//!     .unwrap();
//!
//! assert_eq!(stmt.sql(), "SELECT * FROM t LIMIT $1");
//! assert_eq!(stmt.params(), &[json!(3)]);
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::ast::{CompareOp, Expr, Node, Template, TestKind};
use crate::error::{TemplateError, TemplateResult};
use crate::parser::parse_template;
use crate::record::{self, Record};

/// Name of the variable that receives the target record's field list.
pub const MODEL_FIELDS_VAR: &str = "_model_fields_";

/// Query parameters: a mapping from variable name to JSON value.
pub type Params = Map<String, Value>;

/// Convert any serializable value into [`Params`].
///
/// `()`/`None` (serialized as `null`) yield an empty mapping; anything that is
/// not a map or struct is rejected.
pub fn to_params<P: Serialize + ?Sized>(params: &P) -> TemplateResult<Params> {
    let value = serde_json::to_value(params)
        .map_err(|e| TemplateError::invalid_params(e.to_string()))?;

    match value {
        Value::Null => Ok(Params::new()),
        Value::Object(map) => Ok(map),
        other => Err(TemplateError::invalid_params(format!(
            "expected a mapping, got {}",
            type_name(&other)
        ))),
    }
}

/// Placeholder syntax used for bound parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamStyle {
    /// `$1`, `$2`, ... (PostgreSQL).
    #[default]
    Numeric,
    /// `%s`.
    Format,
    /// `?`.
    Qmark,
}

impl ParamStyle {
    /// The placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Numeric => format!("${index}"),
            Self::Format => "%s".to_string(),
            Self::Qmark => "?".to_string(),
        }
    }
}

/// A rendered statement: SQL text plus its bound values.
#[derive(Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    style: ParamStyle,
}

impl Statement {
    /// Create a statement from already rendered parts.
    pub fn new(sql: impl Into<String>, params: Vec<Value>, style: ParamStyle) -> Self {
        Self {
            sql: sql.into(),
            params,
            style,
        }
    }

    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The bound values, in placeholder order.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The placeholder style the SQL was rendered with.
    pub fn style(&self) -> ParamStyle {
        self.style
    }

    /// Split into SQL text and bound values.
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }

    /// Bound values with their contents redacted, e.g. `[integer, string]`.
    pub fn param_summary(&self) -> String {
        let names: Vec<&str> = self.params.iter().map(type_name).collect();
        format!("[{}]", names.join(", "))
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("params", &format_args!("{}", self.param_summary()))
            .field("style", &self.style)
            .finish()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Renders templates into [`Statement`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer {
    style: ParamStyle,
}

impl Renderer {
    /// Create a renderer producing `$n` placeholders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a renderer with the given placeholder style.
    pub fn with_style(style: ParamStyle) -> Self {
        Self { style }
    }

    /// The placeholder style in use.
    pub fn style(&self) -> ParamStyle {
        self.style
    }

    /// Render `source` with `params`.
    ///
    /// When `fields` is given, `_model_fields_` is bound to the fields joined
    /// with `", "` and is written into the SQL text as-is.
    pub fn render(
        &self,
        source: &str,
        params: &Params,
        fields: Option<&[String]>,
    ) -> TemplateResult<Statement> {
        if params.contains_key(MODEL_FIELDS_VAR) {
            return Err(TemplateError::ReservedVariable {
                name: MODEL_FIELDS_VAR.to_string(),
            });
        }

        let template = parse_template(source)?;
        self.render_template(&template, params, fields)
    }

    /// Render `source` with the field list of `T` bound to `_model_fields_`.
    pub fn render_for<T: Record>(&self, source: &str, params: &Params) -> TemplateResult<Statement> {
        let fields = record::fields::<T>()?;
        self.render(source, params, Some(&fields[..]))
    }

    /// Render an already parsed template.
    pub fn render_template(
        &self,
        template: &Template,
        params: &Params,
        fields: Option<&[String]>,
    ) -> TemplateResult<Statement> {
        let joined = fields.map(|f| f.join(", "));
        let mut scope = Scope {
            params,
            model_fields: joined.as_deref(),
            locals: Vec::new(),
        };
        let mut out = Output {
            sql: String::new(),
            params: Vec::new(),
            style: self.style,
        };

        render_nodes(&template.nodes, &mut scope, &mut out)?;

        debug!(binds = out.params.len(), "rendered template");
        Ok(Statement::new(out.sql, out.params, self.style))
    }
}

// ============================================================================
// Evaluation
// ============================================================================

struct Scope<'a> {
    params: &'a Params,
    model_fields: Option<&'a str>,
    /// Loop variables, innermost last.
    locals: Vec<(String, Value)>,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Evaluated {
        if let Some((_, value)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Evaluated::Value(value.clone());
        }
        if name == MODEL_FIELDS_VAR {
            if let Some(fields) = self.model_fields {
                return Evaluated::Safe(fields.to_string());
            }
        }
        match self.params.get(name) {
            Some(value) => Evaluated::Value(value.clone()),
            None => Evaluated::Undefined(name.to_string()),
        }
    }
}

struct Output {
    sql: String,
    params: Vec<Value>,
    style: ParamStyle,
}

impl Output {
    fn bind(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.style.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }
}

/// The result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
enum Evaluated {
    /// An ordinary value; bound as a parameter when output.
    Value(Value),
    /// Text written into the SQL verbatim.
    Safe(String),
    /// A list expanded into `($1, $2, ...)` when output.
    InClause(Vec<Value>),
    /// A lookup that found nothing, carrying the path that was looked up.
    Undefined(String),
}

impl Evaluated {
    fn into_value(self) -> TemplateResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Safe(text) => Ok(Value::String(text)),
            Self::InClause(items) => Ok(Value::Array(items)),
            Self::Undefined(name) => Err(TemplateError::undefined(name)),
        }
    }

    fn is_truthy(&self) -> TemplateResult<bool> {
        Ok(match self {
            Self::Value(value) => truthy(value),
            Self::Safe(text) => !text.is_empty(),
            Self::InClause(items) => !items.is_empty(),
            Self::Undefined(name) => return Err(TemplateError::undefined(name.clone())),
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn render_nodes(nodes: &[Node], scope: &mut Scope<'_>, out: &mut Output) -> TemplateResult<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.sql.push_str(text),
            Node::Output(expr) => match eval(expr, scope)? {
                Evaluated::Value(value) => out.bind(value),
                Evaluated::Safe(text) => out.sql.push_str(&text),
                Evaluated::InClause(items) => {
                    if items.is_empty() {
                        return Err(TemplateError::invalid_filter(
                            "inclause",
                            "cannot expand an empty list",
                        ));
                    }
                    out.sql.push('(');
                    for (i, item) in items.into_iter().enumerate() {
                        if i > 0 {
                            out.sql.push_str(", ");
                        }
                        out.bind(item);
                    }
                    out.sql.push(')');
                }
                Evaluated::Undefined(name) => return Err(TemplateError::undefined(name)),
            },
            Node::If {
                branches,
                otherwise,
            } => {
                let mut taken = None;
                for (condition, body) in branches {
                    if eval(condition, scope)?.is_truthy()? {
                        taken = Some(body);
                        break;
                    }
                }
                if let Some(body) = taken.or(otherwise.as_ref()) {
                    render_nodes(body, scope, out)?;
                }
            }
            Node::For {
                var,
                iterable,
                body,
                otherwise,
            } => {
                let items = match eval(iterable, scope)?.into_value()? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                    other => {
                        return Err(TemplateError::invalid_operation(format!(
                            "cannot iterate over {}",
                            type_name(&other)
                        )));
                    }
                };

                if items.is_empty() {
                    if let Some(body) = otherwise {
                        render_nodes(body, scope, out)?;
                    }
                    continue;
                }

                let length = items.len();
                for (index0, item) in items.into_iter().enumerate() {
                    let info = serde_json::json!({
                        "index": index0 + 1,
                        "index0": index0,
                        "first": index0 == 0,
                        "last": index0 + 1 == length,
                        "length": length,
                    });
                    scope.locals.push(("loop".to_string(), info));
                    scope.locals.push((var.clone(), item));
                    let result = render_nodes(body, scope, out);
                    scope.locals.truncate(scope.locals.len() - 2);
                    result?;
                }
            }
        }
    }
    Ok(())
}

fn eval(expr: &Expr, scope: &Scope<'_>) -> TemplateResult<Evaluated> {
    match expr {
        Expr::Literal(value) => Ok(Evaluated::Value(value.clone())),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, scope)?.into_value())
                .collect::<TemplateResult<_>>()?;
            Ok(Evaluated::Value(Value::Array(values)))
        }
        Expr::Var(name) => Ok(scope.lookup(name)),
        Expr::Attr(inner, name) => {
            let path = || format!("{}.{name}", describe(inner));
            Ok(match eval(inner, scope)? {
                Evaluated::Value(Value::Object(map)) => match map.get(name) {
                    Some(value) => Evaluated::Value(value.clone()),
                    None => Evaluated::Undefined(path()),
                },
                Evaluated::Undefined(_) | Evaluated::Value(_) => Evaluated::Undefined(path()),
                _ => {
                    return Err(TemplateError::invalid_operation(format!(
                        "`{}` has no attributes",
                        describe(inner)
                    )));
                }
            })
        }
        Expr::Index(inner, index) => {
            let path = || format!("{}[{}]", describe(inner), describe(index));
            let base = match eval(inner, scope)? {
                Evaluated::Undefined(_) => return Ok(Evaluated::Undefined(path())),
                other => other.into_value()?,
            };
            let key = eval(index, scope)?.into_value()?;
            let found = match (&base, &key) {
                (Value::Array(items), Value::Number(n)) => n.as_i64().and_then(|i| {
                    let len = items.len() as i64;
                    let i = if i < 0 { len + i } else { i };
                    usize::try_from(i).ok().and_then(|i| items.get(i))
                }),
                (Value::Object(map), Value::String(k)) => map.get(k),
                _ => {
                    return Err(TemplateError::invalid_operation(format!(
                        "cannot index {} with {}",
                        type_name(&base),
                        type_name(&key)
                    )));
                }
            };
            Ok(match found {
                Some(value) => Evaluated::Value(value.clone()),
                None => Evaluated::Undefined(path()),
            })
        }
        Expr::Not(inner) => Ok(Evaluated::Value(Value::Bool(!eval(inner, scope)?.is_truthy()?))),
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, scope)?;
            if left.is_truthy()? {
                eval(rhs, scope)
            } else {
                Ok(left)
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, scope)?;
            if left.is_truthy()? {
                Ok(left)
            } else {
                eval(rhs, scope)
            }
        }
        Expr::Compare { op, lhs, rhs } => {
            let left = eval(lhs, scope)?.into_value()?;
            let right = eval(rhs, scope)?.into_value()?;
            compare(*op, &left, &right).map(|b| Evaluated::Value(Value::Bool(b)))
        }
        Expr::Test {
            expr,
            test,
            negated,
        } => {
            let value = eval(expr, scope)?;
            let result = match test {
                TestKind::Defined => !matches!(value, Evaluated::Undefined(_)),
                TestKind::None => matches!(value, Evaluated::Value(Value::Null)),
            };
            Ok(Evaluated::Value(Value::Bool(result != *negated)))
        }
        Expr::Filter { expr, name, args } => apply_filter(name, expr, args, scope),
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Var(name) => name.clone(),
        Expr::Attr(inner, name) => format!("{}.{name}", describe(inner)),
        Expr::Index(inner, index) => format!("{}[{}]", describe(inner), describe(index)),
        Expr::Literal(value) => value.to_string(),
        _ => "<expr>".to_string(),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> TemplateResult<bool> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::In => contains(right, left),
        CompareOp::NotIn => contains(right, left).map(|b| !b),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| {
                TemplateError::invalid_operation(format!(
                    "cannot compare {} {} {}",
                    type_name(left),
                    op.as_str(),
                    type_name(right)
                ))
            })?;
            Ok(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> TemplateResult<bool> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::String(text), Value::String(part)) => Ok(text.contains(part.as_str())),
        _ => Err(TemplateError::invalid_operation(format!(
            "cannot test membership of {} in {}",
            type_name(needle),
            type_name(haystack)
        ))),
    }
}

// ============================================================================
// Filters
// ============================================================================

fn apply_filter(name: &str, expr: &Expr, args: &[Expr], scope: &Scope<'_>) -> TemplateResult<Evaluated> {
    if name == "default" {
        let value = eval(expr, scope)?;
        let fallback_on_falsy = match args.get(1) {
            Some(flag) => eval(flag, scope)?.is_truthy()?,
            None => false,
        };
        let use_fallback = match &value {
            Evaluated::Undefined(_) => true,
            other => fallback_on_falsy && !other.is_truthy()?,
        };
        if !use_fallback {
            return Ok(value);
        }
        return match args.first() {
            Some(fallback) => eval(fallback, scope),
            None => Ok(Evaluated::Value(Value::String(String::new()))),
        };
    }

    let value = eval(expr, scope)?.into_value()?;
    let invalid = |message: String| TemplateError::invalid_filter(name, message);

    match name {
        "sqlsafe" => match value {
            Value::String(text) => Ok(Evaluated::Safe(text)),
            Value::Null => Ok(Evaluated::Safe("NULL".to_string())),
            Value::Bool(_) | Value::Number(_) => Ok(Evaluated::Safe(value.to_string())),
            other => Err(invalid(format!("cannot inline {}", type_name(&other)))),
        },
        "inclause" => match value {
            Value::Array(items) => Ok(Evaluated::InClause(items)),
            other => Err(invalid(format!("expected a list, got {}", type_name(&other)))),
        },
        "identifier" => match value {
            Value::String(text) => Ok(Evaluated::Safe(quote_identifier(&text))),
            Value::Array(parts) => {
                let quoted = parts
                    .iter()
                    .map(|part| match part {
                        Value::String(text) => Ok(quote_identifier(text)),
                        other => Err(invalid(format!(
                            "identifier parts must be strings, got {}",
                            type_name(other)
                        ))),
                    })
                    .collect::<TemplateResult<Vec<_>>>()?;
                if quoted.is_empty() {
                    return Err(invalid("empty identifier".to_string()));
                }
                Ok(Evaluated::Safe(quoted.join(".")))
            }
            other => Err(invalid(format!("expected a string, got {}", type_name(&other)))),
        },
        "length" => {
            let len = match &value {
                Value::String(text) => text.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(invalid(format!("{} has no length", type_name(other)))),
            };
            Ok(Evaluated::Value(Value::from(len)))
        }
        "lower" | "upper" => match value {
            Value::String(text) => {
                let text = if name == "lower" {
                    text.to_lowercase()
                } else {
                    text.to_uppercase()
                };
                Ok(Evaluated::Value(Value::String(text)))
            }
            other => Err(invalid(format!("expected a string, got {}", type_name(&other)))),
        },
        "join" => {
            let separator = match args.first() {
                Some(arg) => match eval(arg, scope)?.into_value()? {
                    Value::String(sep) => sep,
                    other => return Err(invalid(format!("separator must be a string, got {}", type_name(&other)))),
                },
                None => String::new(),
            };
            match value {
                Value::Array(items) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| match item {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    Ok(Evaluated::Value(Value::String(parts.join(&separator))))
                }
                other => Err(invalid(format!("expected a list, got {}", type_name(&other)))),
            }
        }
        _ => Err(invalid("unknown filter".to_string())),
    }
}

/// Double-quote an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

//! Template parser.
//!
//! Turns a template body into an [`ast::Template`](crate::ast::Template).
//! Whitespace control markers (`{%-`, `-%}`, `{{-`, `-}}`) are resolved here,
//! so the renderer only ever sees the trimmed text.

mod grammar;

use pest::Parser;
use pest::error::{InputLocation, LineColLocation};
use pest::iterators::{Pair, Pairs};
use serde_json::Value;

use crate::ast::{CompareOp, Expr, Node, Template, TestKind};
use crate::error::{TemplateError, TemplateResult};

pub use grammar::{Rule, TemplateParser};

/// Parse a template body.
pub fn parse_template(source: &str) -> TemplateResult<Template> {
    let mut pairs =
        TemplateParser::parse(Rule::template, source).map_err(|e| syntax_error(source, e))?;

    let template = next(&mut pairs, "template")?;
    let mut builder = Builder::default();
    let mut nodes = Vec::new();

    for pair in template.into_inner() {
        if pair.as_rule() == Rule::body {
            nodes = builder.body(pair)?;
        }
    }

    Ok(Template::new(nodes))
}

fn syntax_error(source: &str, err: pest::error::Error<Rule>) -> TemplateError {
    let err = err.renamed_rules(describe_rule);
    let (offset, len) = match err.location {
        InputLocation::Pos(pos) => (pos, 0),
        InputLocation::Span((start, end)) => (start, end.saturating_sub(start)),
    };
    let line_col = match err.line_col {
        LineColLocation::Pos(lc) => lc,
        LineColLocation::Span(lc, _) => lc,
    };
    TemplateError::syntax(source, offset, len, line_col, err.variant.message())
}

fn describe_rule(rule: &Rule) -> String {
    match rule {
        Rule::expr_close => "`}}`".into(),
        Rule::tag_close => "`%}`".into(),
        Rule::endif_tag => "`{% endif %}`".into(),
        Rule::endfor_tag => "`{% endfor %}`".into(),
        Rule::elif_clause => "`{% elif %}`".into(),
        Rule::else_clause => "`{% else %}`".into(),
        Rule::EOI => "end of template".into(),
        other => format!("{other:?}").replace('_', " "),
    }
}

fn next<'i>(pairs: &mut Pairs<'i, Rule>, what: &str) -> TemplateResult<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| TemplateError::invalid_operation(format!("malformed template: missing {what}")))
}

/// A parsed tag with its whitespace markers resolved.
struct Tag<'i> {
    trim_before: bool,
    parts: Vec<Pair<'i, Rule>>,
}

impl<'i> Tag<'i> {
    fn expression(&mut self) -> TemplateResult<Expr> {
        let pos = self
            .parts
            .iter()
            .position(|p| p.as_rule() == Rule::expression)
            .ok_or_else(|| TemplateError::invalid_operation("malformed template: missing expression"))?;
        build_expr(self.parts.remove(pos))
    }

    fn identifier(&self) -> TemplateResult<String> {
        self.parts
            .iter()
            .find(|p| p.as_rule() == Rule::identifier)
            .map(|p| p.as_str().to_string())
            .ok_or_else(|| TemplateError::invalid_operation("malformed template: missing loop variable"))
    }
}

#[derive(Default)]
struct Builder {
    /// Set by a `-%}` / `-}}` marker; strips leading whitespace of the next text.
    trim_next: bool,
}

impl Builder {
    fn body(&mut self, pair: Pair<'_, Rule>) -> TemplateResult<Vec<Node>> {
        let mut nodes = Vec::new();

        for item in pair.into_inner() {
            match item.as_rule() {
                Rule::text => {
                    let mut text = item.as_str();
                    if std::mem::take(&mut self.trim_next) {
                        text = text.trim_start();
                    }
                    push_text(&mut nodes, text);
                }
                Rule::comment => {}
                Rule::output => {
                    let mut tag = self.tag(item, Some(&mut nodes));
                    nodes.push(Node::Output(tag.expression()?));
                }
                Rule::if_block => {
                    let node = self.if_block(item, &mut nodes)?;
                    nodes.push(node);
                }
                Rule::for_block => {
                    let node = self.for_block(item, &mut nodes)?;
                    nodes.push(node);
                }
                _ => {}
            }
        }

        Ok(nodes)
    }

    /// Resolve a tag's markers: `{%-` trims the end of `prev`, `-%}` arms `trim_next`.
    fn tag<'i>(&mut self, pair: Pair<'i, Rule>, prev: Option<&mut Vec<Node>>) -> Tag<'i> {
        let mut tag = Tag {
            trim_before: false,
            parts: Vec::new(),
        };
        let mut trim_after = false;

        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::tag_open | Rule::expr_open => tag.trim_before = part.as_str().ends_with('-'),
                Rule::tag_close | Rule::expr_close => trim_after = part.as_str().starts_with('-'),
                Rule::expression | Rule::identifier => tag.parts.push(part),
                _ => {}
            }
        }

        if let (true, Some(prev)) = (tag.trim_before, prev) {
            trim_end(prev);
        }
        self.trim_next = trim_after;
        tag
    }

    fn if_block(&mut self, pair: Pair<'_, Rule>, parent: &mut Vec<Node>) -> TemplateResult<Node> {
        let mut inner = pair.into_inner();

        let mut open = self.tag(next(&mut inner, "if tag")?, Some(parent));
        let condition = open.expression()?;
        let body = self.body(next(&mut inner, "if body")?)?;

        let mut branches = vec![(condition, body)];
        let mut otherwise: Option<Vec<Node>> = None;

        for clause in inner {
            match clause.as_rule() {
                Rule::elif_clause => {
                    let mut parts = clause.into_inner();
                    let tag_pair = next(&mut parts, "elif tag")?;
                    let mut tag = self.tag(tag_pair, last_body(&mut branches, &mut otherwise));
                    let condition = tag.expression()?;
                    let body = self.body(next(&mut parts, "elif body")?)?;
                    branches.push((condition, body));
                }
                Rule::else_clause => {
                    let mut parts = clause.into_inner();
                    let tag_pair = next(&mut parts, "else tag")?;
                    self.tag(tag_pair, last_body(&mut branches, &mut otherwise));
                    otherwise = Some(self.body(next(&mut parts, "else body")?)?);
                }
                Rule::endif_tag => {
                    self.tag(clause, last_body(&mut branches, &mut otherwise));
                }
                _ => {}
            }
        }

        Ok(Node::If {
            branches,
            otherwise,
        })
    }

    fn for_block(&mut self, pair: Pair<'_, Rule>, parent: &mut Vec<Node>) -> TemplateResult<Node> {
        let mut inner = pair.into_inner();

        let mut open = self.tag(next(&mut inner, "for tag")?, Some(parent));
        let var = open.identifier()?;
        let iterable = open.expression()?;
        let mut body = self.body(next(&mut inner, "for body")?)?;
        let mut otherwise: Option<Vec<Node>> = None;

        for clause in inner {
            match clause.as_rule() {
                Rule::else_clause => {
                    let mut parts = clause.into_inner();
                    self.tag(next(&mut parts, "else tag")?, Some(&mut body));
                    otherwise = Some(self.body(next(&mut parts, "else body")?)?);
                }
                Rule::endfor_tag => {
                    let prev = match otherwise.as_mut() {
                        Some(nodes) => nodes,
                        None => &mut body,
                    };
                    self.tag(clause, Some(prev));
                }
                _ => {}
            }
        }

        Ok(Node::For {
            var,
            iterable,
            body,
            otherwise,
        })
    }
}

fn last_body<'a>(
    branches: &'a mut [(Expr, Vec<Node>)],
    otherwise: &'a mut Option<Vec<Node>>,
) -> Option<&'a mut Vec<Node>> {
    match otherwise {
        Some(nodes) => Some(nodes),
        None => branches.last_mut().map(|(_, nodes)| nodes),
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(prev)) = nodes.last_mut() {
        prev.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn trim_end(nodes: &mut Vec<Node>) {
    if let Some(Node::Text(text)) = nodes.last_mut() {
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);
        if text.is_empty() {
            nodes.pop();
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

fn build_expr(pair: Pair<'_, Rule>) -> TemplateResult<Expr> {
    match pair.as_rule() {
        Rule::expression => build_expr(next(&mut pair.into_inner(), "expression")?),
        Rule::or_expr => build_chain(pair, Expr::Or),
        Rule::and_expr => build_chain(pair, Expr::And),
        Rule::not_expr => {
            let mut inner = pair.into_inner();
            let first = next(&mut inner, "operand")?;
            if first.as_rule() == Rule::negate {
                let operand = build_expr(next(&mut inner, "operand")?)?;
                Ok(Expr::Not(Box::new(operand)))
            } else {
                build_expr(first)
            }
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            let lhs = build_expr(next(&mut inner, "operand")?)?;
            let Some(op) = inner.next() else {
                return Ok(lhs);
            };
            let op = compare_op(op)?;
            let rhs = build_expr(next(&mut inner, "operand")?)?;
            Ok(Expr::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        Rule::test_expr => {
            let mut inner = pair.into_inner();
            let expr = build_expr(next(&mut inner, "operand")?)?;
            let mut negated = false;
            let mut test = None;
            for part in inner {
                match part.as_rule() {
                    Rule::negate => negated = true,
                    Rule::test_name => test = Some(test_kind(part.as_str())?),
                    _ => {}
                }
            }
            Ok(match test {
                Some(test) => Expr::Test {
                    expr: Box::new(expr),
                    test,
                    negated,
                },
                None => expr,
            })
        }
        Rule::filtered => {
            let mut inner = pair.into_inner();
            let mut expr = build_expr(next(&mut inner, "operand")?)?;
            for call in inner {
                let mut parts = call.into_inner();
                let name = next(&mut parts, "filter name")?.as_str().to_string();
                let mut args = Vec::new();
                if let Some(call_args) = parts.next() {
                    for arg in call_args.into_inner() {
                        args.push(build_expr(arg)?);
                    }
                }
                expr = Expr::Filter {
                    expr: Box::new(expr),
                    name,
                    args,
                };
            }
            Ok(expr)
        }
        Rule::postfix => {
            let mut inner = pair.into_inner();
            let mut expr = build_expr(next(&mut inner, "operand")?)?;
            for access in inner {
                expr = match access.as_rule() {
                    Rule::attr_access => {
                        let name = next(&mut access.into_inner(), "attribute")?;
                        Expr::Attr(Box::new(expr), name.as_str().to_string())
                    }
                    _ => {
                        let index = build_expr(next(&mut access.into_inner(), "index")?)?;
                        Expr::Index(Box::new(expr), Box::new(index))
                    }
                };
            }
            Ok(expr)
        }
        Rule::list => {
            let items = pair.into_inner().map(build_expr).collect::<TemplateResult<_>>()?;
            Ok(Expr::List(items))
        }
        Rule::number => Ok(Expr::Literal(parse_number(pair.as_str()))),
        Rule::string => {
            let inner = next(&mut pair.into_inner(), "string body")?;
            Ok(Expr::Literal(Value::String(unescape(inner.as_str()))))
        }
        Rule::kw_true => Ok(Expr::Literal(Value::Bool(true))),
        Rule::kw_false => Ok(Expr::Literal(Value::Bool(false))),
        Rule::kw_none => Ok(Expr::Literal(Value::Null)),
        Rule::identifier => Ok(Expr::Var(pair.as_str().to_string())),
        other => Err(TemplateError::invalid_operation(format!(
            "unexpected {other:?} in expression"
        ))),
    }
}

fn build_chain(pair: Pair<'_, Rule>, join: fn(Box<Expr>, Box<Expr>) -> Expr) -> TemplateResult<Expr> {
    let mut operands = pair
        .into_inner()
        .filter(|p| !matches!(p.as_rule(), Rule::kw_and | Rule::kw_or));
    let first = operands
        .next()
        .ok_or_else(|| TemplateError::invalid_operation("malformed template: missing operand"))?;

    let mut expr = build_expr(first)?;
    for operand in operands {
        expr = join(Box::new(expr), Box::new(build_expr(operand)?));
    }
    Ok(expr)
}

fn compare_op(pair: Pair<'_, Rule>) -> TemplateResult<CompareOp> {
    let op = next(&mut pair.into_inner(), "operator")?;
    Ok(match op.as_rule() {
        Rule::eq => CompareOp::Eq,
        Rule::ne => CompareOp::Ne,
        Rule::lt => CompareOp::Lt,
        Rule::le => CompareOp::Le,
        Rule::gt => CompareOp::Gt,
        Rule::ge => CompareOp::Ge,
        Rule::in_op => CompareOp::In,
        Rule::not_in => CompareOp::NotIn,
        other => {
            return Err(TemplateError::invalid_operation(format!(
                "unknown operator {other:?}"
            )));
        }
    })
}

fn test_kind(name: &str) -> TemplateResult<TestKind> {
    match name {
        "defined" => Ok(TestKind::Defined),
        "none" | "None" => Ok(TestKind::None),
        other => Err(TemplateError::invalid_operation(format!("unknown test `{other}`"))),
    }
}

fn parse_number(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    text.parse::<f64>().map(Value::from).unwrap_or(Value::Null)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

//! Abstract syntax tree for parsed SQL templates.

use serde_json::Value;

/// A parsed template: a sequence of nodes rendered in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    /// Top-level nodes.
    pub nodes: Vec<Node>,
}

impl Template {
    /// Create a template from its nodes.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Check if the template contains no tags at all.
    pub fn is_plain_text(&self) -> bool {
        self.nodes.iter().all(|n| matches!(n, Node::Text(_)))
    }
}

/// A template node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal SQL text, emitted verbatim.
    Text(String),
    /// `{{ expr }}`.
    Output(Expr),
    /// `{% if %}` with any `{% elif %}` branches and an optional `{% else %}`.
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    /// `{% for var in iterable %}` with an optional `{% else %}` for empty input.
    For {
        var: String,
        iterable: Expr,
        body: Vec<Node>,
        otherwise: Option<Vec<Node>>,
    },
}

/// An expression inside a tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A string, number, boolean or `none` literal.
    Literal(Value),
    /// `[a, b, c]`.
    List(Vec<Expr>),
    /// A variable lookup.
    Var(String),
    /// `expr.name`.
    Attr(Box<Expr>, String),
    /// `expr[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// `not expr`.
    Not(Box<Expr>),
    /// `lhs and rhs`.
    And(Box<Expr>, Box<Expr>),
    /// `lhs or rhs`.
    Or(Box<Expr>, Box<Expr>),
    /// A binary comparison.
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `expr is [not] test`.
    Test {
        expr: Box<Expr>,
        test: TestKind,
        negated: bool,
    },
    /// `expr | name(args...)`.
    Filter {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// The variable name at the root of a lookup chain, if any.
    pub fn root_var(&self) -> Option<&str> {
        match self {
            Self::Var(name) => Some(name),
            Self::Attr(inner, _) | Self::Index(inner, _) => inner.root_var(),
            _ => None,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CompareOp {
    /// Operator as written in a template.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Tests usable with `is`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestKind {
    Defined,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_var() {
        let expr = Expr::Index(
            Box::new(Expr::Attr(Box::new(Expr::Var("user".into())), "tags".into())),
            Box::new(Expr::Literal(Value::from(0))),
        );
        assert_eq!(expr.root_var(), Some("user"));
        assert_eq!(Expr::Literal(Value::Null).root_var(), None);
    }

    #[test]
    fn test_plain_text() {
        let template = Template::new(vec![Node::Text("SELECT 1".into())]);
        assert!(template.is_plain_text());

        let template = Template::new(vec![Node::Output(Expr::Var("x".into()))]);
        assert!(!template.is_plain_text());
    }
}

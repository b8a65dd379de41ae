//! Pest grammar parser for SQL templates.

use pest_derive::Parser;

/// The SQL template parser.
#[derive(Parser)]
#[grammar = "parser/template.pest"]
pub struct TemplateParser;

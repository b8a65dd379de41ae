//! Error types for template loading, parsing and rendering.

// These warnings are false positives - the fields are used by derive macros
#![allow(unused_assignments)]

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while loading, parsing or rendering a template.
#[derive(Error, Debug, Diagnostic)]
pub enum TemplateError {
    /// The template file does not exist.
    #[error("template not found: {}", path.display())]
    #[diagnostic(
        code(pgstencil::template::not_found),
        help("template names are resolved relative to the configured template directory")
    )]
    NotFound { path: PathBuf },

    /// The template file exists but could not be read.
    #[error("failed to read template: {}", path.display())]
    #[diagnostic(code(pgstencil::template::read_error))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template body is not valid template syntax.
    #[error("syntax error in template at {line}:{column}: {message}")]
    #[diagnostic(code(pgstencil::template::syntax_error))]
    Syntax {
        #[source_code]
        src: String,
        #[label("error here")]
        span: miette::SourceSpan,
        line: usize,
        column: usize,
        message: String,
    },

    /// A variable referenced by the template is missing from the parameters.
    #[error("undefined template variable `{name}`")]
    #[diagnostic(
        code(pgstencil::template::undefined_variable),
        help("pass the variable in the query parameters or guard it with `is defined`")
    )]
    UndefinedVariable { name: String },

    /// A filter was unknown or applied to an unsupported value.
    #[error("invalid filter `{name}`: {message}")]
    #[diagnostic(code(pgstencil::template::invalid_filter))]
    InvalidFilter { name: String, message: String },

    /// An expression could not be evaluated.
    #[error("invalid template operation: {message}")]
    #[diagnostic(code(pgstencil::template::invalid_operation))]
    InvalidOperation { message: String },

    /// The query parameters did not serialize to a mapping.
    #[error("invalid query parameters: {message}")]
    #[diagnostic(code(pgstencil::template::invalid_params))]
    InvalidParams { message: String },

    /// A caller parameter used a name reserved by the renderer.
    #[error("parameter name `{name}` is reserved")]
    #[diagnostic(
        code(pgstencil::template::reserved_variable),
        help("`{name}` is filled from the target record's fields; rename the parameter")
    )]
    ReservedVariable { name: String },

    /// The target type declares no fields that could be selected.
    #[error("`{type_name}` is not a record type: it declares no fields")]
    #[diagnostic(code(pgstencil::template::not_a_record))]
    NotARecordType { type_name: String },

    /// A column shadows a required field of a flattened base, which could
    /// then never be decoded.
    #[error("`{type_name}` shadows required base field `{field}`")]
    #[diagnostic(
        code(pgstencil::template::shadowed_field),
        help("make the base field an `Option` or mark it `#[serde(default)]`")
    )]
    ShadowedField { type_name: String, field: String },
}

impl TemplateError {
    /// Create a syntax error with source location.
    pub fn syntax(
        src: impl Into<String>,
        offset: usize,
        len: usize,
        (line, column): (usize, usize),
        message: impl Into<String>,
    ) -> Self {
        Self::Syntax {
            src: src.into(),
            span: (offset, len).into(),
            line,
            column,
            message: message.into(),
        }
    }

    /// Create an undefined variable error.
    pub fn undefined(name: impl Into<String>) -> Self {
        Self::UndefinedVariable { name: name.into() }
    }

    /// Create an invalid filter error.
    pub fn invalid_filter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create an invalid parameters error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Check if the template file was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the template file could not be read.
    pub fn is_read_error(&self) -> bool {
        matches!(self, Self::Read { .. })
    }

    /// Check if this error was raised while rendering a template body.
    pub fn is_render_error(&self) -> bool {
        matches!(
            self,
            Self::Syntax { .. }
                | Self::UndefinedVariable { .. }
                | Self::InvalidFilter { .. }
                | Self::InvalidOperation { .. }
                | Self::InvalidParams { .. }
                | Self::ReservedVariable { .. }
        )
    }
}

use miette::Diagnostic;
use thiserror::Error;

/// Failure to turn a byte stream into a policy document.
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("failed to read policy file `{path}`")]
    #[diagnostic(
        code(umbra::load::io),
        help("Check that the file exists and is readable")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {format} document: {message}")]
    #[diagnostic(
        code(umbra::load::malformed),
        help("Policy files must contain a single well-formed YAML or JSON document")
    )]
    Malformed {
        format: &'static str,
        message: String,
        /// 1-based (line, column) into the source, where the decoder reports one.
        location: Option<(usize, usize)>,
    },

    #[error("multiple policies in one file")]
    #[diagnostic(
        code(umbra::load::multiple_documents),
        help("Split each `---`-separated document into its own file")
    )]
    MultipleDocuments,

    #[error("in policy file `{path}`")]
    #[diagnostic(code(umbra::load::file))]
    File {
        path: String,
        #[source]
        source: Box<LoadError>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Invalid(#[from] ValidationError),
}

/// A structural rule of the policy data model was violated.
///
/// `path` is the field path from the document root, e.g.
/// `resourcePolicy.rules[2].actions`.
#[derive(Debug, Error, Diagnostic)]
#[error("invalid policy: {message} (at {path})")]
#[diagnostic(
    code(umbra::validation),
    help("See the policy reference for the required shape of each document kind")
)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Failure to transform a validated policy set into compilation units.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("`{policy}` imports `{name}`, which does not exist")]
    #[diagnostic(
        code(umbra::compile::missing_import),
        help("Every name in `importDerivedRoles` and `variables.import` must match a loaded policy")
    )]
    MissingImport { policy: String, name: String },

    #[error("`{policy}` references derived role `{name}`, which is not defined by any imported set")]
    #[diagnostic(code(umbra::compile::unknown_derived_role))]
    UnknownDerivedRole { policy: String, name: String },

    #[error("duplicate policy identity `{fqn}`")]
    #[diagnostic(
        code(umbra::compile::duplicate),
        help("Two policies may not share the same (kind, name, version, scope)")
    )]
    DuplicatePolicy { fqn: String },

    #[error("variable definitions in `{policy}` form a cycle: {cycle}")]
    #[diagnostic(code(umbra::compile::variable_cycle))]
    VariableCycle { policy: String, cycle: String },

    #[error("`{policy}` defines variable `{name}`, which shadows a reserved binding")]
    #[diagnostic(
        code(umbra::compile::reserved_name),
        help("`request`, `R`, `P`, `variables`, `V` and `now` cannot be redefined")
    )]
    ReservedName { policy: String, name: String },

    #[error("`{policy}` references undefined variable `{name}`")]
    #[diagnostic(code(umbra::compile::undefined_variable))]
    UndefinedVariable { policy: String, name: String },

    #[error("`{policy}` imports `{fqn}`, which is disabled")]
    #[diagnostic(code(umbra::compile::disabled_import))]
    DisabledImport { policy: String, fqn: String },

    #[error("rule {rule} of `{policy}` has no roles or derived roles")]
    #[diagnostic(
        code(umbra::compile::no_roles),
        help("Each resource rule needs at least one entry in `roles` or `derivedRoles`")
    )]
    NoRoles { policy: String, rule: String },

    #[error("invalid expression in `{policy}`: {source}")]
    #[diagnostic(code(umbra::compile::bad_expression))]
    BadExpression {
        policy: String,
        #[source]
        source: ExprError,
    },

    #[error("invalid glob `{pattern}` in `{policy}`: {message}")]
    #[diagnostic(code(umbra::compile::bad_glob))]
    BadGlob {
        policy: String,
        pattern: String,
        message: String,
    },
}

/// Error produced while parsing or evaluating a condition expression.
///
/// At evaluation time these are trapped at the rule level: the rule is
/// recorded as errored in the trace and treated as non-matching.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ExprError {
    #[error("parse error: {0}")]
    #[diagnostic(
        code(umbra::expr::parse),
        help("Supported syntax: comparisons, &&/||/!, in, arithmetic, member access, indexing, function calls")
    )]
    Parse(String),

    #[error("type mismatch: {0}")]
    #[diagnostic(code(umbra::expr::type_mismatch))]
    TypeMismatch(String),

    #[error("unknown name `{0}`")]
    #[diagnostic(code(umbra::expr::unknown_name))]
    UnknownName(String),

    #[error("unknown function `{0}`")]
    #[diagnostic(code(umbra::expr::unknown_function))]
    UnknownFunction(String),

    #[error("division by zero")]
    #[diagnostic(code(umbra::expr::division_by_zero))]
    DivisionByZero,

    #[error("condition evaluated to {actual}, expected bool")]
    #[diagnostic(code(umbra::expr::non_boolean))]
    NonBoolean { actual: &'static str },

    #[error("invalid {what} literal `{input}`: {message}")]
    #[diagnostic(code(umbra::expr::bad_literal))]
    BadLiteral {
        what: &'static str,
        input: String,
        message: String,
    },
}

/// Cooperative cancellation observed between rules or scope levels.
///
/// No partial decision accompanies this error.
#[derive(Debug, Error, Diagnostic)]
#[error("evaluation canceled")]
#[diagnostic(code(umbra::canceled))]
pub struct Canceled;

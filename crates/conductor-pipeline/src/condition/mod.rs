//! Condition expression language used by DECISION stages and loop
//! termination predicates.
//!
//! Expressions are scanned, parsed and evaluated on every call; stage results
//! change between evaluations so nothing is cached.
//!
//! ```text
//! build.success == true && build.metadata.tokens < 4000
//! review.output contains 'approved' or context.sharedState.force == true
//! ```

pub mod evaluator;
pub mod parser;
pub mod scanner;

use conductor_types::{ConductorError, ContextSnapshot, Result};

pub use evaluator::{Value, MISSING};
pub use parser::{BinaryOp, Expr, LiteralValue};

/// Parse an expression without evaluating it. Used by pipeline validation to
/// report syntax errors before a run starts.
pub fn parse_expression(expression: &str) -> Result<Expr> {
    let tokens = scanner::scan(expression)?;
    parser::parse(&tokens)
}

/// Evaluate `expression` against `ctx`.
///
/// Never fails: scan, parse and evaluation errors make the whole expression
/// `false` and are logged at debug level.
pub fn evaluate(expression: &str, ctx: &ContextSnapshot) -> bool {
    match try_evaluate(expression, ctx) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(expression, error = %e, "condition evaluated to false");
            false
        }
    }
}

/// Fallible variant of [`evaluate`].
pub fn try_evaluate(expression: &str, ctx: &ContextSnapshot) -> Result<bool> {
    if expression.trim().is_empty() {
        return Err(make_error("empty expression"));
    }
    let expr = parse_expression(expression)?;
    Ok(evaluator::evaluate_expr(&expr, ctx)?.is_truthy())
}

pub(crate) fn make_error(msg: &str) -> ConductorError {
    ConductorError::ValidationError(format!("condition parse error: {msg}"))
}

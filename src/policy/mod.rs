//! Policy expression language: conditions attached to a profile's ordered
//! policy list and to `conditional_execution` gates.

pub mod evaluate;
pub mod expr;

pub use evaluate::{eval_subject, select_actions, split_actions, PolicyOutcome};
pub use expr::{eval, parse, EvalContext, Expr, ExprError, Value};

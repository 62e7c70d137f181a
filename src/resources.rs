/// Postgresql custom resources and their reconcilers
pub mod postgresql;

/// Phase and error reporting shared by every resource kind
pub mod status;

/// Typed access to the declarations
pub mod store;

/// Literal-or-reference values
pub mod value;

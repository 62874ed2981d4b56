//! Definitions shared across the crate.

/// A witness that a value has passed validation.
///
/// Analyses take `Valid<Program>` instead of `Program` so they can assume
/// structural well-formedness (entry blocks exist, branch targets resolve,
/// every used variable is declared) without re-checking it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Valid<T>(pub T);

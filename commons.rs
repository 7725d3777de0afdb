//! Common utilities shared by the bytecode and analysis layers.

use derive_more::Display;

// A validation error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}

/// A value that passed validation.  The only way to construct this is via
/// `Validate::validate`, so an `&Valid<T>` certifies that the invariants
/// checked there hold.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Valid<T>(pub T);

pub trait Validate: Sized {
    fn validate(self) -> Result<Valid<Self>, ValidationError>;
}

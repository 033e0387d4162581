use crate::error::Error;

/// Result type alias used throughout godwit.
///
/// This is a type alias for `std::result::Result<T, Error>`, providing a
/// convenient shorthand for functions that return godwit errors. All godwit
/// operations that can fail should return this type.
pub type Result<T> = std::result::Result<T, Error>;

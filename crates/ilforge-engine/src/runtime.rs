//! Runtime support routines called by generated code

/// `gcmalloc(size) -> object`, returns zeroed memory
pub const GC_MALLOC: &str = "gcmalloc";
/// `castclassex(obj, vtable, throw_on_failure) -> obj or null`
pub const CAST_CLASS: &str = "castclassex";
/// `throw(obj)`
pub const THROW: &str = "throw";
/// `rethrow()` rethrows the exception being handled
pub const RETHROW: &str = "rethrow";
/// Raises an overflow exception
pub const THROW_OVERFLOW: &str = "__throw_overflow";
/// Filler for abstract vtable slots
pub const PURE_VIRTUAL: &str = "__cxa_pure_virtual";

/// `castclassex` flag for `castclass`
pub const CAST_THROWS: i64 = 1;
/// `castclassex` flag for `isinst`
pub const CAST_RETURNS_NULL: i64 = 0;

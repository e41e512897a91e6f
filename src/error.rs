// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Uniform error type for the flight-control core.
//!
//! Every fallible operation returns `CanonicalResult<T>`, a thin alias
//! over the `canonical_error` crate already used elsewhere in this
//! codebase's lineage. Background-worker loops catch at their own `run()`
//! boundary and log; nothing in the core relies on `?` propagating past a
//! worker thread's outermost function.

pub use canonical_error::{
    aborted_error, deadline_exceeded_error, failed_precondition_error, internal_error,
    invalid_argument_error, unavailable_error, CanonicalError, CanonicalErrorCode,
};

pub type CanonicalResult<T> = Result<T, CanonicalError>;

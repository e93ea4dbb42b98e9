//! DNS wire format handling
//!
//! Transport-agnostic message model plus the low-level packet buffers used
//! to read and write it.
//!
//! # Module Structure
//!
//! * `buffer` - low-level packet buffer operations
//! * `protocol` - message, question and record types
//! * `edns0` - OPT record interpretation and EDNS(0) options
//! * `netutil` - length-prefix framing shared by TCP-like transports

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// OPT record interpretation and EDNS(0) options
pub mod edns0;

/// Length-prefix framing for stream transports
pub mod netutil;

/// DNS protocol definitions and packet handling
pub mod protocol;

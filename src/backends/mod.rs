//! Concrete `Backend` implementations.
//!
//! Only the in-process memory backend lives in this crate (spec.md §1
//! lists it as one of the brokers the virtual engine must support
//! directly; the rest — Redis, SQS, Qpid, Beanstalk, CouchDB, filesystem
//! — are out-of-tree adaptors built on the same `Backend` trait).

pub mod memory;

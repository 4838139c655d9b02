//! Requirement subsystems: stores, resolver, cache, validator, audit ledger.

pub mod audit;
pub mod cache;
pub mod endpoints;
pub mod fields;
pub mod payer;
pub mod policy;
pub mod resolver;
pub mod validator;

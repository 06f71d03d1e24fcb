//! Manager tests driven by an in-memory release registry.

mod support;
mod unit;

//! Test suites for supervisor bootstrap and the session registry.

mod support;

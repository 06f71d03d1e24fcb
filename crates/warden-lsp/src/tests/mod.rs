//! Session tests driven by scripted servers.

mod support;

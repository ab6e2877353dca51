//! LED sign command formatting.
//!
//! The sign firmware accepts one text line per command. This module
//! contains the framing rules and the legacy text encoding it expects.

pub mod frame;

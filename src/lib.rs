#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod commands;
pub mod compile;
pub mod error;
pub mod image;
pub mod logging;
pub mod output;
pub mod paths;
pub mod session;
pub mod settings;

//! Apptainer core CLI - a thin driver over the acquisition, cgroups and
//! fakeroot libraries.

pub mod commands;
pub mod output;

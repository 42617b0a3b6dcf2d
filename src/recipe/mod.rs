// src/recipe/mod.rs

//! Recipe data model and dependency graph
//!
//! Recipes are the declarative units of a chariot build:
//! - **source** recipes fetch an upstream tree (tarball, git, or local)
//! - **host** recipes build tooling installed under `/usr/local`
//! - **target** recipes build packages into the sysroot
//!
//! The graph module resolves symbolic references into indices, rejects
//! cycles, and computes the staging plan the executor materialises before
//! each build.

mod format;
pub mod graph;

pub use format::{
    BuildSpec, Dependency, ImageDependency, Namespace, Payload, Recipe, RecipeId, SourceKind,
    SourceRef, SourceSpec, Status,
};

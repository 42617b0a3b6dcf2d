// src/lib.rs

//! Chariot build orchestrator
//!
//! Chariot bootstraps an operating system from source: it fetches upstream
//! source artifacts, builds host-side tooling (cross-compilers, autotools),
//! and builds target packages into a sysroot, all inside a reproducible
//! Linux container built from a pinned distribution rootfs.
//!
//! # Architecture
//!
//! - Recipes: declarative `source`/`host`/`target` units parsed from a
//!   small DSL, resolved into an in-memory dependency graph
//! - Image sets: per-package rootfs layers hardlink-cloned from their
//!   parent, so container construction is amortised across builds
//! - Stage executor: sequential post-order traversal driving each recipe's
//!   fetch/configure/build/install stages inside an unshared namespace
//! - Cache: all state lives in one directory guarded by an advisory lock;
//!   a recipe directory's existence implies a successful build

pub mod cache;
pub mod config;
pub mod container;
pub mod embed;
mod error;
pub mod fsutil;
pub mod layers;
pub mod pipeline;
pub mod recipe;

pub use cache::Cache;
pub use config::Config;
pub use container::{Container, Mount, OutputConfig};
pub use error::{Error, Result};
pub use layers::{LayerCache, DEFAULT_ROOTFS_VERSION};
pub use pipeline::{NamespaceRunner, Pipeline, PipelineOptions, Runner};
pub use recipe::{Namespace, Recipe, RecipeId};

// src/recipe/format.rs

//! Recipe types: namespaces, payloads, dependency edges, and build status.

use std::fmt;

/// Index of a recipe within the loaded configuration.
pub type RecipeId = usize;

/// The three recipe flavours. The namespace decides both the payload and
/// where the recipe's artifacts land in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Source,
    Host,
    Target,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Source => "source",
            Namespace::Host => "host",
            Namespace::Target => "target",
        }
    }

    pub fn parse(s: &str) -> Option<Namespace> {
        match s {
            "source" => Some(Namespace::Source),
            "host" => Some(Namespace::Host),
            "target" => Some(Namespace::Target),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source recipe obtains its tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    TarGz { b2sum: String },
    TarXz { b2sum: String },
    Git { commit: String },
    Local,
}

/// Payload of a `source` recipe.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub url: String,
    pub kind: SourceKind,
    /// Patchfile name under `<cache>/patches/`, applied after fetch.
    pub patch: Option<String>,
    /// Shell body run in the fetched tree, for source regeneration.
    pub strap: Option<String>,
}

/// A host/target recipe's reference to the source recipe it builds from.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub name: String,
    pub resolved: Option<RecipeId>,
}

/// Payload of a `host` or `target` recipe. Every field is optional; a recipe
/// with no script bodies is a legal no-op install.
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    pub source: Option<SourceRef>,
    pub configure: Option<String>,
    pub build: Option<String>,
    pub install: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Source(SourceSpec),
    Host(BuildSpec),
    Target(BuildSpec),
}

/// An edge to another recipe. `runtime` edges are the ones followed when
/// computing the runtime closure of a build-time dependency.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub namespace: Namespace,
    pub name: String,
    pub runtime: bool,
    pub resolved: Option<RecipeId>,
}

/// A distribution package installed into the container rootfs. The name is
/// passed verbatim to the package manager.
#[derive(Debug, Clone)]
pub struct ImageDependency {
    pub name: String,
    pub runtime: bool,
}

/// Per-run mutable build state. Only the executor writes this.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub invalidated: bool,
    pub built: bool,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub payload: Payload,
    pub dependencies: Vec<Dependency>,
    pub image_dependencies: Vec<ImageDependency>,
    pub status: Status,
}

impl Recipe {
    pub fn namespace(&self) -> Namespace {
        match &self.payload {
            Payload::Source(_) => Namespace::Source,
            Payload::Host(_) => Namespace::Host,
            Payload::Target(_) => Namespace::Target,
        }
    }

    pub fn source_spec(&self) -> Option<&SourceSpec> {
        match &self.payload {
            Payload::Source(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn build_spec(&self) -> Option<&BuildSpec> {
        match &self.payload {
            Payload::Host(spec) | Payload::Target(spec) => Some(spec),
            Payload::Source(_) => None,
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.name)
    }
}

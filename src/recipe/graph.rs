// src/recipe/graph.rs

//! Reference resolution, cycle detection, and staging plans.
//!
//! After parsing, every dependency edge and source reference carries only a
//! `(namespace, name)` pair. Resolution turns those into indices and rejects
//! anything that does not exist; cycle detection then guarantees the graph
//! is a DAG so the executor's post-order recursion terminates.

use crate::error::{Error, Result};
use crate::recipe::{Namespace, Payload, Recipe, RecipeId};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Resolve every dependency edge and source reference in place.
///
/// Returns the `(namespace, name)` lookup table. Duplicate definitions,
/// unresolved edges, and unresolved source references are fatal.
pub fn resolve(recipes: &mut [Recipe]) -> Result<HashMap<(Namespace, String), RecipeId>> {
    let mut index: HashMap<(Namespace, String), RecipeId> = HashMap::new();
    for (id, recipe) in recipes.iter().enumerate() {
        let key = (recipe.namespace(), recipe.name.clone());
        if index.insert(key, id).is_some() {
            return Err(Error::ConfigError(format!(
                "recipe `{}` is defined twice",
                recipe
            )));
        }
    }

    for id in 0..recipes.len() {
        let holder = format!("{}", recipes[id]);

        for dep_index in 0..recipes[id].dependencies.len() {
            let (namespace, name) = {
                let dep = &recipes[id].dependencies[dep_index];
                (dep.namespace, dep.name.clone())
            };
            let target = index.get(&(namespace, name.clone())).copied().ok_or_else(|| {
                Error::ResolutionError(format!("{}/{}` required by `{}", namespace, name, holder))
            })?;
            recipes[id].dependencies[dep_index].resolved = Some(target);
        }

        let source_name = match &recipes[id].payload {
            Payload::Host(spec) | Payload::Target(spec) => {
                spec.source.as_ref().map(|s| s.name.clone())
            }
            Payload::Source(_) => None,
        };
        if let Some(name) = source_name {
            let target = index
                .get(&(Namespace::Source, name.clone()))
                .copied()
                .ok_or_else(|| {
                    Error::ResolutionError(format!("source/{}` required by `{}", name, holder))
                })?;
            if let Payload::Host(spec) | Payload::Target(spec) = &mut recipes[id].payload {
                if let Some(source) = &mut spec.source {
                    source.resolved = Some(target);
                }
            }
        }
    }

    Ok(index)
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Reject dependency cycles.
///
/// Walks every recipe depth-first with visiting/visited colouring; an edge
/// back into an in-flight recipe is a fatal configuration error naming the
/// recycled edge. Source references count as edges because the executor
/// recurses through them.
pub fn detect_cycles(recipes: &[Recipe]) -> Result<()> {
    let mut colours = vec![Colour::White; recipes.len()];
    for id in 0..recipes.len() {
        if colours[id] == Colour::White {
            visit_for_cycles(recipes, id, &mut colours)?;
        }
    }
    Ok(())
}

fn visit_for_cycles(recipes: &[Recipe], id: RecipeId, colours: &mut [Colour]) -> Result<()> {
    colours[id] = Colour::Grey;

    for edge in edges(&recipes[id]) {
        match colours[edge] {
            Colour::Grey => {
                return Err(Error::ConfigError(format!(
                    "dependency cycle through `{}` -> `{}`",
                    recipes[id], recipes[edge]
                )))
            }
            Colour::White => visit_for_cycles(recipes, edge, colours)?,
            Colour::Black => {}
        }
    }

    colours[id] = Colour::Black;
    Ok(())
}

fn edges(recipe: &Recipe) -> Vec<RecipeId> {
    let mut out: Vec<RecipeId> = Vec::with_capacity(recipe.dependencies.len() + 1);
    if let Payload::Host(spec) | Payload::Target(spec) = &recipe.payload {
        if let Some(source) = &spec.source {
            if let Some(id) = source.resolved {
                out.push(id);
            }
        }
    }
    out.extend(recipe.dependencies.iter().filter_map(|d| d.resolved));
    out
}

/// What the executor stages before building one recipe: the dependency
/// artifacts to copy (in install order) and the image-package set.
#[derive(Debug, Default)]
pub struct StagingPlan {
    pub artifacts: Vec<RecipeId>,
    pub images: BTreeSet<String>,
}

/// Compute the staging plan for `id`.
///
/// At build time only the non-runtime-only direct dependencies are
/// installed; from there on only runtime edges are followed (the runtime
/// closure of each build-time dependency). A runtime-only direct edge
/// therefore stages nothing for the recipe itself; it matters one level
/// up, when this recipe is itself a dependency. Installation is idempotent:
/// a recipe reached twice is staged once.
pub fn staging_plan(recipes: &[Recipe], id: RecipeId) -> StagingPlan {
    let mut plan = StagingPlan::default();
    let mut installed: HashSet<RecipeId> = HashSet::new();
    collect(recipes, id, false, &mut installed, &mut plan);
    plan
}

fn collect(
    recipes: &[Recipe],
    id: RecipeId,
    runtime_only: bool,
    installed: &mut HashSet<RecipeId>,
    plan: &mut StagingPlan,
) {
    let recipe = &recipes[id];

    for dep in &recipe.dependencies {
        if dep.runtime != runtime_only {
            continue;
        }
        let Some(dep_id) = dep.resolved else { continue };
        if installed.insert(dep_id) {
            plan.artifacts.push(dep_id);
            collect(recipes, dep_id, true, installed, plan);
        }
    }

    for image in &recipe.image_dependencies {
        if image.runtime != runtime_only {
            continue;
        }
        plan.images.insert(image.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{BuildSpec, Dependency, ImageDependency, SourceKind, SourceRef, SourceSpec, Status};

    fn source(name: &str) -> Recipe {
        Recipe {
            name: name.to_string(),
            payload: Payload::Source(SourceSpec {
                url: "u".to_string(),
                kind: SourceKind::Local,
                patch: None,
                strap: None,
            }),
            dependencies: Vec::new(),
            image_dependencies: Vec::new(),
            status: Status::default(),
        }
    }

    fn target(name: &str, deps: &[(&str, bool)]) -> Recipe {
        Recipe {
            name: name.to_string(),
            payload: Payload::Target(BuildSpec::default()),
            dependencies: deps
                .iter()
                .map(|(dep, runtime)| Dependency {
                    namespace: Namespace::Target,
                    name: dep.to_string(),
                    runtime: *runtime,
                    resolved: None,
                })
                .collect(),
            image_dependencies: Vec::new(),
            status: Status::default(),
        }
    }

    #[test]
    fn test_resolve_fills_indices() {
        let mut recipes = vec![target("app", &[("lib", false)]), target("lib", &[])];
        let index = resolve(&mut recipes).unwrap();
        assert_eq!(recipes[0].dependencies[0].resolved, Some(1));
        assert_eq!(index[&(Namespace::Target, "lib".to_string())], 1);
    }

    #[test]
    fn test_resolve_rejects_duplicates() {
        let mut recipes = vec![target("app", &[]), target("app", &[])];
        let err = resolve(&mut recipes).unwrap_err();
        assert!(matches!(err, Error::ConfigError(msg) if msg.contains("target/app")));
    }

    #[test]
    fn test_resolve_rejects_unknown_dependency() {
        let mut recipes = vec![target("app", &[("missing", false)])];
        let err = resolve(&mut recipes).unwrap_err();
        assert!(matches!(err, Error::ResolutionError(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_resolve_source_reference() {
        let mut recipes = vec![
            Recipe {
                name: "tool".to_string(),
                payload: Payload::Host(BuildSpec {
                    source: Some(SourceRef {
                        name: "tree".to_string(),
                        resolved: None,
                    }),
                    ..BuildSpec::default()
                }),
                dependencies: Vec::new(),
                image_dependencies: Vec::new(),
                status: Status::default(),
            },
            source("tree"),
        ];
        resolve(&mut recipes).unwrap();
        match &recipes[0].payload {
            Payload::Host(spec) => assert_eq!(spec.source.as_ref().unwrap().resolved, Some(1)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_resolve_source_reference_ignores_other_namespaces() {
        // A target named like the reference must not satisfy it.
        let mut recipes = vec![
            Recipe {
                name: "tool".to_string(),
                payload: Payload::Host(BuildSpec {
                    source: Some(SourceRef {
                        name: "tree".to_string(),
                        resolved: None,
                    }),
                    ..BuildSpec::default()
                }),
                dependencies: Vec::new(),
                image_dependencies: Vec::new(),
                status: Status::default(),
            },
            target("tree", &[]),
        ];
        assert!(resolve(&mut recipes).is_err());
    }

    #[test]
    fn test_detect_cycles() {
        let mut recipes = vec![
            target("a", &[("b", false)]),
            target("b", &[("c", false)]),
            target("c", &[("a", false)]),
        ];
        resolve(&mut recipes).unwrap();
        let err = detect_cycles(&recipes).unwrap_err();
        assert!(matches!(err, Error::ConfigError(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut recipes = vec![
            target("top", &[("left", false), ("right", false)]),
            target("left", &[("base", false)]),
            target("right", &[("base", false)]),
            target("base", &[]),
        ];
        resolve(&mut recipes).unwrap();
        detect_cycles(&recipes).unwrap();
    }

    #[test]
    fn test_staging_plan_runtime_closure() {
        // app depends on tool; tool depends on libc (runtime) and make
        // (build-only). Staging app must pull in tool and libc but not make.
        let mut recipes = vec![
            target("app", &[("tool", false)]),
            target("tool", &[("libc", true), ("make", false)]),
            target("libc", &[]),
            target("make", &[]),
        ];
        resolve(&mut recipes).unwrap();

        let plan = staging_plan(&recipes, 0);
        assert_eq!(plan.artifacts, vec![1, 2]);
    }

    #[test]
    fn test_staging_plan_runtime_only_direct_edge_not_staged() {
        // A runtime-only direct dependency stages nothing for the recipe
        // itself, but is pulled in when the recipe is a dependency of
        // something else.
        let mut recipes = vec![
            target("consumer", &[("app", false)]),
            target("app", &[("lib", true)]),
            target("lib", &[]),
        ];
        resolve(&mut recipes).unwrap();

        let app_plan = staging_plan(&recipes, 1);
        assert!(app_plan.artifacts.is_empty());

        let consumer_plan = staging_plan(&recipes, 0);
        assert_eq!(consumer_plan.artifacts, vec![1, 2]);
    }

    #[test]
    fn test_staging_plan_images_filtered_and_sorted() {
        let mut recipes = vec![
            target("app", &[("tool", false)]),
            target("tool", &[]),
        ];
        recipes[0].image_dependencies = vec![
            ImageDependency { name: "zlib".to_string(), runtime: false },
            ImageDependency { name: "acl".to_string(), runtime: false },
        ];
        recipes[1].image_dependencies = vec![
            ImageDependency { name: "gcc".to_string(), runtime: true },
            ImageDependency { name: "doxygen".to_string(), runtime: false },
        ];
        resolve(&mut recipes).unwrap();

        let plan = staging_plan(&recipes, 0);
        let images: Vec<&str> = plan.images.iter().map(|s| s.as_str()).collect();
        // doxygen is build-only for tool, so it is invisible to app.
        assert_eq!(images, vec!["acl", "gcc", "zlib"]);
    }

    #[test]
    fn test_staging_plan_deduplicates() {
        let mut recipes = vec![
            target("app", &[("a", false), ("b", false)]),
            target("a", &[("shared", true)]),
            target("b", &[("shared", true)]),
            target("shared", &[]),
        ];
        resolve(&mut recipes).unwrap();
        let plan = staging_plan(&recipes, 0);
        assert_eq!(plan.artifacts, vec![1, 3, 2]);
    }
}

// src/pipeline.rs

//! Stage executor
//!
//! Drives recipes post-order through their pipelines: a recipe's source
//! reference and dependencies are processed first, then its own stages run
//! inside the container. Per recipe, the executor stages dependency
//! artifacts into scratch directories, materialises the image-set layer,
//! composes the bind mounts, interpolates the script bodies, and cleans up
//! on failure so the cache never holds a half-built recipe directory.

use crate::cache::Cache;
use crate::config::Config;
use crate::container::{Container, Mount, OutputConfig};
use crate::embed;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::layers::LayerCache;
use crate::recipe::{graph, Namespace, Payload, RecipeId, SourceKind, SourceSpec};
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// Executes the commands the stage executor composes. The engine hands them
/// to the namespace harness; tests substitute a runner that records or
/// simulates them instead of entering a container.
pub trait Runner {
    fn exec(&self, container: &Container, argv: &[&str]) -> Result<()>;

    fn exec_shell(&self, container: &Container, command: &str) -> Result<()> {
        self.exec(container, &["bash", "-c", command])
    }
}

/// Default runner: execute inside the unshared namespace.
pub struct NamespaceRunner;

impl Runner for NamespaceRunner {
    fn exec(&self, container: &Container, argv: &[&str]) -> Result<()> {
        container.exec(argv)
    }
}

pub struct PipelineOptions {
    pub verbose: bool,
    pub hide_conflicts: bool,
    pub clean_cache: bool,
    pub thread_count: u32,
    pub rootfs_version: String,
    pub user_vars: Vec<(String, String)>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            verbose: false,
            hide_conflicts: false,
            clean_cache: false,
            thread_count: 8,
            rootfs_version: crate::layers::DEFAULT_ROOTFS_VERSION.to_string(),
            user_vars: Vec::new(),
        }
    }
}

pub struct Pipeline<'a> {
    cache: &'a Cache,
    layers: LayerCache<'a>,
    config: Config,
    opts: PipelineOptions,
    runner: Box<dyn Runner>,
}

impl<'a> Pipeline<'a> {
    pub fn new(cache: &'a Cache, config: Config, opts: PipelineOptions) -> Pipeline<'a> {
        Pipeline::with_runner(cache, config, opts, Box::new(NamespaceRunner))
    }

    /// Construct a pipeline with a custom command runner.
    pub fn with_runner(
        cache: &'a Cache,
        config: Config,
        opts: PipelineOptions,
        runner: Box<dyn Runner>,
    ) -> Pipeline<'a> {
        let layers = LayerCache::new(cache, opts.rootfs_version.clone(), opts.verbose);
        Pipeline {
            cache,
            layers,
            config,
            opts,
            runner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mark a forced recipe for rebuild even if its directory exists.
    pub fn invalidate(&mut self, id: RecipeId) {
        self.config.recipes[id].status.invalidated = true;
    }

    /// Process every forced recipe. A failure aborts only the forced recipe
    /// it occurred under; the remaining ones are still attempted, and the
    /// first failure is returned once all have run.
    pub fn run(&mut self, forced: &[RecipeId]) -> Result<()> {
        self.layers.ensure_rootfs()?;

        let mut first_failure = None;
        for &id in forced {
            if let Err(err) = self.process(id) {
                error!("failed to build {}: {}", self.config.recipes[id], err);
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Post-order: source reference first, then dependencies in declaration
    /// order, then the recipe itself.
    fn process(&mut self, id: RecipeId) -> Result<()> {
        let mut prerequisites: Vec<RecipeId> = Vec::new();
        if let Payload::Host(spec) | Payload::Target(spec) = &self.config.recipes[id].payload {
            if let Some(source) = &spec.source {
                prerequisites.extend(source.resolved);
            }
        }
        prerequisites.extend(
            self.config.recipes[id]
                .dependencies
                .iter()
                .filter_map(|dep| dep.resolved),
        );

        for prerequisite in prerequisites {
            self.process(prerequisite).map_err(|err| {
                Error::BuildFailed(format!(
                    "broken dependency of {}: {}",
                    self.config.recipes[id], err
                ))
            })?;
        }

        let recipe_dir = {
            let recipe = &self.config.recipes[id];
            if recipe.status.built {
                return Ok(());
            }
            if recipe.status.failed {
                return Err(Error::BuildFailed(format!(
                    "{} already failed during this run",
                    recipe
                )));
            }
            let recipe_dir = self.cache.recipe_dir(recipe.namespace(), &recipe.name);
            if recipe_dir.exists() && !recipe.status.invalidated {
                return Ok(());
            }
            recipe_dir
        };

        info!("building {}", self.config.recipes[id]);
        let result = self.execute(id, &recipe_dir);
        match result {
            Ok(()) => self.config.recipes[id].status.built = true,
            Err(_) => {
                self.config.recipes[id].status.failed = true;
                if let Err(clean_err) = fsutil::clean(&recipe_dir) {
                    warn!(
                        "failed to clean up `{}` after failure, please remove it manually: {}",
                        recipe_dir.display(),
                        clean_err
                    );
                }
            }
        }
        result
    }

    fn execute(&self, id: RecipeId, recipe_dir: &Path) -> Result<()> {
        let plan = graph::staging_plan(&self.config.recipes, id);
        self.stage_dependencies(&plan)?;
        let rootfs = self.layers.materialize(&plan.images)?;

        match &self.config.recipes[id].payload {
            Payload::Source(spec) => self.run_source(id, spec, recipe_dir, &rootfs),
            Payload::Host(_) => self.run_build(id, recipe_dir, &rootfs, "/usr/local"),
            Payload::Target(_) => self.run_build(id, recipe_dir, &rootfs, "/usr"),
        }
    }

    /// Wipe the dependency scratch directories and copy every planned
    /// artifact into them.
    fn stage_dependencies(&self, plan: &graph::StagingPlan) -> Result<()> {
        fsutil::recreate_dir(self.cache.deps_source_dir())?;
        fsutil::recreate_dir(self.cache.deps_host_dir())?;
        fsutil::recreate_dir(self.cache.deps_target_dir())?;

        for &dep in &plan.artifacts {
            self.stage_artifact(dep)?;
        }
        Ok(())
    }

    fn stage_artifact(&self, id: RecipeId) -> Result<()> {
        let recipe = &self.config.recipes[id];
        let dir = self.cache.recipe_dir(recipe.namespace(), &recipe.name);
        let warn_conflicts = !self.opts.hide_conflicts;

        let staged = match recipe.namespace() {
            Namespace::Source => {
                let dest = self.cache.deps_source_dir().join(&recipe.name);
                fs::create_dir_all(&dest)?;
                fsutil::copy_recursive(dir.join("src"), &dest, warn_conflicts)
            }
            Namespace::Host => {
                let install = dir.join("install").join("usr").join("local");
                if install.exists() {
                    fsutil::copy_recursive(install, self.cache.deps_host_dir(), warn_conflicts)
                } else {
                    Ok(())
                }
            }
            Namespace::Target => {
                let install = dir.join("install");
                if install.exists() {
                    fsutil::copy_recursive(install, self.cache.deps_target_dir(), warn_conflicts)
                } else {
                    Ok(())
                }
            }
        };

        staged.map_err(|err| Error::BuildFailed(format!("failed to stage {}: {}", recipe, err)))
    }

    /// A container pre-configured with the dependency scratch mounts and
    /// their environment variables.
    fn dependency_container(&self, rootfs: &Path) -> Container {
        let mut container = Container::new(rootfs)
            .mount(Mount::new(self.cache.deps_source_dir(), "/chariot/sources"))
            .mount(Mount::new(self.cache.deps_host_dir(), "/usr/local"))
            .mount(Mount::new(self.cache.deps_target_dir(), "/chariot/sysroot"))
            .env("SOURCES_DIR", "/chariot/sources")
            .env("SYSROOT_DIR", "/chariot/sysroot");

        for (name, value) in &self.opts.user_vars {
            container = container.env(format!("OPTION_{}", name), value.as_str());
        }
        container
    }

    fn run_source(&self, id: RecipeId, spec: &SourceSpec, recipe_dir: &Path, rootfs: &Path) -> Result<()> {
        let recipe = &self.config.recipes[id];
        fsutil::recreate_dir(recipe_dir)?;
        let src_dir = recipe_dir.join("src");
        fs::create_dir_all(&src_dir)?;

        let fetch_output = OutputConfig {
            quiet: !self.opts.verbose,
            log_path: Some(recipe_dir.join("fetch.log")),
        };

        match &spec.kind {
            SourceKind::Local => {
                if !Path::new(&spec.url).exists() {
                    return Err(Error::BuildFailed(format!(
                        "local directory `{}` not found for {}",
                        spec.url, recipe
                    )));
                }
                fsutil::copy_recursive(&spec.url, &src_dir, true)?;
            }
            SourceKind::Git { commit } => {
                let container = Container::new(rootfs)
                    .cwd("/chariot/source")
                    .mount(Mount::new(recipe_dir, "/chariot/source"))
                    .output(fetch_output.clone());
                self.runner
                    .exec_shell(
                        &container,
                        &format!("git clone --depth=1 {} /chariot/source/src", spec.url),
                    )
                    .map_err(|err| stage_error(recipe, "git clone", err))?;
                self.runner
                    .exec_shell(
                        &container,
                        &format!("git -C /chariot/source/src fetch --depth=1 origin {}", commit),
                    )
                    .map_err(|err| stage_error(recipe, "git fetch", err))?;
                self.runner
                    .exec_shell(
                        &container,
                        &format!("git -C /chariot/source/src checkout {}", commit),
                    )
                    .map_err(|err| stage_error(recipe, "git checkout", err))?;
            }
            SourceKind::TarGz { b2sum } => {
                self.fetch_tarball(id, spec, b2sum, "--gzip", recipe_dir, rootfs, &fetch_output)?;
            }
            SourceKind::TarXz { b2sum } => {
                self.fetch_tarball(id, spec, b2sum, "--xz", recipe_dir, rootfs, &fetch_output)?;
            }
        }

        if let Some(patch) = &spec.patch {
            let patches_dir = self.cache.patches_dir();
            if !patches_dir.join(patch).exists() {
                return Err(Error::BuildFailed(format!(
                    "patch `{}` not found for {}",
                    patch, recipe
                )));
            }

            let patch_arg = format!("/chariot/patches/{}", patch);
            let container = Container::new(rootfs)
                .cwd("/chariot/source")
                .mount(Mount::new(&src_dir, "/chariot/source"))
                .mount(Mount::new(&patches_dir, "/chariot/patches").read_only())
                .output(fetch_output.clone());
            self.runner
                .exec(&container, &["patch", "-p1", "-i", &patch_arg])
                .map_err(|err| stage_error(recipe, "patch", err))?;
        }

        if let Some(strap) = &spec.strap {
            let script = embed::expand(
                strap,
                &[("sources_dir", "/chariot/sources")],
                &self.opts.user_vars,
            )?;
            let container = self
                .dependency_container(rootfs)
                .cwd("/chariot/source")
                .mount(Mount::new(&src_dir, "/chariot/source"))
                .env("SOURCE_DIR", "/chariot/source")
                .output(OutputConfig {
                    quiet: !self.opts.verbose,
                    log_path: Some(recipe_dir.join("strap.log")),
                });
            self.runner
                .exec_shell(&container, &script)
                .map_err(|err| stage_error(recipe, "strap", err))?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_tarball(
        &self,
        id: RecipeId,
        spec: &SourceSpec,
        b2sum: &str,
        tar_format: &str,
        recipe_dir: &Path,
        rootfs: &Path,
        output: &OutputConfig,
    ) -> Result<()> {
        let recipe = &self.config.recipes[id];
        fs::write(
            recipe_dir.join("b2sums.txt"),
            format!("{}  /chariot/source/archive\n", b2sum),
        )?;

        let container = Container::new(rootfs)
            .cwd("/chariot/source")
            .mount(Mount::new(recipe_dir, "/chariot/source"))
            .output(output.clone());

        self.runner
            .exec(&container, &["wget", "-qO", "/chariot/source/archive", &spec.url])
            .map_err(|err| stage_error(recipe, "download", err))?;
        self.runner
            .exec(&container, &["b2sum", "--check", "/chariot/source/b2sums.txt"])
            .map_err(|err| stage_error(recipe, "checksum", err))?;
        self.runner
            .exec(
                &container,
                &[
                    "tar",
                    "--no-same-owner",
                    "--no-same-permissions",
                    "--strip-components",
                    "1",
                    "-x",
                    tar_format,
                    "-C",
                    "/chariot/source/src",
                    "-f",
                    "/chariot/source/archive",
                ],
            )
            .map_err(|err| stage_error(recipe, "extract", err))?;
        Ok(())
    }

    fn run_build(&self, id: RecipeId, recipe_dir: &Path, rootfs: &Path, prefix: &str) -> Result<()> {
        let recipe = &self.config.recipes[id];
        let spec = match &recipe.payload {
            Payload::Host(spec) | Payload::Target(spec) => spec,
            Payload::Source(_) => {
                return Err(Error::BuildFailed(format!("{} is not buildable", recipe)))
            }
        };

        let build_dir = recipe_dir.join("build");
        let cache_dir = recipe_dir.join("cache");
        let install_dir = recipe_dir.join("install");
        let logs_dir = recipe_dir.join("logs");
        fsutil::recreate_dir(&build_dir)?;
        fsutil::recreate_dir(&install_dir)?;
        if self.opts.clean_cache {
            fsutil::clean(&cache_dir)?;
        }
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&logs_dir)?;

        let source_dir = spec.source.as_ref().and_then(|source| {
            source.resolved.map(|source_id| {
                let source = &self.config.recipes[source_id];
                self.cache.recipe_dir(Namespace::Source, &source.name).join("src")
            })
        });

        let thread_count = self.opts.thread_count.to_string();
        let mut base_vars: Vec<(&str, &str)> = vec![
            ("prefix", prefix),
            ("sysroot_dir", "/chariot/sysroot"),
            ("sources_dir", "/chariot/sources"),
            ("cache_dir", "/chariot/cache"),
            ("build_dir", "/chariot/build"),
        ];
        if source_dir.is_some() {
            base_vars.push(("source_dir", "/chariot/source"));
        }

        let stages = [
            ("configure", &spec.configure),
            ("build", &spec.build),
            ("install", &spec.install),
        ];
        for (stage, body) in stages {
            let Some(body) = body else { continue };

            let mut vars = base_vars.clone();
            match stage {
                "build" => vars.push(("thread_count", &thread_count)),
                "install" => vars.push(("install_dir", "/chariot/install")),
                _ => {}
            }
            let script = embed::expand(body, &vars, &self.opts.user_vars)?;

            let mut container = self
                .dependency_container(rootfs)
                .cwd("/chariot/build")
                .mount(Mount::new(&build_dir, "/chariot/build"))
                .mount(Mount::new(&cache_dir, "/chariot/cache"))
                .mount(Mount::new(&install_dir, "/chariot/install"))
                .env("PREFIX", prefix)
                .env("THREAD_COUNT", thread_count.as_str())
                .env("BUILD_DIR", "/chariot/build")
                .env("CACHE_DIR", "/chariot/cache")
                .env("INSTALL_DIR", "/chariot/install")
                .output(OutputConfig {
                    quiet: !self.opts.verbose,
                    log_path: Some(logs_dir.join(format!("{}.log", stage))),
                });
            if let Some(dir) = &source_dir {
                container = container
                    .mount(Mount::new(dir, "/chariot/source"))
                    .env("SOURCE_DIR", "/chariot/source");
            }

            self.runner
                .exec_shell(&container, &script)
                .map_err(|err| stage_error(recipe, stage, err))?;
        }

        Ok(())
    }
}

fn stage_error(recipe: &crate::recipe::Recipe, stage: &str, err: Error) -> Error {
    Error::BuildFailed(format!("{} failed for {}: {}", stage, recipe, err))
}

/// Parse a `namespace/name` recipe argument.
pub fn parse_recipe_arg(arg: &str) -> Option<(Namespace, &str)> {
    let (namespace, name) = arg.split_once('/')?;
    let namespace = Namespace::parse(namespace)?;
    if name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

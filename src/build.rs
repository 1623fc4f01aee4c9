use std::path::Path;

use serde::{Deserialize, Serialize};
use stacked_errors::{stacked_get, Result, StackableErr};
use tokio::fs;
use tracing::{debug, info};

use crate::{Command, FileOptions, ImageRecipe};

/// The fixed tag the image artifact is published under
pub const IMAGE_TAG: &str = "hydrobot";

/// The fixed path the rendered recipe is written to before the build
pub const SPEC_FILE: &str = "docker/hydrobot.dockerfile";

/// Where the build tool's output is accumulated across invocations, next to
/// the recipe file
pub const BUILD_LOG_FILE: &str = "docker/build.log";

/// The record of parameters for one build invocation, constructed fresh per
/// invocation and immutable for its duration.
///
/// The cache is always disabled, so every invocation re-executes every
/// provisioning step from scratch; build time is traded for reproducibility
/// confidence, and re-running the trigger is the sole recovery mechanism.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildParams {
    pub no_cache: bool,
    pub tag: String,
    /// Where the rendered recipe text is written, relative to the build
    /// trigger's working directory
    pub spec_file: String,
    /// The build context made available for copy operations: the parent of
    /// the directory holding the recipe file, i.e. the project root
    pub context: String,
}

impl BuildParams {
    /// The fixed parameter set of the build trigger; there is deliberately no
    /// way to configure these per invocation.
    pub fn fixed() -> Self {
        Self {
            no_cache: true,
            tag: IMAGE_TAG.to_owned(),
            spec_file: SPEC_FILE.to_owned(),
            context: ".".to_owned(),
        }
    }

    /// The exact argument list handed to the external build tool
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = vec!["build".to_owned()];
        if self.no_cache {
            args.push("--no-cache".to_owned());
        }
        args.push("-t".to_owned());
        args.push(self.tag.clone());
        args.push("--file".to_owned());
        args.push(self.spec_file.clone());
        args.push(self.context.clone());
        args
    }
}

/// The built, taggable environment produced by a successful build, opaque
/// beyond being addressable by its tag.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    tag: String,
}

impl BuiltImage {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Resolves the image id currently bound to the tag with `docker inspect`
    pub async fn image_id(&self) -> Result<String> {
        let comres = Command::new("docker inspect")
            .arg(&self.tag)
            .run_to_completion()
            .await
            .stack_err("could not run `docker inspect`")?;
        comres
            .assert_success()
            .stack_err("BuiltImage::image_id -> `docker inspect` was not successful")?;
        let v: serde_json::Value =
            serde_json::from_str(comres.stdout_as_utf8().stack()?).stack()?;
        let id = stacked_get!(v[0]["Id"]).as_str().stack()?;
        Ok(id.to_owned())
    }
}

/// Returns if any image is currently published under `tag`
pub async fn image_exists(tag: &str) -> Result<bool> {
    let comres = Command::new("docker images -q")
        .arg(tag)
        .run_to_completion()
        .await
        .stack_err("could not run `docker images`")?;
    comres.assert_success()?;
    Ok(!comres.stdout_as_utf8().stack()?.trim().is_empty())
}

/// Executes `recipe` exactly once with `params`: validates the step ordering,
/// writes the rendered recipe text to the recipe file, and runs
/// `docker build` with the cache disabled. The build tool's output is always
/// appended to [BUILD_LOG_FILE] and is additionally forwarded live when
/// `debug` is set.
///
/// Any failed provisioning step aborts the whole build and is surfaced
/// verbatim from the build tool; there is no partial-success state, and a tag
/// previously bound to a successful artifact stays bound on failure
/// (publication atomicity is the build tool's).
pub async fn build_image(
    recipe: &ImageRecipe,
    params: &BuildParams,
    debug: bool,
) -> Result<BuiltImage> {
    recipe
        .validate()
        .stack_err("build_image -> the recipe failed validation, refusing to invoke the build")?;
    if let Some(spec_dir) = Path::new(&params.spec_file).parent() {
        fs::create_dir_all(spec_dir)
            .await
            .stack_err("build_image -> could not create the recipe file directory")?;
    }
    FileOptions::write_str(&params.spec_file, &recipe.render())
        .await
        .stack_err("build_image -> could not write the rendered recipe")?;
    match image_exists(&params.tag).await {
        Ok(true) => info!(
            "a previous \"{}\" image exists and will be replaced on success",
            params.tag
        ),
        Ok(false) => (),
        Err(e) => debug!(
            "could not check for a preexisting \"{}\" image: {e:?}",
            params.tag
        ),
    }
    let build_log = FileOptions::write(BUILD_LOG_FILE).append(true)?;
    let command = Command::new("docker")
        .args(params.docker_args())
        .debug(debug)
        .log(Some(&build_log));
    debug!("build_image command: {command:#?}");
    command
        .run_to_completion()
        .await?
        .assert_success()
        .stack_err_with_locationless(|| {
            format!(
                "build_image -> `docker build` failed for the recipe written to \"{}\"",
                params.spec_file
            )
        })?;
    Ok(BuiltImage {
        tag: params.tag.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_params_always_disable_the_cache() {
        let params = BuildParams::fixed();
        assert!(params.no_cache);
        assert_eq!(params.tag, IMAGE_TAG);
        assert_eq!(params.spec_file, SPEC_FILE);
        assert_eq!(params.context, ".");
    }

    #[test]
    fn docker_args_are_assembled_in_order() {
        let args = BuildParams::fixed().docker_args();
        assert_eq!(
            args,
            [
                "build",
                "--no-cache",
                "-t",
                "hydrobot",
                "--file",
                "docker/hydrobot.dockerfile",
                "."
            ]
            .map(String::from)
            .to_vec()
        );
    }

    #[test]
    fn build_log_lives_next_to_the_recipe_file() {
        assert_eq!(
            Path::new(BUILD_LOG_FILE).parent(),
            Path::new(SPEC_FILE).parent()
        );
    }

    #[test]
    fn spec_file_lives_one_directory_below_the_context() {
        let params = BuildParams::fixed();
        let spec_dir = Path::new(&params.spec_file).parent().unwrap();
        // the context is the parent of the recipe file directory
        assert_eq!(spec_dir, Path::new("docker"));
        assert_eq!(params.context, ".");
    }
}

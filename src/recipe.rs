use core::fmt;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stacked_errors::{bail_locationless, Result};

// No `OsString`s or `PathBufs` for these structs, the rendered lines get sent
// to docker and it is unclear exactly what normalization it performs. Besides,
// this should be as cross platform as possible.

/// An immutable base image reference in the format "name:tag", declared first
/// in every recipe and never mutated afterwards.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    pub fn new(name: impl AsRef<str>, tag: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_owned(),
            tag: tag.as_ref().to_owned(),
        }
    }
}

impl Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.name, self.tag))
    }
}

/// One ordered unit of work applied to the environment during a build.
///
/// Steps are applied strictly in declaration order; later steps observe the
/// filesystem state left by earlier ones, so reordering changes the resulting
/// environment's semantics. [ImageRecipe::validate] rejects the orderings
/// that are outright correctness defects.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProvisioningStep {
    /// Installs a fixed list of named packages with the system package manager
    SystemPackages { packages: Vec<String> },
    /// Copies an externally supplied, versioned manifest file into the image
    /// and installs the interpreter packages it pins. The copy makes the step
    /// self-contained, independent of the full project tree.
    ///
    /// `break_system_packages` is the explicit override that relaxes the
    /// package manager's externally-managed-environment restriction, which
    /// would otherwise block installing interpreter packages system-wide
    /// inside the sandbox. It renders as an `ENV` line before the first
    /// interpreter-level step rather than being ambient state.
    ManifestInstall {
        manifest: String,
        break_system_packages: bool,
    },
    /// Asserts the fixed working directory for all later steps
    Workdir { path: String },
    /// Copies a filesystem tree from the build context into the image
    CopyTree { from: String, to: String },
    /// Installs the copied project itself as an editable local package, so
    /// source edits inside the sandbox take effect without a reinstall
    EditableInstall {
        path: String,
        break_system_packages: bool,
    },
    /// Declares the default command as an interactive shell, making the image
    /// a development sandbox rather than a production entrypoint
    DefaultShell { shell: String },
}

impl ProvisioningStep {
    fn is_interpreter_level(&self) -> bool {
        matches!(
            self,
            ProvisioningStep::ManifestInstall { .. } | ProvisioningStep::EditableInstall { .. }
        )
    }

    fn breaks_system_packages(&self) -> bool {
        matches!(
            self,
            ProvisioningStep::ManifestInstall {
                break_system_packages: true,
                ..
            } | ProvisioningStep::EditableInstall {
                break_system_packages: true,
                ..
            }
        )
    }
}

/// The declarative, ordered recipe describing how to build the sandbox
/// environment. Pure description; it performs no action by itself.
///
/// Use the chained methods to declare steps in order, [ImageRecipe::validate]
/// to check the ordering invariants, and [ImageRecipe::render] to produce the
/// line-oriented recipe text that `docker build` consumes.
#[must_use]
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRecipe {
    pub base: BaseImage,
    pub steps: Vec<ProvisioningStep>,
}

impl ImageRecipe {
    pub fn new(base: BaseImage) -> Self {
        Self {
            base,
            steps: vec![],
        }
    }

    /// Adds an arbitrary step, useful when the step list is constructed
    /// programmatically
    pub fn step(mut self, step: ProvisioningStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a system-package install step
    pub fn system_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.steps.push(ProvisioningStep::SystemPackages {
            packages: packages
                .into_iter()
                .map(|s| s.as_ref().to_owned())
                .collect(),
        });
        self
    }

    /// Declares an interpreter-package install from a manifest file in the
    /// build context
    pub fn manifest_install(
        mut self,
        manifest: impl AsRef<str>,
        break_system_packages: bool,
    ) -> Self {
        self.steps.push(ProvisioningStep::ManifestInstall {
            manifest: manifest.as_ref().to_owned(),
            break_system_packages,
        });
        self
    }

    /// Declares the working directory for all later steps
    pub fn workdir(mut self, path: impl AsRef<str>) -> Self {
        self.steps.push(ProvisioningStep::Workdir {
            path: path.as_ref().to_owned(),
        });
        self
    }

    /// Declares a filesystem copy from the build context into the image
    pub fn copy_tree(mut self, from: impl AsRef<str>, to: impl AsRef<str>) -> Self {
        self.steps.push(ProvisioningStep::CopyTree {
            from: from.as_ref().to_owned(),
            to: to.as_ref().to_owned(),
        });
        self
    }

    /// Declares an editable install of the copied project tree
    pub fn editable_install(mut self, path: impl AsRef<str>, break_system_packages: bool) -> Self {
        self.steps.push(ProvisioningStep::EditableInstall {
            path: path.as_ref().to_owned(),
            break_system_packages,
        });
        self
    }

    /// Declares the default interactive shell, which must be the last step
    pub fn default_shell(mut self, shell: impl AsRef<str>) -> Self {
        self.steps.push(ProvisioningStep::DefaultShell {
            shell: shell.as_ref().to_owned(),
        });
        self
    }

    /// Checks the ordering invariants of the recipe. A malformed ordering is a
    /// correctness defect that would otherwise only manifest when the build
    /// trigger executes the faulty recipe, so it is rejected here before any
    /// build is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail_locationless!("ImageRecipe::validate() -> the recipe declares no steps");
        }
        let first_system = self
            .steps
            .iter()
            .position(|s| matches!(s, ProvisioningStep::SystemPackages { .. }));
        let first_interpreter = self.steps.iter().position(|s| s.is_interpreter_level());
        let first_workdir = self
            .steps
            .iter()
            .position(|s| matches!(s, ProvisioningStep::Workdir { .. }));
        let first_copy = self
            .steps
            .iter()
            .position(|s| matches!(s, ProvisioningStep::CopyTree { .. }));
        let first_editable = self
            .steps
            .iter()
            .position(|s| matches!(s, ProvisioningStep::EditableInstall { .. }));
        let first_manifest = self
            .steps
            .iter()
            .position(|s| matches!(s, ProvisioningStep::ManifestInstall { .. }));

        // interpreter packages may depend on native headers
        if let Some(interpreter) = first_interpreter {
            match first_system {
                Some(system) if system < interpreter => (),
                _ => bail_locationless!(
                    "ImageRecipe::validate() -> an interpreter-level install is declared before \
                     any system-package install"
                ),
            }
        }
        // the manifest install is independently cacheable only if it happens
        // before the full project tree is copied in
        if let (Some(manifest), Some(copy)) = (first_manifest, first_copy) {
            if manifest > copy {
                bail_locationless!(
                    "ImageRecipe::validate() -> the manifest install must precede the project \
                     tree copy"
                );
            }
        }
        if let Some(editable) = first_editable {
            // the editable install depends on the copied sources being present
            match first_copy {
                Some(copy) if copy < editable => (),
                _ => bail_locationless!(
                    "ImageRecipe::validate() -> an editable install is declared before the \
                     project tree is copied in"
                ),
            }
        }
        if let Some(copy) = first_copy {
            // copying the tree before asserting a working directory would
            // scatter the sources over the base image's root
            match first_workdir {
                Some(workdir) if workdir < copy => (),
                _ => bail_locationless!(
                    "ImageRecipe::validate() -> the project tree is copied before a working \
                     directory is asserted"
                ),
            }
        }
        let shell_count = self
            .steps
            .iter()
            .filter(|s| matches!(s, ProvisioningStep::DefaultShell { .. }))
            .count();
        if shell_count != 1 {
            bail_locationless!(
                "ImageRecipe::validate() -> exactly one default command must be declared"
            );
        }
        if !matches!(
            self.steps.last(),
            Some(ProvisioningStep::DefaultShell { .. })
        ) {
            bail_locationless!("ImageRecipe::validate() -> the default command must be the last step");
        }
        Ok(())
    }

    /// Renders the recipe into the line-oriented text consumed by
    /// `docker build`. The base image line always comes first, and the
    /// package-manager override is emitted as an explicit `ENV` line
    /// immediately before the first interpreter-level step that asks for it.
    pub fn render(&self) -> String {
        let mut out = format!("FROM {}\n", self.base);
        let mut override_emitted = false;
        for step in &self.steps {
            if step.breaks_system_packages() && (!override_emitted) {
                out += "ENV PIP_BREAK_SYSTEM_PACKAGES=1\n";
                override_emitted = true;
            }
            match step {
                ProvisioningStep::SystemPackages { packages } => {
                    out += "RUN apt-get update && apt-get install -y ";
                    out += &packages.join(" ");
                    out += "\n";
                }
                ProvisioningStep::ManifestInstall { manifest, .. } => {
                    let file_name = manifest.rsplit('/').next().unwrap_or(manifest);
                    out += &format!("COPY {manifest} /tmp/{file_name}\n");
                    out += &format!("RUN pip3 install -r /tmp/{file_name}\n");
                }
                ProvisioningStep::Workdir { path } => {
                    out += &format!("WORKDIR {path}\n");
                }
                ProvisioningStep::CopyTree { from, to } => {
                    out += &format!("COPY {from} {to}\n");
                }
                ProvisioningStep::EditableInstall { path, .. } => {
                    out += &format!("RUN pip3 install -e {path}\n");
                }
                ProvisioningStep::DefaultShell { shell } => {
                    out += &format!("CMD [\"{shell}\"]\n");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseImage {
        BaseImage::new("debian", "bookworm")
    }

    fn full_recipe() -> ImageRecipe {
        ImageRecipe::new(base())
            .system_packages(["python3-pip", "python3-dev"])
            .manifest_install("requirements.txt", true)
            .workdir("/app")
            .copy_tree(".", ".")
            .editable_install(".", true)
            .default_shell("/bin/bash")
    }

    #[test]
    fn full_recipe_is_valid() {
        full_recipe().validate().unwrap();
    }

    #[test]
    fn base_image_line_comes_first() {
        let rendered = full_recipe().render();
        assert!(rendered.starts_with("FROM debian:bookworm\n"));
    }

    #[test]
    fn override_renders_once_before_interpreter_steps() {
        let rendered = full_recipe().render();
        let env = rendered.find("ENV PIP_BREAK_SYSTEM_PACKAGES=1").unwrap();
        let pip = rendered.find("RUN pip3 install").unwrap();
        let apt = rendered.find("RUN apt-get").unwrap();
        assert!(apt < env);
        assert!(env < pip);
        assert_eq!(rendered.matches("PIP_BREAK_SYSTEM_PACKAGES").count(), 1);
    }

    #[test]
    fn override_is_absent_when_not_requested() {
        let rendered = ImageRecipe::new(base())
            .system_packages(["python3-pip"])
            .workdir("/app")
            .copy_tree(".", ".")
            .editable_install(".", false)
            .default_shell("/bin/bash")
            .render();
        assert!(!rendered.contains("PIP_BREAK_SYSTEM_PACKAGES"));
    }

    #[test]
    fn manifest_is_copied_before_it_is_installed() {
        let rendered = full_recipe().render();
        let copy = rendered
            .find("COPY requirements.txt /tmp/requirements.txt")
            .unwrap();
        let install = rendered
            .find("RUN pip3 install -r /tmp/requirements.txt")
            .unwrap();
        assert!(copy < install);
    }

    #[test]
    fn shell_default_command_is_last_line() {
        let rendered = full_recipe().render();
        assert!(rendered.ends_with("CMD [\"/bin/bash\"]\n"));
    }

    #[test]
    fn editable_install_before_copy_is_rejected() {
        let recipe = ImageRecipe::new(base())
            .system_packages(["python3-pip"])
            .workdir("/app")
            .editable_install(".", true)
            .copy_tree(".", ".")
            .default_shell("/bin/bash");
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn interpreter_install_without_system_packages_is_rejected() {
        let recipe = ImageRecipe::new(base())
            .manifest_install("requirements.txt", true)
            .workdir("/app")
            .copy_tree(".", ".")
            .default_shell("/bin/bash");
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn copy_without_workdir_is_rejected() {
        let recipe = ImageRecipe::new(base())
            .system_packages(["python3-pip"])
            .copy_tree(".", ".")
            .default_shell("/bin/bash");
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn missing_or_misplaced_default_command_is_rejected() {
        let no_shell = ImageRecipe::new(base())
            .system_packages(["python3-pip"])
            .workdir("/app")
            .copy_tree(".", ".");
        assert!(no_shell.validate().is_err());
        let shell_not_last = ImageRecipe::new(base())
            .system_packages(["python3-pip"])
            .default_shell("/bin/bash")
            .workdir("/app")
            .copy_tree(".", ".");
        assert!(shell_not_last.validate().is_err());
    }

    #[test]
    fn empty_recipe_is_rejected() {
        assert!(ImageRecipe::new(base()).validate().is_err());
    }
}

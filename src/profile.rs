use serde::{Deserialize, Serialize};

use crate::{BaseImage, ImageRecipe};

/// The base the sandbox is provisioned from, fixed at authoring time
pub const BASE_IMAGE_NAME: &str = "debian";
pub const BASE_IMAGE_TAG: &str = "bookworm";

/// The fixed system-package list: the package-manager client, the development
/// headers the interpreter packages compile against, the hardware-bus utility
/// for poking the I2C sensor boards, and the hardware-access development
/// library.
pub const SYSTEM_PACKAGES: [&str; 4] = ["python3-pip", "python3-dev", "i2c-tools", "libi2c-dev"];

/// The externally supplied, versioned interpreter-package manifest
pub const MANIFEST_FILE: &str = "requirements.txt";

/// The fixed working directory the project tree is copied into
pub const SANDBOX_WORKDIR: &str = "/hydrobot";

/// The interactive shell the sandbox drops into by default
pub const SANDBOX_SHELL: &str = "/bin/bash";

/// A named sandbox configuration variant. This is a closed set: each profile
/// fully specifies its own ordered step list, and exactly one profile is
/// active per build ([Profile::active]), so mutually exclusive recipe
/// variants cannot be half-enabled the way commented-out recipe blocks can.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Profile {
    /// The full development sandbox: interpreter packages pinned by the
    /// explicit manifest, then the project tree installed editable on top
    Standard,
    /// No separate manifest; dependency resolution is left entirely to the
    /// editable install of the project's own packaging metadata
    Lean,
}

impl Profile {
    /// The profile the build trigger uses
    pub const fn active() -> Self {
        Profile::Standard
    }

    /// Every member of the closed set, for exhaustive checks
    pub const fn all() -> [Self; 2] {
        [Profile::Standard, Profile::Lean]
    }

    /// The complete ordered recipe for this profile
    pub fn recipe(self) -> ImageRecipe {
        let base = ImageRecipe::new(BaseImage::new(BASE_IMAGE_NAME, BASE_IMAGE_TAG))
            .system_packages(SYSTEM_PACKAGES);
        match self {
            Profile::Standard => base
                .manifest_install(MANIFEST_FILE, true)
                .workdir(SANDBOX_WORKDIR)
                .copy_tree(".", ".")
                .editable_install(".", true)
                .default_shell(SANDBOX_SHELL),
            Profile::Lean => base
                .workdir(SANDBOX_WORKDIR)
                .copy_tree(".", ".")
                .editable_install(".", true)
                .default_shell(SANDBOX_SHELL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProvisioningStep;

    #[test]
    fn every_profile_passes_validation() {
        for profile in Profile::all() {
            profile.recipe().validate().unwrap();
        }
    }

    #[test]
    fn active_profile_is_in_the_closed_set() {
        assert!(Profile::all().contains(&Profile::active()));
    }

    #[test]
    fn standard_profile_declares_the_manifest() {
        let recipe = Profile::Standard.recipe();
        assert!(recipe.steps.iter().any(|s| matches!(
            s,
            ProvisioningStep::ManifestInstall { manifest, .. } if manifest == MANIFEST_FILE
        )));
    }

    #[test]
    fn lean_profile_has_no_manifest() {
        let recipe = Profile::Lean.recipe();
        assert!(!recipe
            .steps
            .iter()
            .any(|s| matches!(s, ProvisioningStep::ManifestInstall { .. })));
    }

    #[test]
    fn profiles_share_the_fixed_base_and_system_packages() {
        for profile in Profile::all() {
            let recipe = profile.recipe();
            assert_eq!(recipe.base.to_string(), "debian:bookworm");
            assert!(matches!(
                recipe.steps.first(),
                Some(ProvisioningStep::SystemPackages { packages })
                    if packages == &SYSTEM_PACKAGES.map(String::from).to_vec()
            ));
        }
    }
}

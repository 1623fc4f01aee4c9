//! The build trigger: builds the hydrobot sandbox image exactly once with the
//! fixed parameters. Takes no arguments; the exit status is zero only if every
//! provisioning step succeeded.

use hydrobox::{build_image, BuildParams, Profile};
use stacked_errors::{Result, StackableErr};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let profile = Profile::active();
    let params = BuildParams::fixed();
    info!(
        "building the \"{}\" sandbox image with the {:?} profile (cache disabled)",
        params.tag, profile
    );
    let built = build_image(&profile.recipe(), &params, true).await.stack()?;
    info!("sandbox image \"{}\" is ready", built.tag());
    Ok(())
}

use std::error::Error;
use vergen::EmitBuilder;

/// Expose `var` to the crate as `name` at compile time, if it is set
fn forward_env(var: &str, name: &str) {
    println!("cargo:rerun-if-env-changed={var}");
    if let Ok(value) = std::env::var(var) {
        println!("cargo:rustc-env={name}={value}");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Short sha of the checkout, or `GIT_SHA` when building outside of a repository
    if EmitBuilder::builder()
        .fail_on_error()
        .git_sha(true)
        .emit()
        .is_err()
    {
        forward_env("GIT_SHA", "VERGEN_GIT_SHA");
    }

    forward_env("DOCKER_LABEL", "DOCKER_LABEL");

    Ok(())
}

use anyhow::{anyhow, Context};
use std::env;

const BUILD_EBPF_ENV: &str = "HOOKTAIL_BUILD_EBPF";
const PROBES: [&str; 2] = ["fcntl_probe", "guard_probe"];

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-env-changed={}", BUILD_EBPF_ENV);

    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    // Probe compilation needs bpf-linker and a nightly toolchain, so it is opt-in.
    // Without it the agent loads objects from --probes-dir at runtime.
    if env::var_os(BUILD_EBPF_ENV).is_none() {
        return Ok(());
    }

    if env::consts::OS != "linux" {
        println!(
            "cargo:warning=eBPF compilation skipped on {}: probes only build on Linux.",
            env::consts::OS
        );
        return Ok(());
    }

    let aya_build::cargo_metadata::Metadata { packages, .. } =
        aya_build::cargo_metadata::MetadataCommand::new()
            .manifest_path("hooktail-probes/Cargo.toml")
            .no_deps()
            .exec()
            .context("MetadataCommand::exec")?;

    let ebpf_package = packages
        .into_iter()
        .find(|pkg| pkg.name == "hooktail-probes")
        .ok_or_else(|| anyhow!("hooktail-probes package not found"))?;

    aya_build::build_ebpf([ebpf_package])?;

    let out_dir = env::var("OUT_DIR")?;
    for probe in PROBES {
        let probe_path = format!("{}/{}", out_dir, probe);
        if !std::path::Path::new(&probe_path).exists() {
            return Err(anyhow!(
                "eBPF probe compilation failed: {} not found",
                probe_path
            ));
        }
    }

    println!("cargo:rustc-env=HOOKTAIL_PROBES_DIR={}", out_dir);
    Ok(())
}

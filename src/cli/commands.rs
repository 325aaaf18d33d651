use crate::cli::Commands;
use crate::config::Config;
use crate::Result;

#[cfg(target_os = "linux")]
pub async fn handle_command(command: Commands, config: Config) -> Result<()> {
    use crate::agent;
    use crate::ebpf::loader::ProbeLoader;
    use tracing::info;

    let loader = match &config.probes_dir {
        Some(dir) => ProbeLoader::new(dir.clone()),
        None => ProbeLoader::with_default_path(),
    };
    info!("Probe directory: {}", loader.probes_dir().display());

    match command {
        Commands::Fcntl { .. } => agent::fcntl::run(&loader, &config.fcntl).await,
        Commands::Guard { .. } => agent::guard::run(&loader, &config.guard).await,
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn handle_command(_command: Commands, _config: Config) -> Result<()> {
    Err(crate::HooktailError::ConfigError(
        "hooktail requires Linux to run eBPF programs".to_string(),
    ))
}

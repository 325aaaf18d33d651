use crate::{HooktailError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default location of installed probe objects
pub const DEFAULT_PROBES_DIR: &str = "/usr/lib/hooktail/probes";

/// Minimum kernel for BPF ring buffers
const MIN_KERNEL: (u32, u32) = (5, 8);

/// Probe directory baked in by build.rs when the probes were compiled
pub fn default_probes_dir() -> PathBuf {
    PathBuf::from(option_env!("HOOKTAIL_PROBES_DIR").unwrap_or(DEFAULT_PROBES_DIR))
}

pub struct ProbeLoader {
    probes_dir: PathBuf,
}

impl ProbeLoader {
    pub fn new(probes_dir: PathBuf) -> Self {
        Self { probes_dir }
    }

    pub fn with_default_path() -> Self {
        Self::new(default_probes_dir())
    }

    pub fn probes_dir(&self) -> &Path {
        &self.probes_dir
    }

    /// Path of a probe object, failing when it is not installed
    pub fn probe_path(&self, name: &str) -> Result<PathBuf> {
        let probe_path = self.probes_dir.join(name);

        if !probe_path.exists() {
            return Err(HooktailError::ProgramLoadFailed(format!(
                "Probe file not found: {}",
                probe_path.display()
            )));
        }

        Ok(probe_path)
    }
}

/// Parse `major.minor` out of a kernel release string like `6.1.0-18-amd64`
pub fn parse_kernel_version(release: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() < 2 {
        return Err(HooktailError::ConfigError(format!(
            "Could not parse kernel version: {}",
            release.trim()
        )));
    }

    let major: u32 = parts[0].trim().parse().map_err(|_| {
        HooktailError::ConfigError(format!("Invalid kernel major version: {}", parts[0]))
    })?;

    let minor_str = parts[1].split('-').next().unwrap_or(parts[1]);
    let minor: u32 = minor_str.trim().parse().map_err(|_| {
        HooktailError::ConfigError(format!("Invalid kernel minor version: {}", parts[1]))
    })?;

    Ok((major, minor))
}

pub fn check_kernel_version(release: &str) -> Result<()> {
    let (major, minor) = parse_kernel_version(release)?;

    if (major, minor) < MIN_KERNEL {
        return Err(HooktailError::KernelVersionTooOld {
            version: release.trim().to_string(),
            min_version: format!("{}.{}", MIN_KERNEL.0, MIN_KERNEL.1),
        });
    }

    debug!("Kernel version: {} (supported)", release.trim());
    Ok(())
}

#[cfg(target_os = "linux")]
pub use kernel::{raise_memlock_rlimit, LoadedProbe};

#[cfg(target_os = "linux")]
mod kernel {
    use super::*;
    use aya::maps::Map;
    use aya::Ebpf;

    impl ProbeLoader {
        /// Raise the memlock limit, then load and verify `name` from the probe directory
        pub fn load(&self, name: &str) -> Result<LoadedProbe> {
            run_preflight_checks()?;
            raise_memlock_rlimit()?;

            let path = self.probe_path(name)?;
            debug!("Loading eBPF probe: {}", path.display());

            let bpf = Ebpf::load_file(&path)
                .map_err(|e| HooktailError::ProgramLoadFailed(format!("{}: {}", name, e)))?;

            info!("Successfully loaded probe: {}", name);
            Ok(LoadedProbe {
                name: name.to_string(),
                bpf,
            })
        }
    }

    /// Loaded object: owns every program and map it contains
    pub struct LoadedProbe {
        name: String,
        bpf: Ebpf,
    }

    impl LoadedProbe {
        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn bpf_mut(&mut self) -> &mut Ebpf {
            &mut self.bpf
        }

        /// Move a map out of the object so it can be owned by its user
        pub fn take_map(&mut self, name: &str) -> Result<Map> {
            let available_maps: Vec<_> =
                self.bpf.maps().map(|(name, _)| name.to_string()).collect();
            self.bpf.take_map(name).ok_or_else(|| {
                HooktailError::MapError(format!(
                    "{} map not found in {}. Available maps: {:?}",
                    name, self.name, available_maps
                ))
            })
        }

        /// Forward aya-log records from the probe into the process logger
        pub fn init_logger(&mut self) {
            if let Err(e) = aya_log::EbpfLogger::init(&mut self.bpf) {
                // The probe has no log statements, or they were compiled out.
                warn!("Failed to initialize EbpfLogger for {}: {}", self.name, e);
            }
        }

        pub fn unload(self) {
            info!("Unloading {}...", self.name);
            drop(self.bpf);
        }
    }

    /// Lift RLIMIT_MEMLOCK so kernels without memcg accounting can create maps
    pub fn raise_memlock_rlimit() -> Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };

        // SAFETY: setrlimit only reads the struct we pass.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            return Err(HooktailError::PrivilegeError(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        debug!("RLIMIT_MEMLOCK raised to infinity");
        Ok(())
    }

    fn run_preflight_checks() -> Result<()> {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
        check_kernel_version(&release)?;
        check_btf();
        check_capabilities();
        Ok(())
    }

    fn check_btf() {
        if !Path::new("/sys/kernel/btf/vmlinux").exists() {
            warn!("BTF not found at /sys/kernel/btf/vmlinux; fentry attachment will fail");
        }
    }

    fn check_capabilities() {
        // SAFETY: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };

        if euid != 0 {
            warn!(
                "Not running as root (euid={}). Ensure CAP_BPF, CAP_PERFMON and CAP_SYS_RESOURCE are granted.",
                euid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.1.0-18-amd64").unwrap(), (6, 1));
        assert_eq!(parse_kernel_version("5.15.0\n").unwrap(), (5, 15));
        assert_eq!(parse_kernel_version("5.8-rc1").unwrap(), (5, 8));
        assert!(parse_kernel_version("garbage").is_err());
        assert!(parse_kernel_version("x.y").is_err());
    }

    #[test]
    fn test_kernel_version_minimum() {
        assert!(check_kernel_version("5.8.0").is_ok());
        assert!(check_kernel_version("6.6.7").is_ok());
        assert!(matches!(
            check_kernel_version("5.4.0-150-generic"),
            Err(HooktailError::KernelVersionTooOld { .. })
        ));
        assert!(check_kernel_version("4.19.0").is_err());
    }

    #[test]
    fn test_missing_probe_is_load_error() {
        let dir = TempDir::new().unwrap();
        let loader = ProbeLoader::new(dir.path().to_path_buf());

        let err = loader.probe_path("fcntl_probe").unwrap_err();
        assert!(matches!(err, HooktailError::ProgramLoadFailed(_)));
        assert!(err.to_string().contains("Probe file not found"));

        std::fs::write(dir.path().join("fcntl_probe"), b"\x7fELF").unwrap();
        assert!(loader.probe_path("fcntl_probe").is_ok());
    }
}

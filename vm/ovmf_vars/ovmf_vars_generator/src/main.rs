// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generates an OVMF variables store with the default Secure Boot keys
//! enrolled, then boots a Linux kernel against it to confirm that Secure Boot
//! is enforced.

#![forbid(unsafe_code)]

mod download;

use anyhow::Context;
use clap::Parser;
use ovmf_vars::BootPayload;
use ovmf_vars::FirmwareImages;
use ovmf_vars::GeneratorConfig;
use ovmf_vars::PayloadFile;
use ovmf_vars::QemuLauncher;
use ovmf_vars::console::Echo;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_KERNEL_URL: &str = "https://download.fedoraproject.org/pub/fedora/linux/releases/{version}/Everything/x86_64/os/images/pxeboot/vmlinuz";
const DEFAULT_INITRD_URL: &str = "https://download.fedoraproject.org/pub/fedora/linux/releases/{version}/Everything/x86_64/os/images/pxeboot/initrd.img";

#[derive(Parser, Debug)]
#[clap(
    name = "ovmf-vars-generator",
    about = "Enroll the default Secure Boot keys into an OVMF vars file and verify them."
)]
struct Options {
    /// Filename for the output vars file
    output: PathBuf,

    /// Overwrite an existing output file
    #[clap(long)]
    force: bool,

    /// Print the QEMU guest output
    #[clap(long)]
    print_output: bool,

    /// Print status
    #[clap(short, long)]
    verbose: bool,

    /// QEMU binary path
    #[clap(long, default_value = "/usr/bin/qemu-system-x86_64")]
    qemu_binary: PathBuf,

    /// OVMF Secure Boot code file
    #[clap(long, default_value = "/usr/share/edk2/ovmf/OVMF_CODE.secboot.fd")]
    ovmf_binary: PathBuf,

    /// OVMF empty vars file
    #[clap(long, default_value = "/usr/share/edk2/ovmf/OVMF_VARS.fd")]
    ovmf_template_vars: PathBuf,

    /// Path to the UEFI shell ISO
    #[clap(long, default_value = "/usr/share/edk2/ovmf/UefiShell.iso")]
    uefi_shell_iso: PathBuf,

    /// Fedora version to get the kernel/initrd from for checking
    #[clap(long, default_value = "27")]
    fedora_version: String,

    /// Kernel URL. `{version}` is replaced with the Fedora version.
    #[clap(long, default_value = DEFAULT_KERNEL_URL)]
    kernel_url: String,

    /// Initrd URL. `{version}` is replaced with the Fedora version.
    #[clap(long, default_value = DEFAULT_INITRD_URL)]
    initrd_url: String,

    /// Directory in which the downloaded kernel and initrd are cached
    #[clap(long, default_value_os_t = std::env::temp_dir())]
    cache_dir: PathBuf,
}

impl Options {
    fn config(&self) -> GeneratorConfig {
        let payload = |url: &str, name: &str| PayloadFile {
            url: url.replace("{version}", &self.fedora_version),
            path: self.cache_dir.join(name),
        };
        GeneratorConfig {
            output: self.output.clone(),
            force: self.force,
            qemu_binary: self.qemu_binary.clone(),
            firmware: FirmwareImages {
                code: self.ovmf_binary.clone(),
                template_vars: self.ovmf_template_vars.clone(),
                shell_iso: self.uefi_shell_iso.clone(),
            },
            payload: BootPayload {
                kernel: payload(&self.kernel_url, "qemu-kernel"),
                initrd: payload(&self.initrd_url, "qemu-initrd"),
            },
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .log_internal_errors(true)
        .with_env_filter(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    init_logging(opts.verbose);

    let config = opts.config();
    let print_output = opts.print_output;
    let mut echo = || -> Option<Echo> {
        print_output.then(|| Box::new(std::io::stdout()) as Echo)
    };

    ovmf_vars::provision(
        &config,
        &mut QemuLauncher,
        &mut download::HttpFetcher,
        &mut echo,
    )
    .with_context(|| format!("failed to provision {}", config.output.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn verify_cli() {
        Options::command().debug_assert();
    }

    #[test]
    fn defaults_follow_fedora_version() {
        let opts = Options::try_parse_from([
            "ovmf-vars-generator",
            "--fedora-version",
            "38",
            "--cache-dir",
            "/var/cache/ovmf",
            "vars.fd",
        ])
        .unwrap();
        let config = opts.config();
        assert_eq!(config.output, Path::new("vars.fd"));
        assert!(!config.force);
        assert_eq!(
            config.payload.kernel.url,
            "https://download.fedoraproject.org/pub/fedora/linux/releases/38/Everything/x86_64/os/images/pxeboot/vmlinuz"
        );
        assert_eq!(
            config.payload.initrd.url,
            "https://download.fedoraproject.org/pub/fedora/linux/releases/38/Everything/x86_64/os/images/pxeboot/initrd.img"
        );
        assert_eq!(
            config.payload.kernel.path,
            Path::new("/var/cache/ovmf/qemu-kernel")
        );
        assert_eq!(
            config.firmware.code,
            Path::new("/usr/share/edk2/ovmf/OVMF_CODE.secboot.fd")
        );
    }

    #[test]
    fn custom_urls_are_templated_too() {
        let opts = Options::try_parse_from([
            "ovmf-vars-generator",
            "--force",
            "--kernel-url",
            "https://mirror.example/{version}/vmlinuz",
            "--initrd-url",
            "https://mirror.example/fixed/initrd.img",
            "out.fd",
        ])
        .unwrap();
        let config = opts.config();
        assert!(config.force);
        assert_eq!(config.payload.kernel.url, "https://mirror.example/27/vmlinuz");
        assert_eq!(
            config.payload.initrd.url,
            "https://mirror.example/fixed/initrd.img"
        );
    }

    #[test]
    fn output_is_required() {
        assert!(Options::try_parse_from(["ovmf-vars-generator", "--force"]).is_err());
    }
}

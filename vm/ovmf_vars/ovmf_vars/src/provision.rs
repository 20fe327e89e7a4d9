// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two phase provisioning flow: enroll the keys, then prove the result
//! enforces Secure Boot.

use crate::console::Echo;
use crate::enroll::EnrollSession;
use crate::error::Error;
use crate::qemu::Phase;
use crate::qemu::QemuConfig;
use crate::qemu::QemuInvocation;
use crate::session::Launch;
use crate::session::run_session;
use crate::validate::ValidateSession;
use std::path::Path;
use std::path::PathBuf;

/// Read-only firmware inputs.
#[derive(Debug, Clone)]
pub struct FirmwareImages {
    /// Secure Boot capable OVMF code image.
    pub code: PathBuf,
    /// Empty variables store copied to the output before enrollment.
    pub template_vars: PathBuf,
    /// UEFI shell ISO containing `EnrollDefaultKeys.efi`.
    pub shell_iso: PathBuf,
}

/// One file of the kernel/initrd pair used for validation.
#[derive(Debug, Clone)]
pub struct PayloadFile {
    /// Where to fetch it from.
    pub url: String,
    /// Where it is cached locally.
    pub path: PathBuf,
}

/// The kernel and initrd booted during validation.
#[derive(Debug, Clone)]
pub struct BootPayload {
    /// Kernel image.
    pub kernel: PayloadFile,
    /// Initial ramdisk.
    pub initrd: PayloadFile,
}

/// Everything needed to produce and verify a variables store.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// The variables store to create.
    pub output: PathBuf,
    /// Overwrite `output` if it exists.
    pub force: bool,
    /// The QEMU binary.
    pub qemu_binary: PathBuf,
    /// Firmware inputs.
    pub firmware: FirmwareImages,
    /// Validation boot payload.
    pub payload: BootPayload,
}

impl GeneratorConfig {
    fn qemu(&self) -> QemuConfig {
        QemuConfig {
            qemu_binary: self.qemu_binary.clone(),
            ovmf_code: self.firmware.code.clone(),
            vars: self.output.clone(),
        }
    }
}

/// Downloads boot payload files.
pub trait FetchPayload {
    /// Ensures `target` exists, downloading it from `url` if it does not.
    fn fetch(
        &mut self,
        url: &str,
        target: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Creates `config.output` with the default keys enrolled and verifies that
/// a kernel booted against it reports Secure Boot lockdown.
///
/// `echo` is called once per phase for the console echo sink, if any.
pub fn provision(
    config: &GeneratorConfig,
    launcher: &mut impl Launch,
    fetcher: &mut impl FetchPayload,
    echo: &mut impl FnMut() -> Option<Echo>,
) -> Result<(), Error> {
    if config.output.exists() && !config.force {
        return Err(Error::OutputExists(config.output.clone()));
    }

    enroll_keys(config, launcher, echo())?;
    test_keys(config, launcher, fetcher, echo())?;

    tracing::info!(path = %config.output.display(), "created and verified vars");
    Ok(())
}

fn enroll_keys(
    config: &GeneratorConfig,
    launcher: &mut impl Launch,
    echo: Option<Echo>,
) -> Result<(), Error> {
    tracing::info!(
        template = %config.firmware.template_vars.display(),
        path = %config.output.display(),
        "copying template vars"
    );
    fs_err::copy(&config.firmware.template_vars, &config.output).map_err(Error::CopyTemplate)?;

    let phase = Phase::Enroll {
        shell_iso: config.firmware.shell_iso.clone(),
    };
    let invocation = QemuInvocation::new(&config.qemu(), &phase);
    run_session(launcher, &invocation, &mut EnrollSession::new(), echo)
}

fn test_keys(
    config: &GeneratorConfig,
    launcher: &mut impl Launch,
    fetcher: &mut impl FetchPayload,
    echo: Option<Echo>,
) -> Result<(), Error> {
    let payload = &config.payload;
    for (what, file) in [("kernel", &payload.kernel), ("initrd", &payload.initrd)] {
        fetcher
            .fetch(&file.url, &file.path)
            .map_err(|source| Error::Fetch { what, source })?;
    }

    let phase = Phase::Validate {
        kernel: payload.kernel.path.clone(),
        initrd: payload.initrd.path.clone(),
    };
    let invocation = QemuInvocation::new(&config.qemu(), &phase);
    run_session(launcher, &invocation, &mut ValidateSession::new(), echo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FailureReason;
    use crate::session::tests::Event;
    use crate::session::tests::FakeLauncher;

    #[derive(Default)]
    struct FakeFetcher(Vec<String>);

    impl FetchPayload for FakeFetcher {
        fn fetch(
            &mut self,
            url: &str,
            _target: &Path,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.push(url.to_owned());
            Ok(())
        }
    }

    const ENROLL_OK: &[u8] = b"UEFI Interactive Shell\r\ninfo: success\r\n";
    const ENROLL_CRASH: &[u8] = b"UEFI Interactive Shell\r\nqemu: terminating on signal\r\n";
    const BOOT_ENABLED: &[u8] = b"Linux\nSecure boot enabled and kernel locked down\n";
    const BOOT_DISABLED: &[u8] = b"Linux\nSecure boot disabled\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: GeneratorConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("OVMF_VARS.fd");
        fs_err::write(&template, [0xff; 64]).unwrap();
        let payload = |name: &str| PayloadFile {
            url: format!("https://example.invalid/{name}"),
            path: dir.path().join(name),
        };
        let config = GeneratorConfig {
            output: dir.path().join("vars.fd"),
            force: false,
            qemu_binary: "qemu-system-x86_64".into(),
            firmware: FirmwareImages {
                code: "OVMF_CODE.secboot.fd".into(),
                template_vars: template,
                shell_iso: "UefiShell.iso".into(),
            },
            payload: BootPayload {
                kernel: payload("qemu-kernel"),
                initrd: payload("qemu-initrd"),
            },
        };
        Fixture { _dir: dir, config }
    }

    fn launched(launcher: &FakeLauncher) -> Vec<&'static str> {
        launcher
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Launched(phase) => Some(phase),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn existing_output_fails_before_launch() {
        let f = fixture();
        fs_err::write(&f.config.output, b"keep me").unwrap();
        let mut launcher = FakeLauncher::new([ENROLL_OK, BOOT_ENABLED]);
        let mut fetcher = FakeFetcher::default();

        let err = provision(&f.config, &mut launcher, &mut fetcher, &mut || None).unwrap_err();
        assert!(matches!(err, Error::OutputExists(_)));
        assert!(launcher.events().is_empty());
        assert!(fetcher.0.is_empty());
        assert_eq!(fs_err::read(&f.config.output).unwrap(), b"keep me");
    }

    #[test]
    fn force_overwrites_existing_output() {
        let mut f = fixture();
        f.config.force = true;
        fs_err::write(&f.config.output, b"stale").unwrap();
        let mut launcher = FakeLauncher::new([ENROLL_OK, BOOT_ENABLED]);

        provision(&f.config, &mut launcher, &mut FakeFetcher::default(), &mut || None).unwrap();
        assert_eq!(fs_err::read(&f.config.output).unwrap(), [0xff; 64]);
    }

    #[test]
    fn full_run_succeeds() {
        let f = fixture();
        let mut launcher = FakeLauncher::new([ENROLL_OK, BOOT_ENABLED]);
        let mut fetcher = FakeFetcher::default();

        provision(&f.config, &mut launcher, &mut fetcher, &mut || None).unwrap();
        assert_eq!(launched(&launcher), ["enroll", "validate"]);
        assert_eq!(launcher.kills(), 2);
        assert_eq!(
            fetcher.0,
            [
                "https://example.invalid/qemu-kernel",
                "https://example.invalid/qemu-initrd"
            ]
        );
        assert!(f.config.output.exists());
    }

    #[test]
    fn enrollment_failure_skips_validation() {
        let f = fixture();
        let mut launcher = FakeLauncher::new([ENROLL_CRASH, BOOT_ENABLED]);
        let mut fetcher = FakeFetcher::default();

        let err = provision(&f.config, &mut launcher, &mut fetcher, &mut || None).unwrap_err();
        assert!(matches!(
            err,
            Error::Session {
                phase: "enroll",
                reason: FailureReason::EnrollmentMarkerNotObserved
            }
        ));
        assert_eq!(launched(&launcher), ["enroll"]);
        assert_eq!(launcher.kills(), 1);
        assert!(fetcher.0.is_empty());
    }

    #[test]
    fn secure_boot_disabled_fails() {
        let f = fixture();
        let mut launcher = FakeLauncher::new([ENROLL_OK, BOOT_DISABLED]);

        let err = provision(&f.config, &mut launcher, &mut FakeFetcher::default(), &mut || None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Session {
                phase: "validate",
                reason: FailureReason::SecureBootDisabled
            }
        ));
        assert_eq!(launcher.kills(), 2);
    }

    #[test]
    fn missing_template_fails_before_launch() {
        let mut f = fixture();
        f.config.firmware.template_vars = f.config.output.with_file_name("missing.fd");
        let mut launcher = FakeLauncher::new([ENROLL_OK, BOOT_ENABLED]);

        let err = provision(&f.config, &mut launcher, &mut FakeFetcher::default(), &mut || None)
            .unwrap_err();
        assert!(matches!(err, Error::CopyTemplate(_)));
        assert!(launcher.events().is_empty());
    }
}

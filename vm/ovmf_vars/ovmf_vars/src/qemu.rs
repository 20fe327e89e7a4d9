// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction and launch of the QEMU processes that host each phase.
//!
//! [`QemuInvocation::new`] is pure: it only assembles the argument vector.
//! Spawning is done by a [`Launch`] implementation, which for real runs is
//! [`QemuLauncher`].

use crate::session::Launch;
use crate::session::Terminate;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStderr;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;

/// Paths shared by both phases.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// The `qemu-system-x86_64` binary.
    pub qemu_binary: PathBuf,
    /// The Secure Boot capable OVMF code image. Always mapped read-only.
    pub ovmf_code: PathBuf,
    /// The variables store being provisioned.
    pub vars: PathBuf,
}

/// The phase a guest is launched for, with its phase specific inputs.
#[derive(Debug, Clone)]
pub enum Phase {
    /// Boot the UEFI shell ISO and enroll the default keys.
    Enroll {
        /// Bootable UEFI shell image containing `EnrollDefaultKeys.efi`.
        shell_iso: PathBuf,
    },
    /// Boot a Linux kernel and check that it reports Secure Boot lockdown.
    Validate {
        /// Kernel image.
        kernel: PathBuf,
        /// Initial ramdisk.
        initrd: PathBuf,
    },
}

impl Phase {
    /// The access mode of the variables drive in this phase.
    pub fn vars_access(&self) -> VarsAccess {
        match self {
            Phase::Enroll { .. } => VarsAccess::ReadWrite,
            Phase::Validate { .. } => VarsAccess::ReadOnly,
        }
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Enroll { .. } => "enroll",
            Phase::Validate { .. } => "validate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the variables flash drive is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarsAccess {
    /// The shell's enrollment tool may write new keys.
    ReadWrite,
    /// The store under test cannot be mutated by the guest.
    ReadOnly,
}

impl VarsAccess {
    fn readonly_value(self) -> &'static str {
        match self {
            VarsAccess::ReadWrite => "off",
            VarsAccess::ReadOnly => "on",
        }
    }
}

/// A fully formed QEMU command line.
#[derive(Debug, Clone)]
pub struct QemuInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    phase: &'static str,
}

impl QemuInvocation {
    /// Builds the invocation for `phase`.
    pub fn new(config: &QemuConfig, phase: &Phase) -> Self {
        let mut args = Args::default();
        args.push_all([
            "-machine",
            "q35,smm=on,accel=kvm",
            "-display",
            "none",
            "-no-user-config",
            "-nodefaults",
            "-m",
            "256",
            "-smp",
            "2,sockets=2,cores=1,threads=1",
            "-chardev",
            "pty,id=charserial1",
            "-device",
            "isa-serial,chardev=charserial1,id=serial1",
            "-global",
            "driver=cfi.pflash01,property=secure,value=on",
        ]);
        args.push("-drive");
        args.push(pflash_drive(&config.ovmf_code, 0, VarsAccess::ReadOnly));
        args.push("-drive");
        args.push(pflash_drive(&config.vars, 1, phase.vars_access()));
        args.push_all([
            "-object",
            "rng-random,id=objrng0,filename=/dev/urandom",
            "-device",
            "virtio-rng-pci,rng=objrng0,id=rng0",
            "-serial",
            "stdio",
        ]);

        match phase {
            Phase::Enroll { shell_iso } => {
                args.push("-drive");
                let mut drive = OsString::from("file=");
                drive.push(shell_iso);
                drive.push(",format=raw,if=none,media=cdrom,id=drive-virtio-disk1,readonly=on");
                args.push(drive);
                args.push_all([
                    "-device",
                    "virtio-blk-pci,scsi=off,drive=drive-virtio-disk1,id=virtio-disk1,bootindex=1",
                ]);
            }
            Phase::Validate { kernel, initrd } => {
                args.push_all(["-append", "console=tty0 console=ttyS0,115200n8"]);
                args.push("-kernel");
                args.push(kernel);
                args.push("-initrd");
                args.push(initrd);
            }
        }

        Self {
            program: config.qemu_binary.clone(),
            args: args.0,
            phase: phase.name(),
        }
    }

    /// The QEMU binary.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The argument vector, not including the program.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// The name of the phase this invocation was built for.
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    /// Returns a [`Command`] with all three standard streams piped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[derive(Default)]
struct Args(Vec<OsString>);

impl Args {
    fn push(&mut self, arg: impl AsRef<OsStr>) {
        self.0.push(arg.as_ref().to_owned());
    }

    fn push_all<'a>(&mut self, args: impl IntoIterator<Item = &'a str>) {
        self.0.extend(args.into_iter().map(OsString::from));
    }
}

fn pflash_drive(file: &Path, unit: u8, access: VarsAccess) -> OsString {
    let mut drive = OsString::from("file=");
    drive.push(file);
    drive.push(format!(
        ",if=pflash,format=raw,unit={unit},readonly={}",
        access.readonly_value()
    ));
    drive
}

/// Spawns real QEMU processes.
#[derive(Debug, Default)]
pub struct QemuLauncher;

impl Launch for QemuLauncher {
    type Guest = QemuProcess;
    type Input = ChildStdin;
    type Output = ChildStdout;

    fn launch(
        &mut self,
        invocation: &QemuInvocation,
    ) -> io::Result<(QemuProcess, ChildStdin, ChildStdout)> {
        tracing::debug!(
            program = %invocation.program().display(),
            args = ?invocation.args(),
            "spawning qemu"
        );
        let mut child = invocation.command().spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Unreachable with piped stdio, but don't leave the child behind.
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("qemu standard streams were not captured"));
        };
        let stderr = child.stderr.take();
        tracing::info!(pid = child.id(), phase = invocation.phase(), "qemu started");
        Ok((QemuProcess { child, stderr }, stdin, stdout))
    }
}

/// A running QEMU child process.
#[derive(Debug)]
pub struct QemuProcess {
    child: Child,
    stderr: Option<ChildStderr>,
}

impl Terminate for QemuProcess {
    fn terminate(&mut self) -> io::Result<()> {
        tracing::debug!(pid = self.child.id(), "killing qemu");
        // The guest may already have exited on its own.
        if let Err(err) = self.child.kill() {
            if err.kind() != io::ErrorKind::InvalidInput {
                return Err(err);
            }
        }
        let status = self.child.wait()?;
        tracing::debug!(%status, "qemu exited");

        if let Some(mut stderr) = self.stderr.take() {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf)?;
            if !buf.is_empty() {
                tracing::debug!(stderr = %String::from_utf8_lossy(&buf), "qemu stderr");
            }
        }
        Ok(())
    }
}
